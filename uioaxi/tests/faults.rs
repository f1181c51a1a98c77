// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod common;

use std::sync::Arc;
use std::thread;
use uio::Mapping;
use uioaxi::{BlockMode, DeviceMap, Error, MappedDevice, NO_MASK, Uio};

/// A device backed by a file that is truncated after mapping. Every access to the truncated part
/// raises SIGBUS.
struct Truncated {
    _file: tempfile::NamedTempFile,
    uio: Uio,
}

/// Maps two pages of a file at `0x1000` and truncates the file to `keep` bytes.
fn truncated(keep: u64) -> Truncated {
    uioaxi::block_sigbus().unwrap();

    let page = uio::host_page_size();
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(2 * page as u64).unwrap();

    let mapping = Mapping::shared(file.as_file(), 0, 2 * page).unwrap();
    let device = MappedDevice::new(0x1000, mapping).unwrap();
    file.as_file().set_len(keep).unwrap();

    let map: DeviceMap = [device, common::anonymous(0x8000, 0x10)]
        .into_iter()
        .collect();

    Truncated {
        _file: file,
        uio: Uio::new(Arc::new(map)),
    }
}

fn words_per_page() -> u32 {
    u32::try_from(uio::host_page_size() / size_of::<u32>()).unwrap()
}

#[test_log::test]
fn bus_error_is_reported() {
    let Truncated { _file, mut uio } = truncated(0);

    match uio.read(0x1000, NO_MASK) {
        Err(Error::AccessFault { address, message }) => {
            assert_eq!(address, 0x1000);
            assert_eq!(message, "Reg: 0x00001000");
        }
        res => panic!("unexpected {res:?}"),
    }
    assert!(matches!(
        uio.write(0x1004, 1),
        Err(Error::AccessFault { address: 0x1004, .. })
    ));
    assert!(matches!(
        uio.rmw_bits(0x1008, 0, 1),
        Err(Error::AccessFault { address: 0x1008, .. })
    ));
    // failed reads are never queued
    assert_eq!(uio.pending(), 0);
}

#[test_log::test]
fn process_survives_bus_errors() {
    let Truncated { _file, mut uio } = truncated(0);

    for _ in 0..16 {
        assert!(matches!(
            uio.read(0x1000, NO_MASK),
            Err(Error::AccessFault { .. })
        ));

        uio.write(0x8000, 0xCAFE_BABE).unwrap();
        let word = uio.read(0x8000, NO_MASK).unwrap();
        uio.dispatch();
        assert_eq!(word.value().unwrap(), 0xCAFE_BABE);
    }
}

#[test_log::test]
fn partially_truncated_device() {
    let page = uio::host_page_size();
    let Truncated { _file, mut uio } = truncated(page as u64);
    let second_page = 0x1000 + words_per_page();

    uio.write(second_page - 1, 7).unwrap();
    assert_eq!(uio.rmw_sum(second_page - 1, 1).unwrap(), 8);

    assert!(matches!(
        uio.write(second_page, 1),
        Err(Error::AccessFault { address, .. }) if address == second_page
    ));

    // the block faults half way, reporting the word that faulted
    match uio.read_block(second_page - 2, 4, BlockMode::Incremental) {
        Err(Error::AccessFault { address, .. }) => assert_eq!(address, second_page),
        res => panic!("unexpected {res:?}"),
    }
}

#[test_log::test]
fn faults_on_other_threads() {
    let Truncated { _file, uio } = truncated(0);
    let devices = uio.device_map().clone();

    let handles: Vec<_> = (0..4u32)
        .map(|i| {
            let devices = devices.clone();
            thread::spawn(move || {
                uioaxi::block_sigbus().unwrap();
                let mut uio = Uio::new(devices);

                for _ in 0..50 {
                    assert!(matches!(
                        uio.write(0x1000 + i, i),
                        Err(Error::AccessFault { .. })
                    ));
                    uio.write(0x8000 + i, i).unwrap();
                    assert_eq!(uio.rmw_sum(0x8000 + i, 0).unwrap(), i);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test_log::test]
fn concurrent_engines_share_devices() {
    let devices = Arc::new(common::device_map(&[(0x1000, 0x100)]));

    let handles: Vec<_> = (0..8u32)
        .map(|i| {
            let devices = devices.clone();
            thread::spawn(move || {
                uioaxi::block_sigbus().unwrap();
                let mut uio = Uio::new(devices);
                let address = 0x1000 + i * 0x10;

                for n in 0..100 {
                    uio.write(address, n).unwrap();
                    assert_eq!(uio.rmw_sum(address, 1).unwrap(), n + 1);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    uioaxi::block_sigbus().unwrap();
    let mut uio = Uio::new(devices);
    let values = uio.read_block(0x1000, 0x80, BlockMode::Incremental).unwrap();
    for (i, value) in values.iter().enumerate() {
        let expected = if i % 0x10 == 0 { 100 } else { 0 };
        assert_eq!(*value, expected, "word {i:#x}");
    }
}

#[test_log::test]
fn sigbus_must_be_blocked() {
    let devices = Arc::new(common::device_map(&[(0x1000, 0x10)]));

    thread::spawn(move || {
        // Safety: sigset manipulation on a local set
        unsafe {
            let mut set = core::mem::zeroed::<libc::sigset_t>();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGBUS);
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, core::ptr::null_mut());
        }

        let mut uio = Uio::new(devices);
        assert!(matches!(
            uio.write(0x1000, 1),
            Err(Error::Guard(sigbus_guard::Error::SignalNotBlocked))
        ));
    })
    .join()
    .unwrap();
}
