// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod logger;

use anyhow::{Context, bail};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use uioaxi::{BlockMode, Config, NO_MASK, Uio};

#[derive(Debug, Parser)]
#[clap(version, about)]
struct Uioctl {
    #[clap(subcommand)]
    cmd: Command,
    #[clap(flatten)]
    common: Common,
}

#[derive(Debug, Parser)]
struct Common {
    /// Enables verbose logging
    #[clap(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    /// Path to the device configuration file, in TOML.
    #[clap(short, long, global = true, env = "UIOCTL_CONFIG", default_value = "uioaxi.toml")]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reads a single register
    Read {
        #[clap(value_parser = parse_u32)]
        address: u32,
        /// Only print the bits selected by this mask, shifted down to bit 0
        #[clap(short, long, value_parser = parse_u32, default_value_t = NO_MASK)]
        mask: u32,
    },
    /// Writes a single register
    Write {
        #[clap(value_parser = parse_u32)]
        address: u32,
        #[clap(value_parser = parse_u32)]
        value: u32,
    },
    /// Reads a block of registers
    ReadBlock {
        #[clap(value_parser = parse_u32)]
        address: u32,
        #[clap(value_parser = parse_u32)]
        count: u32,
        /// Read every word from the same address
        #[clap(short, long)]
        non_incremental: bool,
    },
    /// Writes a block of registers
    WriteBlock {
        #[clap(value_parser = parse_u32)]
        address: u32,
        #[clap(value_parser = parse_u32, required = true)]
        values: Vec<u32>,
        /// Write every word to the same address
        #[clap(short, long)]
        non_incremental: bool,
    },
    /// Replaces a register with `(value & and) | or` and prints the read back value
    RmwBits {
        #[clap(value_parser = parse_u32)]
        address: u32,
        #[clap(value_parser = parse_u32)]
        and: u32,
        #[clap(value_parser = parse_u32)]
        or: u32,
    },
    /// Adds to a register and prints the read back value
    RmwSum {
        #[clap(value_parser = parse_u32)]
        address: u32,
        #[clap(value_parser = parse_i32, allow_hyphen_values = true)]
        addend: i32,
    },
    /// Lists the configured devices
    Devices,
}

fn main() {
    // must happen before any other thread is spawned so they all inherit the mask
    if let Err(err) = uioaxi::block_sigbus() {
        eprintln!("failed to block SIGBUS: {err}");
        process::exit(1);
    }

    let uioctl = Uioctl::parse();
    logger::init(uioctl.common.verbose);

    if let Err(err) = run(uioctl) {
        tracing::error!("{err:?}");
        process::exit(1);
    }
}

fn run(uioctl: Uioctl) -> anyhow::Result<()> {
    let config = Config::from_file(&uioctl.common.config).with_context(|| {
        format!(
            "failed to load configuration {}",
            uioctl.common.config.display()
        )
    })?;
    let devices = config
        .build_device_map()
        .context("failed to map devices")?;
    tracing::debug!(devices = devices.len(), "mapped devices");

    let mut uio = Uio::new(Arc::new(devices));

    match uioctl.cmd {
        Command::Read { address, mask } => {
            let word = uio.read(address, mask)?;
            uio.dispatch();
            println!("{:#010x}", word.value()?);
        }
        Command::Write { address, value } => {
            uio.write(address, value)?;
        }
        Command::ReadBlock {
            address,
            count,
            non_incremental,
        } => {
            let values = uio.read_block(address, count, block_mode(non_incremental))?;
            for (i, value) in (0..).zip(values) {
                let address = if non_incremental {
                    address
                } else {
                    address.wrapping_add(i)
                };
                println!("{address:#010x}: {value:#010x}");
            }
        }
        Command::WriteBlock {
            address,
            values,
            non_incremental,
        } => {
            uio.write_block(address, &values, block_mode(non_incremental))?;
        }
        Command::RmwBits { address, and, or } => {
            println!("{:#010x}", uio.rmw_bits(address, and, or)?);
        }
        Command::RmwSum { address, addend } => {
            println!("{:#010x}", uio.rmw_sum(address, addend)?);
        }
        Command::Devices => {
            if uio.device_map().is_empty() {
                bail!("no devices configured in {}", uioctl.common.config.display());
            }
            for device in uio.device_map().iter() {
                let window = device.window();
                println!(
                    "{:<16} {:#010x}..{:#010x} ({} words)",
                    device.name().unwrap_or("-"),
                    window.start,
                    window.end,
                    device.size()
                );
            }
        }
    }

    Ok(())
}

fn block_mode(non_incremental: bool) -> BlockMode {
    if non_incremental {
        BlockMode::NonIncremental
    } else {
        BlockMode::Incremental
    }
}

/// Parses `0x` prefixed hexadecimal or decimal numbers.
fn parse_u32(s: &str) -> anyhow::Result<u32> {
    let s = s.replace('_', "");
    let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    value.with_context(|| format!("invalid number `{s}`"))
}

/// Like [`parse_u32`] with an optional sign. Hexadecimal values above `i32::MAX` wrap, so
/// `0xFFFFFFFF` is `-1`.
fn parse_i32(s: &str) -> anyhow::Result<i32> {
    match s.strip_prefix('-') {
        Some(magnitude) => {
            let magnitude = i64::from(parse_u32(magnitude)?);
            i32::try_from(-magnitude).with_context(|| format!("`{s}` is out of range"))
        }
        None => Ok(parse_u32(s.strip_prefix('+').unwrap_or(s))?.cast_signed()),
    }
}
