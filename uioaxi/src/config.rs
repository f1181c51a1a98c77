// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{DeviceMap, Error, MappedDevice};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use uio::{Mapping, UioDevice};

/// Device table, usually read from a TOML file.
///
/// ```toml
/// [[device]]
/// name = "PL_MEM"
/// base = 0x1000
/// uio = "/dev/uio0"
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "device", default)]
    pub devices: Vec<DeviceConfig>,
    /// The file this configuration was read from, if any
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceConfig {
    /// Name used in log output and listings
    pub name: String,
    /// First word address of the device in the flat address space
    pub base: u32,
    /// Path of the UIO device node, e.g. `/dev/uio0`
    pub uio: Option<PathBuf>,
    /// Name of the UIO device as found in `/sys/class/uio/*/name`
    pub uio_name: Option<String>,
    /// Plain file mapped in place of a device, for running without hardware
    pub file: Option<PathBuf>,
    /// Size of the device in words. Defaults to the size of the UIO memory region, required for
    /// `file` devices.
    pub size: Option<u32>,
    /// Index of the UIO memory region to map
    #[serde(default)]
    pub map: usize,
}

enum Source<'a> {
    Uio(&'a Path),
    UioName(&'a str),
    File(&'a Path),
}

impl Config {
    /// Reads and validates the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file can't be read, can't be parsed or is invalid.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let str = fs::read_to_string(path).map_err(|err| Error::Config {
            path: path.to_path_buf(),
            message: format!("failed to read configuration file: {err}"),
        })?;

        let mut config = Self::parse(&str).map_err(|err| match err {
            Error::Config { message, .. } => Error::Config {
                path: path.to_path_buf(),
                message,
            },
            err => err,
        })?;
        config.config_path = Some(path.to_path_buf());

        Ok(config)
    }

    /// Parses and validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `str` is not valid TOML, has unknown keys or describes an
    /// invalid device table.
    pub fn parse(str: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(str).map_err(|err| Error::Config {
            path: PathBuf::new(),
            message: format!("failed to parse configuration: {err}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::Result<()> {
        let mut names = HashSet::new();
        let mut bases = HashSet::new();

        for device in &self.devices {
            device.source()?;

            if device.file.is_some() && device.size.is_none() {
                return Err(self.invalid(format!(
                    "device `{}` is file backed but has no size",
                    device.name
                )));
            }
            if device.size == Some(0) {
                return Err(self.invalid(format!("device `{}` has size 0", device.name)));
            }
            if !names.insert(device.name.as_str()) {
                return Err(self.invalid(format!("duplicate device name `{}`", device.name)));
            }
            if !bases.insert(device.base) {
                return Err(self.invalid(format!(
                    "device `{}` reuses base address {:#010x}",
                    device.name, device.base
                )));
            }
        }

        Ok(())
    }

    fn invalid(&self, message: String) -> Error {
        Error::Config {
            path: self.config_path.clone().unwrap_or_default(),
            message,
        }
    }

    /// Opens and maps every configured device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Uio`] if a device can't be opened or mapped, and [`Error::EmptyDevice`] or
    /// [`Error::MappingTooSmall`] if the mapping doesn't match the configured size.
    pub fn build_device_map(&self) -> crate::Result<DeviceMap> {
        self.devices.iter().map(DeviceConfig::open).collect()
    }
}

impl DeviceConfig {
    fn source(&self) -> crate::Result<Source<'_>> {
        match (&self.uio, &self.uio_name, &self.file) {
            (Some(path), None, None) => Ok(Source::Uio(path)),
            (None, Some(name), None) => Ok(Source::UioName(name)),
            (None, None, Some(path)) => Ok(Source::File(path)),
            _ => Err(Error::Config {
                path: PathBuf::new(),
                message: format!(
                    "device `{}` needs exactly one of `uio`, `uio-name` or `file`",
                    self.name
                ),
            }),
        }
    }

    /// Opens and maps this device.
    ///
    /// # Errors
    ///
    /// See [`Config::build_device_map`].
    pub fn open(&self) -> crate::Result<MappedDevice> {
        let (mapping, default_size) = match self.source()? {
            Source::Uio(path) => self.map_uio(&UioDevice::open(path)?)?,
            Source::UioName(name) => self.map_uio(&UioDevice::find_by_name(name)?)?,
            Source::File(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|source| uio::Error::Io {
                        path: path.to_path_buf(),
                        source,
                    })?;
                let size = self.size.unwrap_or_default();
                let len = usize::try_from(size)
                    .ok()
                    .and_then(|words| words.checked_mul(size_of::<u32>()))
                    .ok_or(Error::MappingTooSmall {
                        base: self.base,
                        size,
                        mapped: 0,
                    })?;
                (Mapping::shared(&file, 0, len)?, size)
            }
        };

        let size = self.size.unwrap_or(default_size);
        let device = MappedDevice::with_size(self.base, mapping, size)?.named(&self.name);
        Ok(device)
    }

    fn map_uio(&self, device: &UioDevice) -> crate::Result<(Mapping, u32)> {
        let mapping = device.map(self.map)?;
        let words = u32::try_from(mapping.len() / size_of::<u32>()).unwrap_or(u32::MAX);
        Ok((mapping, words))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_devices() {
        let config = Config::parse(
            r#"
            [[device]]
            name = "PL_MEM"
            base = 0x0000_1000
            uio = "/dev/uio0"

            [[device]]
            name = "DMA"
            base = 0x4000
            uio-name = "axi-dma"
            size = 0x40
            map = 1
            "#,
        )
        .unwrap();

        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].name, "PL_MEM");
        assert_eq!(config.devices[0].base, 0x1000);
        assert_eq!(config.devices[0].uio, Some(PathBuf::from("/dev/uio0")));
        assert_eq!(config.devices[0].map, 0);
        assert_eq!(config.devices[1].uio_name.as_deref(), Some("axi-dma"));
        assert_eq!(config.devices[1].size, Some(0x40));
        assert_eq!(config.devices[1].map, 1);
    }

    #[test]
    fn empty_config() {
        let config = Config::parse("").unwrap();
        assert!(config.devices.is_empty());
        assert!(config.build_device_map().unwrap().is_empty());
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = Config::parse(
            r#"
            [[device]]
            name = "PL_MEM"
            base = 0x1000
            uio = "/dev/uio0"
            irq = 5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn rejects_ambiguous_sources() {
        for source in ["", "uio = \"/dev/uio0\"\nuio-name = \"mem\""] {
            let str = format!("[[device]]\nname = \"x\"\nbase = 0\n{source}\n");
            assert!(matches!(Config::parse(&str), Err(Error::Config { .. })));
        }
    }

    #[test]
    fn rejects_duplicates() {
        let err = Config::parse(
            r#"
            [[device]]
            name = "a"
            base = 0x1000
            uio = "/dev/uio0"

            [[device]]
            name = "b"
            base = 0x1000
            uio = "/dev/uio1"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("0x00001000"), "{err}");
    }

    #[test]
    fn file_device_requires_size() {
        let str = "[[device]]\nname = \"x\"\nbase = 0\nfile = \"/tmp/x\"\n";
        assert!(Config::parse(str).is_err());
    }

    #[test]
    fn builds_file_backed_device() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&0xCAFE_BABEu32.to_ne_bytes()).unwrap();
        file.as_file().set_len(0x400).unwrap();

        let str = format!(
            "[[device]]\nname = \"sim\"\nbase = 0x1000\nfile = {:?}\nsize = 0x100\n",
            file.path().display().to_string()
        );
        let map = Config::parse(&str).unwrap().build_device_map().unwrap();

        let device = map.get(0x1000).unwrap();
        assert_eq!(device.name(), Some("sim"));
        assert_eq!(device.window(), 0x1000..0x1100);
        // Safety: the mapping is live and at least one word long
        assert_eq!(unsafe { device.word_ptr(0).read_volatile() }, 0xCAFE_BABE);
    }

    #[test]
    fn from_file_records_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[device]]\nname = \"x\"\nbase = 0\nfile = \"/dev/null\"").unwrap();

        match Config::from_file(file.path()) {
            Err(Error::Config { path, .. }) => assert_eq!(path, file.path()),
            res => panic!("unexpected {res:?}"),
        }
    }
}
