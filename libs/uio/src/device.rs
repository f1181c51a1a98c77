// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Error, Mapping};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/uio";

/// One memory region of a UIO device, as described by `maps/mapN` in sysfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapInfo {
    pub index: usize,
    /// Physical address of the region.
    pub addr: u64,
    /// Size of the region in bytes.
    pub size: usize,
    /// Offset of the device registers within the first mapped page.
    pub offset: u64,
}

/// An open `/dev/uioN` device file.
#[derive(Debug)]
pub struct UioDevice {
    path: PathBuf,
    name: String,
    file: File,
    maps: Vec<MapInfo>,
}

impl UioDevice {
    /// Opens the device node at `path` (e.g. `/dev/uio0`).
    ///
    /// # Errors
    ///
    /// Returns an error if the device node or its sysfs attributes can't be read.
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        Self::open_with_sysfs(path, DEFAULT_SYSFS_ROOT)
    }

    /// Like [`open`](Self::open) but reads the device attributes from `sysfs_root` instead of
    /// `/sys/class/uio`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device node or its sysfs attributes can't be read.
    pub fn open_with_sysfs(
        path: impl AsRef<Path>,
        sysfs_root: impl AsRef<Path>,
    ) -> crate::Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let node = path.file_name().ok_or_else(|| Error::NotFound {
            name: path.display().to_string(),
        })?;
        let sysfs = sysfs_root.as_ref().join(node);

        let name = read_attr(&sysfs.join("name"))?;
        let maps = read_maps(&sysfs.join("maps"))?;

        tracing::debug!(path = %path.display(), name = %name, maps = maps.len(), "opened UIO device");

        Ok(Self {
            path: path.to_path_buf(),
            name,
            file,
            maps,
        })
    }

    /// Finds the device whose sysfs `name` attribute equals `name` and opens it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no device carries that name, or any error of
    /// [`open`](Self::open).
    pub fn find_by_name(name: &str) -> crate::Result<Self> {
        Self::find_by_name_in(name, DEFAULT_SYSFS_ROOT, "/dev")
    }

    /// Like [`find_by_name`](Self::find_by_name) with custom sysfs and device directories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no device carries that name, or any error of
    /// [`open`](Self::open).
    pub fn find_by_name_in(
        name: &str,
        sysfs_root: impl AsRef<Path>,
        dev_root: impl AsRef<Path>,
    ) -> crate::Result<Self> {
        let sysfs_root = sysfs_root.as_ref();

        let entries = fs::read_dir(sysfs_root).map_err(|source| Error::Io {
            path: sysfs_root.to_path_buf(),
            source,
        })?;

        let mut nodes: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name())
            .collect();
        nodes.sort();

        for node in nodes {
            let Ok(candidate) = read_attr(&sysfs_root.join(&node).join("name")) else {
                continue;
            };
            if candidate == name {
                return Self::open_with_sysfs(dev_root.as_ref().join(node), sysfs_root);
            }
        }

        Err(Error::NotFound {
            name: name.to_string(),
        })
    }

    /// Maps memory region `index` of this device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchMap`] if the device has no such region, [`Error::InvalidMapInfo`] if
    /// its offset and size don't fit the address space and [`Error::Mmap`] if mapping fails.
    pub fn map(&self, index: usize) -> crate::Result<Mapping> {
        let info = self.map_info(index).ok_or_else(|| Error::NoSuchMap {
            device: self.path.clone(),
            index,
        })?;

        let invalid = || Error::InvalidMapInfo {
            path: self.path.clone(),
            contents: format!("map{index} offset {:#x} size {:#x}", info.offset, info.size),
        };

        // UIO selects the region through the page offset of the mapping
        let file_offset = index
            .checked_mul(crate::host_page_size())
            .and_then(|offset| u64::try_from(offset).ok())
            .ok_or(Error::NoSuchMap {
                device: self.path.clone(),
                index,
            })?;

        // The mapping starts at the page containing the registers, they begin `offset` bytes in.
        let offset = usize::try_from(info.offset).map_err(|_| invalid())?;
        let len = offset.checked_add(info.size).ok_or_else(invalid)?;

        Mapping::shared(&self.file, file_offset, len)?.with_offset(offset)
    }

    pub fn map_info(&self, index: usize) -> Option<&MapInfo> {
        self.maps.iter().find(|info| info.index == index)
    }

    pub fn maps(&self) -> &[MapInfo] {
        &self.maps
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_attr(path: &Path) -> crate::Result<String> {
    fs::read_to_string(path)
        .map(|contents| contents.trim().to_string())
        .map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn read_number(path: &Path) -> crate::Result<u64> {
    let contents = read_attr(path)?;

    let parsed = match contents.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => contents.parse(),
    };

    parsed.map_err(|_| Error::InvalidMapInfo {
        path: path.to_path_buf(),
        contents,
    })
}

fn read_maps(dir: &Path) -> crate::Result<Vec<MapInfo>> {
    // a device without memory regions has no `maps` directory at all
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(Vec::new());
    };

    let mut maps = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let file_name = entry.file_name();
        let Some(index) = file_name
            .to_str()
            .and_then(|name| name.strip_prefix("map"))
            .and_then(|index| index.parse().ok())
        else {
            continue;
        };

        let path = entry.path();
        let size_path = path.join("size");
        let size = usize::try_from(read_number(&size_path)?).map_err(|_| Error::InvalidMapInfo {
            path: size_path,
            contents: "size exceeds the address space".to_string(),
        })?;

        maps.push(MapInfo {
            index,
            addr: read_number(&path.join("addr"))?,
            size,
            offset: read_number(&path.join("offset")).unwrap_or(0),
        });
    }
    maps.sort_by_key(|info| info.index);

    Ok(maps)
}
