// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Where a transfer reads and writes its files
//!
//! Next to every file `dir/name` live two optional companions:
//! `dir/.md5/name` holds its identity digest and `dir/.lz/name` its
//! compressed container.

use std::path::{Path, PathBuf};

pub const DIGEST_DIR: &str = ".md5";
pub const CONTAINER_DIR: &str = ".lz";

/// Upload names ending in this are containers to decompress on arrival.
pub const CONTAINER_SUFFIX: &str = ".lz";

/// Firmware images carry no digest sidecar.
const FIRMWARE_IMAGE: &str = "firmware.bin";

fn companion(path: &Path, dir: &str) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    match path.file_name() {
        Some(name) => parent.join(dir).join(name),
        None => parent.join(dir),
    }
}

pub fn sidecar_path(path: &Path) -> PathBuf {
    companion(path, DIGEST_DIR)
}

pub fn container_path(path: &Path) -> PathBuf {
    companion(path, CONTAINER_DIR)
}

/// `dir/name.lz` becomes `dir/name`; anything else is `None`.
pub fn strip_container_suffix(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(CONTAINER_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(path.with_file_name(stem))
}

/// Creates the directory a file is about to be written into.
pub fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

// ============================================================================
// Upload / Download Layouts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPaths {
    /// The file the caller asked for
    pub target: PathBuf,
    /// Where packet payloads land; the container when compressed
    pub received: PathBuf,
    pub sidecar: Option<PathBuf>,
    pub compressed: bool,
}

impl UploadPaths {
    pub fn for_name(name: &Path) -> Self {
        let (target, received, compressed) = match strip_container_suffix(name) {
            Some(target) => {
                let received = container_path(&target);
                (target, received, true)
            }
            None => (name.to_path_buf(), name.to_path_buf(), false),
        };

        let is_firmware = target
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(FIRMWARE_IMAGE));
        let sidecar = (!is_firmware).then(|| sidecar_path(&target));

        UploadPaths { target, received, sidecar, compressed }
    }

    /// Files the transfer itself writes, in creation order. The decompressed
    /// target is not one of them; decompression cleans up after itself.
    pub fn outputs(&self) -> Vec<PathBuf> {
        let mut outputs = vec![self.received.clone()];
        outputs.extend(self.sidecar.clone());
        outputs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPaths {
    pub source: PathBuf,
    pub sidecar: PathBuf,
    /// Preferred over `source` when it exists
    pub compressed: PathBuf,
}

impl DownloadPaths {
    pub fn for_name(name: &Path) -> Self {
        DownloadPaths {
            source: name.to_path_buf(),
            sidecar: sidecar_path(name),
            compressed: container_path(name),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
