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

//! Identity digests: MD5 as 32 lowercase hex characters

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::host::IdleNotifier;
use crate::protocol::IDENTITY_LEN;

const HASH_CHUNK: usize = 8192;

/// True for exactly 32 ASCII hex digits.
pub fn is_identity(text: &[u8]) -> bool {
    text.len() == IDENTITY_LEN && text.iter().all(u8::is_ascii_hexdigit)
}

/// Hashes a whole file, calling `idle` after every chunk.
pub fn hash_file(path: &Path, idle: &dyn IdleNotifier) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; HASH_CHUNK];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
        idle.on_idle();
    }

    let digest = hex::encode(hasher.finalize());
    debug!("Hashed {}: {}", path.display(), digest);
    Ok(digest)
}

/// Reads a digest sidecar. A missing or malformed sidecar is `None`.
pub fn read_sidecar(path: &Path) -> std::io::Result<Option<String>> {
    let text = match std::fs::read(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let digest = text.trim_ascii();
    if !is_identity(digest) {
        warn!("Ignoring malformed digest sidecar {}", path.display());
        return Ok(None);
    }

    Ok(Some(String::from_utf8_lossy(digest).into_owned()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoIdle;
    use std::cell::Cell;

    #[test]
    fn test_hash_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(hash_file(&path, &NoIdle).unwrap(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_hash_notifies_idle_per_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![7u8; HASH_CHUNK * 3]).unwrap();

        let calls = Cell::new(0);
        let idle = || calls.set(calls.get() + 1);
        hash_file(&path, &idle).unwrap();
        assert!(calls.get() >= 3);
    }

    #[test]
    fn test_sidecar_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.nc");

        assert_eq!(read_sidecar(&path).unwrap(), None);

        std::fs::write(&path, b"900150983cd24fb0d6963f7d28e17f72\n").unwrap();
        assert_eq!(
            read_sidecar(&path).unwrap().as_deref(),
            Some("900150983cd24fb0d6963f7d28e17f72")
        );

        std::fs::write(&path, b"not a digest").unwrap();
        assert_eq!(read_sidecar(&path).unwrap(), None);
    }

    #[test]
    fn test_is_identity() {
        assert!(is_identity(b"0123456789abcdef0123456789ABCDEF"));
        assert!(!is_identity(b"0123456789abcdef"));
        assert!(!is_identity(b"0123456789abcdef0123456789abcdeg"));
    }
}
