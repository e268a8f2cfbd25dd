//! Checksum and filesystem utilities (component A).
//!
//! A single 128-bit digest, rendered as 32 lowercase hex characters, is used
//! everywhere a checksum is needed: the manifest, `params`, and input-file
//! fingerprints all agree bit-for-bit because they all go through
//! [`hash_bytes`] or [`hash_file`].

use md5::{Digest, Md5};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Hash a byte slice, returning a 32-character lowercase hex digest.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hash the contents of a file, returning a 32-character lowercase hex digest.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

/// Create `path` and all of its parent directories if they do not exist.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Write `bytes` to `path` atomically: write to `path.tmp`, fsync, then
/// rename over `path`. On Unix the containing directory is fsynced after
/// the rename so the rename itself survives a crash.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = tmp_path_for(path);

    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }

    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    std::path::PathBuf::from(name)
}
