//! Filesystem helpers shared by the fetcher, installer and record writers.
//!
//! Every write that another stage may observe goes through a scratch path
//! followed by a single `rename`, so readers see either the old or the new
//! content and never a partial file.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::manifest::ArtifactFormat;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique scratch name; unique across threads and processes sharing a directory.
pub(crate) fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{n}-{seq}", std::process::id())
}

/// Move `src` to `dst` with a single rename.
///
/// Callers keep `src` on the same filesystem as `dst`; there is no
/// copy-then-delete fallback because that would expose a partial `dst`.
pub(crate) fn rename_into_place(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::rename(src, dst)
        .with_context(|| format!("Failed to rename {} to {}", src.display(), dst.display()))
}

/// Write `bytes` to `path` through a scratch file in `tmp_dir`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], tmp_dir: &Path) -> Result<()> {
    fs::create_dir_all(tmp_dir)
        .with_context(|| format!("Failed to create {}", tmp_dir.display()))?;
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("record");
    let tmp = tmp_dir.join(tmp_name(file_name));
    let result = (|| -> Result<()> {
        let mut f =
            File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
        rename_into_place(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Take a blocking exclusive lock on `path`, creating the file if needed.
///
/// The lock is released when the returned file is dropped.
pub(crate) fn lock_exclusive(path: &Path) -> Result<File> {
    let file = open_lock_file(path)?;
    file.lock_exclusive()
        .with_context(|| format!("Failed to lock {}", path.display()))?;
    Ok(file)
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    // Never unlink lock files. Removing a still-locked file lets a second
    // process create a fresh file at the same path and lock that instead.
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to create lock file: {}", path.display()))?;
    Ok(file)
}

pub(crate) fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub(crate) fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Remove a file, symlink or directory tree.
pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let md = fs::symlink_metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    if md.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("Failed to remove {}", path.display()))
}

pub(crate) fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Materialize a cached blob into the (fresh) directory `dest_dir`.
///
/// - `ArtifactFormat::File`: copied as `dest_dir/<file_name>`.
/// - `ArtifactFormat::Tar` / `TarZst`: unpacked into `dest_dir`.
pub(crate) fn unpack(
    format: ArtifactFormat,
    blob: &Path,
    dest_dir: &Path,
    file_name: &str,
) -> Result<()> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

    match format {
        ArtifactFormat::File => {
            if file_name.is_empty() || file_name.contains('/') || file_name == ".." {
                bail!("unsafe file name '{file_name}' for {}", blob.display());
            }
            let dest = dest_dir.join(file_name);
            fs::copy(blob, &dest).with_context(|| {
                format!("Failed to copy {} to {}", blob.display(), dest.display())
            })?;
        }
        ArtifactFormat::Tar => {
            let f = File::open(blob)?;
            let mut archive = tar::Archive::new(BufReader::new(f));
            archive
                .unpack(dest_dir)
                .with_context(|| format!("Failed to unpack {}", blob.display()))?;
        }
        ArtifactFormat::TarZst => {
            let f = File::open(blob)?;
            let decoder = zstd::stream::Decoder::new(f)?;
            let mut archive = tar::Archive::new(decoder);
            archive
                .unpack(dest_dir)
                .with_context(|| format!("Failed to unpack {}", blob.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::fs::File;
    use std::path::Path;

    /// Write a tar.zst archive holding `(relative path, contents)` entries.
    pub(crate) fn write_tar_zst(out: &Path, entries: &[(&str, &[u8])]) {
        let f = File::create(out).unwrap();
        let encoder = zstd::stream::Encoder::new(f, 3).unwrap();
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }
}
