//! Unpacking a source package into a throwaway directory.
//!
//! Packages arrive as a gzipped tarball, a plain tarball, a gzipped single file, or a bare
//! `.tex` file. Archive entries that would land outside the workspace reject the whole package.

use std::io::{Cursor, Read};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

use crate::application::sandbox::SandboxError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";

/// How the staged package was laid out, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageLayout {
    Tarball,
    SingleFile,
}

/// Blocking: call from `spawn_blocking`. A gzip stream that inflates past `max_unpacked`
/// bytes is rejected as corrupted.
pub fn unpack(
    dir: &Path,
    source_id: &str,
    bytes: &[u8],
    max_unpacked: u64,
) -> Result<PackageLayout, SandboxError> {
    if bytes.is_empty() {
        return Err(SandboxError::Corrupted("source package is empty".to_string()));
    }

    let payload = if bytes.starts_with(&GZIP_MAGIC) {
        let mut decoded = Vec::new();
        GzDecoder::new(bytes)
            .take(max_unpacked.saturating_add(1))
            .read_to_end(&mut decoded)
            .map_err(|err| SandboxError::Corrupted(format!("invalid gzip stream: {err}")))?;
        if decoded.len() as u64 > max_unpacked {
            return Err(SandboxError::Corrupted(format!(
                "package inflates past {max_unpacked} bytes"
            )));
        }
        decoded
    } else {
        bytes.to_vec()
    };

    if is_tarball(&payload) {
        extract_tarball(dir, &payload)?;
        Ok(PackageLayout::Tarball)
    } else {
        std::fs::write(dir.join(single_file_name(source_id)), &payload)?;
        Ok(PackageLayout::SingleFile)
    }
}

fn is_tarball(bytes: &[u8]) -> bool {
    bytes
        .get(USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len())
        .is_some_and(|magic| magic == USTAR_MAGIC)
}

fn single_file_name(source_id: &str) -> String {
    format!("{source_id}.tex")
}

fn extract_tarball(dir: &Path, bytes: &[u8]) -> Result<(), SandboxError> {
    let mut archive = Archive::new(Cursor::new(bytes));
    archive.set_preserve_permissions(false);

    let entries = archive
        .entries()
        .map_err(|err| SandboxError::Corrupted(format!("unreadable archive: {err}")))?;

    let mut files = 0usize;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| SandboxError::Corrupted(format!("unreadable entry: {err}")))?;

        let path = entry
            .path()
            .map_err(|err| SandboxError::Corrupted(format!("invalid entry path: {err}")))?
            .into_owned();
        if !is_contained(&path) {
            return Err(SandboxError::Corrupted(format!(
                "entry `{}` escapes the workspace",
                path.display()
            )));
        }

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Directory | EntryType::Continuous => {}
            EntryType::Symlink | EntryType::Link => {
                return Err(SandboxError::Corrupted(format!(
                    "entry `{}` is a link",
                    path.display()
                )));
            }
            _ => continue,
        }

        let unpacked = entry
            .unpack_in(dir)
            .map_err(|err| SandboxError::Corrupted(format!("failed to extract entry: {err}")))?;
        if !unpacked {
            return Err(SandboxError::Corrupted(format!(
                "entry `{}` escapes the workspace",
                path.display()
            )));
        }
        if entry.header().entry_type() != EntryType::Directory {
            files += 1;
        }
    }

    if files == 0 {
        return Err(SandboxError::Corrupted(
            "archive contains no files".to_string(),
        ));
    }
    Ok(())
}

fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
