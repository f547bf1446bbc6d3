//! Archive extraction with a path-traversal guard.
//!
//! `.zip` archives are extracted directly; `.crx` packages are unwrapped
//! first (magic `Cr24`, versions 2 and 3) and their inner ZIP extracted.

use std::io::Cursor;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Error;
use crate::error::Result;

const CRX_MAGIC: &[u8; 4] = b"Cr24";

/// How the package arrived, as recorded on the installed package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ArchiveKind {
    /// Plain ZIP archive.
    #[serde(rename = "file-zip")]
    Zip,
    /// Chrome CRX wrapper around a ZIP.
    #[serde(rename = "file-crx")]
    Crx,
}

/// Payload unwrapped from a CRX container.
#[derive(Debug)]
pub struct CrxPayload {
    /// DER public key. Only CRX2 carries it in the clear; CRX3 keys live in
    /// a protobuf header this installer does not parse.
    pub public_key: Option<Vec<u8>>,
    /// The inner ZIP archive.
    pub zip: Vec<u8>,
}

/// Extract `path` into `staging`, dispatching on the CRX magic. Returns how
/// the archive was interpreted.
pub fn extract_archive(path: &Path, staging: &Path) -> Result<ArchiveKind> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::ArchiveInvalid(format!("{}: {e}", path.display())))?;

    if bytes.len() >= 4 && &bytes[..4] == CRX_MAGIC {
        let payload = unwrap_crx(&bytes)?;
        extract_zip(&payload.zip, staging)?;
        return Ok(ArchiveKind::Crx);
    }
    extract_zip(&bytes, staging)?;
    Ok(ArchiveKind::Zip)
}

/// Unwrap a CRX2 or CRX3 container into its inner ZIP.
pub fn unwrap_crx(bytes: &[u8]) -> Result<CrxPayload> {
    if bytes.len() < 16 || &bytes[..4] != CRX_MAGIC {
        return Err(Error::ArchiveInvalid("not a CRX package".to_string()));
    }
    let version = read_u32(bytes, 4)?;
    match version {
        2 => {
            let key_len = read_u32(bytes, 8)? as usize;
            let sig_len = read_u32(bytes, 12)? as usize;
            let key_start = 16usize;
            let zip_start = key_start
                .checked_add(key_len)
                .and_then(|n| n.checked_add(sig_len))
                .ok_or_else(|| Error::ArchiveInvalid("CRX2 header overflow".to_string()))?;
            if bytes.len() < zip_start {
                return Err(Error::ArchiveInvalid("truncated CRX2 package".to_string()));
            }
            Ok(CrxPayload {
                public_key: Some(bytes[key_start..key_start + key_len].to_vec()),
                zip: bytes[zip_start..].to_vec(),
            })
        }
        3 => {
            let header_len = read_u32(bytes, 8)? as usize;
            let zip_start = 12usize
                .checked_add(header_len)
                .ok_or_else(|| Error::ArchiveInvalid("CRX3 header overflow".to_string()))?;
            if bytes.len() < zip_start {
                return Err(Error::ArchiveInvalid("truncated CRX3 package".to_string()));
            }
            Ok(CrxPayload {
                public_key: None,
                zip: bytes[zip_start..].to_vec(),
            })
        }
        other => Err(Error::ArchiveInvalid(format!(
            "unsupported CRX version {other}"
        ))),
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| Error::ArchiveInvalid("truncated header".to_string()))
}

/// Resolve an archive entry name under `root`.
///
/// Absolute names, empty names and any `..` component fail the whole
/// extraction with [Error::ArchiveUnsafePath].
pub fn safe_join(root: &Path, entry_name: &str) -> Result<PathBuf> {
    let entry = Path::new(entry_name);
    let mut resolved = root.to_path_buf();
    let mut pushed = false;
    for component in entry.components() {
        match component {
            std::path::Component::Normal(part) => {
                resolved.push(part);
                pushed = true;
            }
            std::path::Component::CurDir => {}
            _ => return Err(Error::ArchiveUnsafePath(entry_name.to_string())),
        }
    }
    if !pushed {
        return Err(Error::ArchiveUnsafePath(entry_name.to_string()));
    }
    Ok(resolved)
}

fn extract_zip(bytes: &[u8], staging: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::ArchiveInvalid(e.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| Error::ArchiveInvalid(e.to_string()))?;
        let name = entry.name().to_string();
        let destination = safe_join(staging, &name)?;

        if entry.is_dir() {
            std::fs::create_dir_all(&destination)?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .map_err(|e| Error::ArchiveInvalid(format!("{name}: {e}")))?;
        std::fs::write(&destination, contents)?;
    }
    Ok(())
}
