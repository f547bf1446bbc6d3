//! Manifest discovery, version normalization and deterministic ids.

use std::path::Path;
use std::path::PathBuf;

use lazy_static::lazy_static;
use sha2::Digest;
use sha2::Sha256;

use crate::error::Error;
use crate::error::Result;

/// Manifest file names, in discovery order. The first that exists and
/// parses as valid JSON wins.
pub const MANIFEST_CANDIDATES: [&str; 7] = [
    "manifest.json",
    "manifest.chromium.json",
    "manifest.chrome.json",
    "manifest.chrome-mv3.json",
    "manifest.mv3.json",
    "manifest.v3.json",
    "manifest.firefox.json",
];

lazy_static! {
    static ref DOTTED_NUMERIC: regex::Regex = regex::Regex::new(r"^\d+(\.\d+)*$").unwrap();
}

/// A discovered manifest.
#[derive(Debug)]
pub struct DiscoveredManifest {
    /// File name it was read from, one of [MANIFEST_CANDIDATES].
    pub file_name: String,
    /// Parsed contents.
    pub value: serde_json::Value,
    /// Warnings raised during discovery.
    pub warnings: Vec<String>,
}

/// Walk [MANIFEST_CANDIDATES] under `root`.
pub fn discover(root: &Path) -> Result<DiscoveredManifest> {
    let mut parse_error = None;
    for candidate in MANIFEST_CANDIDATES {
        let path = root.join(candidate);
        if !path.is_file() {
            continue;
        }
        let bytes = std::fs::read(&path)?;
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) if value.is_object() => {
                let mut warnings = vec![];
                if candidate == "manifest.firefox.json" {
                    warnings.push(
                        "Using manifest.firefox.json; Firefox-only fields may not apply"
                            .to_string(),
                    );
                }
                return Ok(DiscoveredManifest {
                    file_name: candidate.to_string(),
                    value,
                    warnings,
                });
            }
            Ok(_) => {
                parse_error = Some(format!("{candidate}: not a JSON object"));
            }
            Err(e) => {
                parse_error = Some(format!("{candidate}: {e}"));
            }
        }
    }
    match parse_error {
        Some(error) => Err(Error::ManifestInvalidJson(error)),
        None => Err(Error::ManifestMissing),
    }
}

/// When the extraction produced a single top-level directory holding the
/// manifest, that directory is the actual content root.
pub fn content_root(staging: &Path) -> PathBuf {
    let entries: Vec<PathBuf> = std::fs::read_dir(staging)
        .map(|dir| dir.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default();
    if let [only] = entries.as_slice() {
        if only.is_dir()
            && MANIFEST_CANDIDATES
                .iter()
                .any(|candidate| only.join(candidate).is_file())
        {
            return only.clone();
        }
    }
    staging.to_path_buf()
}

/// Rewrite `version` to `"1.0.0"` unless it is a dotted numeric string.
/// Returns the stored version.
pub fn normalize_version(manifest: &mut serde_json::Value) -> String {
    let valid = manifest
        .get("version")
        .and_then(|v| v.as_str())
        .filter(|v| DOTTED_NUMERIC.is_match(v))
        .map(str::to_string);
    match valid {
        Some(version) => version,
        None => {
            manifest["version"] = serde_json::Value::String("1.0.0".to_string());
            "1.0.0".to_string()
        }
    }
}

/// Deterministic package id: first 32 hex chars of the SHA-256 of the
/// canonical identity JSON. Key order is fixed and every value is coerced
/// to a string, so the id survives reinstalls and manifest reformatting.
pub fn derive_id(manifest: &serde_json::Value) -> String {
    let field = |key: &str| -> String {
        manifest
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    // Key order is part of the id, so the JSON is assembled by hand rather
    // than through a map type with its own ordering.
    let quoted = |key: &str| {
        serde_json::to_string(&serde_json::Value::String(field(key))).unwrap_or_default()
    };
    let canonical = format!(
        "{{\"name\":{},\"version\":{},\"description\":{},\"author\":{},\"homepage_url\":{}}}",
        quoted("name"),
        quoted("version"),
        quoted("description"),
        quoted("author"),
        quoted("homepage_url"),
    );
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..32].to_string()
}
