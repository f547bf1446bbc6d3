#![warn(missing_docs)]
//! The extension installer pipeline.
//!
//! Archives and unpacked directories become versioned, deterministically
//! identified bundles under `<base>/<id>/<version>_0`, moved into place
//! with a transactional directory replace. Problems that do not abort the
//! install (missing icons, Firefox manifests) are collected as warnings on
//! the returned package.

pub mod archive;
pub mod locale;
pub mod manifest;

use std::path::Path;
use std::path::PathBuf;

use rand::Rng;
use serde::Serialize;

use crate::consts::MISSING_FILE_WARNING_CAP;
use crate::error::Error;
use crate::error::Result;
use crate::store::fs;

/// Icon sizes considered for the toolbar icon, largest first.
const ICON_SIZES: [&str; 5] = ["128", "64", "48", "32", "16"];

/// Where the package came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageSource {
    /// An unpacked directory.
    Unpacked,
    /// A `.zip` archive.
    FileZip,
    /// A `.crx` package.
    FileCrx,
}

/// An installed extension bundle.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionPackage {
    /// Deterministic id, 32 hex chars. See [manifest::derive_id].
    pub id: String,
    /// Raw `manifest.name`.
    pub name: String,
    /// Locale-resolved name.
    #[serde(rename = "displayName")]
    pub display_name: String,
    /// Normalized dotted numeric version.
    pub version: String,
    /// Raw `manifest.description`.
    pub description: String,
    /// Locale-resolved description.
    #[serde(rename = "displayDescription")]
    pub display_description: String,
    /// The full parsed manifest, version already normalized.
    pub manifest: serde_json::Value,
    /// Final bundle directory, `<base>/<id>/<version>_0`.
    #[serde(rename = "installedPath")]
    pub installed_path: PathBuf,
    /// New installs start enabled.
    pub enabled: bool,
    /// Where the package came from.
    pub source: PackageSource,
    /// Install time, milliseconds since the epoch.
    #[serde(rename = "installDate")]
    pub install_date: i64,
    /// Non-fatal problems found during install.
    pub warnings: Vec<String>,
    /// Internal URL of the selected icon, when the manifest names one.
    #[serde(rename = "iconPath")]
    pub icon_path: Option<String>,
}

/// See the module docs.
pub struct Installer {
    base: PathBuf,
    app_locale: String,
}

impl Installer {
    /// An installer writing bundles under `base`, resolving display strings
    /// for `app_locale`.
    pub fn new(base: PathBuf, app_locale: impl Into<String>) -> Self {
        Self {
            base,
            app_locale: app_locale.into(),
        }
    }

    /// Install a `.zip` or `.crx` archive.
    pub async fn install_from_archive(&self, path: &Path) -> Result<ExtensionPackage> {
        let staging = self.new_staging()?;
        let kind = match archive::extract_archive(path, &staging) {
            Ok(kind) => kind,
            Err(e) => {
                cleanup(&staging);
                return Err(e);
            }
        };
        let source = match kind {
            archive::ArchiveKind::Zip => PackageSource::FileZip,
            archive::ArchiveKind::Crx => PackageSource::FileCrx,
        };
        self.finish(staging, source)
    }

    /// Install an unpacked extension directory. The directory is copied;
    /// the original is left untouched.
    pub async fn install_from_directory(&self, path: &Path) -> Result<ExtensionPackage> {
        let staging = self.new_staging()?;
        if let Err(e) = copy_tree(path, &staging) {
            cleanup(&staging);
            return Err(e);
        }
        self.finish(staging, PackageSource::Unpacked)
    }

    fn new_staging(&self) -> Result<PathBuf> {
        let staging = self.base.join("_staging").join(format!(
            "pkg-{}-{:08x}",
            fs::epoch_millis(),
            rand::thread_rng().gen::<u32>(),
        ));
        fs::ensure_dir(&staging)?;
        Ok(staging)
    }

    fn finish(&self, staging: PathBuf, source: PackageSource) -> Result<ExtensionPackage> {
        let package = self.finish_inner(&staging, source);
        cleanup(&staging);
        package
    }

    fn finish_inner(&self, staging: &Path, source: PackageSource) -> Result<ExtensionPackage> {
        let root = manifest::content_root(staging);
        let discovered = manifest::discover(&root)?;
        let mut warnings = discovered.warnings;
        let mut manifest = discovered.value;
        let version = manifest::normalize_version(&mut manifest);
        let id = manifest::derive_id(&manifest);

        // The bundle always carries a canonical manifest.json with the
        // normalized version. Alternative manifest files are preserved.
        let canonical = serde_json::to_vec_pretty(&manifest)?;
        std::fs::write(root.join("manifest.json"), canonical)
            .map_err(|e| Error::CreateFileError(e.to_string()))?;

        let default_locale = manifest
            .get("default_locale")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let candidates = locale::candidates(&self.app_locale, default_locale.as_deref());
        let messages = locale::load_messages(&root, &candidates);

        let name = string_field(&manifest, "name");
        let description = string_field(&manifest, "description");
        let display_name = locale::localize(&name, &messages);
        let display_description = locale::localize(&description, &messages);

        let target = self.base.join(&id).join(format!("{version}_0"));
        fs::atomic_replace_dir(&root, &target)?;

        warnings.extend(verify_referenced_files(&manifest, &target));
        let icon_path = select_icon(&manifest, &id, &version);

        Ok(ExtensionPackage {
            id,
            name,
            display_name,
            version,
            description,
            display_description,
            manifest,
            installed_path: target,
            enabled: true,
            source,
            install_date: fs::epoch_millis() as i64,
            warnings,
            icon_path,
        })
    }
}

fn string_field(manifest: &serde_json::Value, key: &str) -> String {
    manifest
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn cleanup(staging: &Path) {
    if staging.exists() {
        if let Err(e) = std::fs::remove_dir_all(staging) {
            tracing::warn!("Could not remove staging directory {:?}: {e}", staging);
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    if !from.is_dir() {
        return Err(Error::ArchiveInvalid(format!(
            "{} is not a directory",
            from.display()
        )));
    }
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::ArchiveInvalid(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::ArchiveInvalid(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let destination = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

/// Paths the manifest points at that must exist in the installed bundle.
fn referenced_files(manifest: &serde_json::Value) -> Vec<String> {
    let mut files = vec![];
    let mut push = |value: Option<&serde_json::Value>| {
        if let Some(path) = value.and_then(|v| v.as_str()) {
            files.push(path.trim_start_matches('/').to_string());
        }
    };

    if let Some(icons) = manifest.get("icons").and_then(|v| v.as_object()) {
        for icon in icons.values() {
            push(Some(icon));
        }
    }
    push(manifest
        .get("background")
        .and_then(|b| b.get("service_worker")));
    push(manifest.get("action").and_then(|a| a.get("default_popup")));
    if let Some(scripts) = manifest.get("content_scripts").and_then(|v| v.as_array()) {
        for script in scripts {
            for list in ["js", "css"] {
                if let Some(entries) = script.get(list).and_then(|v| v.as_array()) {
                    for entry in entries {
                        push(Some(entry));
                    }
                }
            }
        }
    }
    files
}

fn verify_referenced_files(manifest: &serde_json::Value, installed: &Path) -> Vec<String> {
    referenced_files(manifest)
        .into_iter()
        .filter(|relative| !installed.join(relative).exists())
        .take(MISSING_FILE_WARNING_CAP)
        .map(|relative| format!("Missing file: {relative}"))
        .collect()
}

fn select_icon(manifest: &serde_json::Value, id: &str, version: &str) -> Option<String> {
    let icons = manifest.get("icons").and_then(|v| v.as_object())?;
    let size = ICON_SIZES.iter().find(|size| icons.contains_key(**size))?;
    let encoded_version: String = form_urlencoded::byte_serialize(version.as_bytes()).collect();
    Some(format!(
        "peersky://extension-icon/{id}/{size}?v={encoded_version}"
    ))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::io::Write;

    use zip::write::FileOptions;

    use super::*;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn installer(dir: &Path) -> Installer {
        Installer::new(dir.join("extensions"), "en-US")
    }

    #[tokio::test]
    async fn test_install_unpacked_with_alternative_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(
            source.join("manifest.chromium.json"),
            br#"{"name": "X", "version": "2"}"#,
        )
        .unwrap();

        let installer = installer(dir.path());
        let package = installer.install_from_directory(&source).await.unwrap();

        assert_eq!(package.name, "X");
        assert_eq!(package.version, "2");
        assert_eq!(package.source, PackageSource::Unpacked);
        assert!(package
            .installed_path
            .ends_with(format!("{}/2_0", package.id)));

        // Canonical manifest written, alternative preserved.
        let canonical: serde_json::Value = serde_json::from_slice(
            &std::fs::read(package.installed_path.join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(canonical["version"], "2");
        assert!(package
            .installed_path
            .join("manifest.chromium.json")
            .is_file());

        // Reinstall lands on the same id and path.
        let again = installer.install_from_directory(&source).await.unwrap();
        assert_eq!(again.id, package.id);
        assert_eq!(again.installed_path, package.installed_path);
    }

    #[tokio::test]
    async fn test_install_zip_collapses_single_top_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ext.zip");
        std::fs::write(
            &archive,
            build_zip(&[("foo/manifest.json", br#"{"name": "Foo", "version": "1.0"}"#)]),
        )
        .unwrap();

        let installer = installer(dir.path());
        let package = installer.install_from_archive(&archive).await.unwrap();
        assert_eq!(package.source, PackageSource::FileZip);
        assert!(package.installed_path.join("manifest.json").is_file());
        assert!(!package.installed_path.join("foo").exists());
    }

    #[tokio::test]
    async fn test_invalid_version_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(
            source.join("manifest.json"),
            br#"{"name": "V", "version": "abc"}"#,
        )
        .unwrap();

        let package = installer(dir.path())
            .install_from_directory(&source)
            .await
            .unwrap();
        assert_eq!(package.version, "1.0.0");
        assert!(package.installed_path.ends_with(format!("{}/1.0.0_0", package.id)));
    }

    #[tokio::test]
    async fn test_locale_resolution_and_icon() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::create_dir_all(source.join("_locales/en")).unwrap();
        std::fs::write(
            source.join("manifest.json"),
            br#"{
                "name": "__MSG_appName__",
                "version": "1.0",
                "default_locale": "en",
                "icons": {"48": "icon48.png", "128": "icon128.png"}
            }"#,
        )
        .unwrap();
        std::fs::write(
            source.join("_locales/en/messages.json"),
            br#"{"appName": {"message": "Localized"}}"#,
        )
        .unwrap();
        std::fs::write(source.join("icon128.png"), b"png").unwrap();

        let package = installer(dir.path())
            .install_from_directory(&source)
            .await
            .unwrap();
        assert_eq!(package.display_name, "Localized");
        assert_eq!(package.name, "__MSG_appName__");
        assert_eq!(
            package.icon_path.as_deref(),
            Some(format!("peersky://extension-icon/{}/128?v=1.0", package.id).as_str())
        );
        // icon48.png is referenced but absent.
        assert!(package
            .warnings
            .iter()
            .any(|w| w == "Missing file: icon48.png"));
    }

    #[tokio::test]
    async fn test_missing_manifest_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("readme.txt"), b"no manifest here").unwrap();

        let installer = installer(dir.path());
        let err = installer.install_from_directory(&source).await.unwrap_err();
        assert!(matches!(err, Error::ManifestMissing));

        let staging = dir.path().join("extensions").join("_staging");
        let leftovers: Vec<_> = std::fs::read_dir(&staging)
            .map(|d| d.filter_map(|e| e.ok()).collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }
}
