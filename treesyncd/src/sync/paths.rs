use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use treesync_core::TEMP_SUFFIX;

const MAX_SYNC_DIR_NAME: usize = 64;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("name is empty")]
    Empty,
    #[error("path contains unsupported component")]
    UnsupportedComponent,
    #[error("invalid entry name: {0:?}")]
    InvalidName(String),
    #[error("invalid sync directory name: {0:?}")]
    InvalidDirectoryName(String),
}

/// Sync directory names become table prefixes and path segments, so they
/// are limited to ASCII letters, digits, `_` and `-`.
pub fn validate_sync_dir_name(name: &str) -> Result<(), PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    let valid = name.len() <= MAX_SYNC_DIR_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PathError::InvalidDirectoryName(name.to_string()))
    }
}

/// A single file or directory name as sent over the wire.
pub fn validate_entry_name(name: &str) -> Result<(), PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    let invalid = name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.ends_with(TEMP_SUFFIX);
    if invalid {
        Err(PathError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Joins a store-relative path under `root`, refusing anything that escapes it.
pub fn resolve_under(root: &Path, relative: &Path) -> Result<PathBuf, PathError> {
    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

pub fn now_ms() -> i64 {
    system_time_to_ms(SystemTime::now())
}

pub fn system_time_to_ms(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

pub fn ms_to_system_time(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

/// What the reconcilers compare for an on-disk entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStat {
    pub size: u64,
    pub modified: i64,
    pub attributes: String,
}

impl LocalStat {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: metadata
                .modified()
                .map(system_time_to_ms)
                .unwrap_or_default(),
            attributes: attributes_of(metadata),
        }
    }
}

pub async fn stat(path: &Path) -> io::Result<LocalStat> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(LocalStat::from_metadata(&metadata))
}

#[cfg(unix)]
pub fn attributes_of(metadata: &Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", metadata.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
pub fn attributes_of(metadata: &Metadata) -> String {
    if metadata.permissions().readonly() {
        "ro".to_string()
    } else {
        "rw".to_string()
    }
}

/// Applies an attribute string produced by [`attributes_of`]. Unknown
/// formats are ignored.
#[cfg(unix)]
pub fn apply_attributes(path: &Path, attributes: &str) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let Ok(mode) = u32::from_str_radix(attributes, 8) else {
        return Ok(());
    };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
pub fn apply_attributes(path: &Path, attributes: &str) -> io::Result<()> {
    let readonly = match attributes {
        "ro" => true,
        "rw" => false,
        _ => return Ok(()),
    };
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(readonly);
    std::fs::set_permissions(path, permissions)
}

pub fn set_modified(path: &Path, modified_ms: i64) -> io::Result<()> {
    let file = std::fs::File::open(path)?;
    file.set_modified(ms_to_system_time(modified_ms))
}

/// Sets timestamp then attributes, so a read-only mode never blocks the first step.
pub fn apply_metadata(path: &Path, modified_ms: i64, attributes: &str) -> io::Result<()> {
    set_modified(path, modified_ms)?;
    apply_attributes(path, attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_dir_names_reject_spaces_and_punctuation() {
        assert!(validate_sync_dir_name("Photos_2024-a").is_ok());
        assert!(matches!(validate_sync_dir_name(""), Err(PathError::Empty)));
        assert!(validate_sync_dir_name("My Docs").is_err());
        assert!(validate_sync_dir_name("a\"b").is_err());
        assert!(validate_sync_dir_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn entry_names_reject_separators_and_temp_files() {
        assert!(validate_entry_name("report final.pdf").is_ok());
        assert!(validate_entry_name("..").is_err());
        assert!(validate_entry_name("a/b").is_err());
        assert!(validate_entry_name("a.txt.tsyncpart").is_err());
    }

    #[test]
    fn resolves_relative_path_under_root() {
        let root = PathBuf::from("/data/alice/docs");
        let mapped = resolve_under(&root, Path::new("a/b.txt")).unwrap();
        assert_eq!(mapped, PathBuf::from("/data/alice/docs/a/b.txt"));
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/data");
        assert!(matches!(
            resolve_under(&root, Path::new("../secret")),
            Err(PathError::UnsupportedComponent)
        ));
    }

    #[test]
    fn millisecond_round_trip_handles_pre_epoch() {
        for ms in [0, 1_700_000_000_123, -5_000] {
            assert_eq!(system_time_to_ms(ms_to_system_time(ms)), ms);
        }
    }

    #[cfg(unix)]
    #[test]
    fn applied_metadata_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"abc").unwrap();

        apply_metadata(&path, 1_600_000_000_250, "640").unwrap();
        let stat = LocalStat::from_metadata(&std::fs::metadata(&path).unwrap());
        assert_eq!(stat.modified, 1_600_000_000_250);
        assert_eq!(stat.attributes, "640");
        assert_eq!(stat.size, 3);
    }
}
