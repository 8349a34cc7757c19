use std::io;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;

use super::paths::ms_to_system_time;

/// `yyyy/MM/dd/hh-mm-ss-millis.<name>` under the history root, in UTC. A
/// non-zero `sequence` goes between the time and the name.
pub fn history_relative_path(recorded_ms: i64, sequence: u32, name: &str) -> PathBuf {
    let when = OffsetDateTime::from(ms_to_system_time(recorded_ms));
    let stamp = format!(
        "{:02}-{:02}-{:02}-{:03}",
        when.hour(),
        when.minute(),
        when.second(),
        when.millisecond()
    );
    let mut path = PathBuf::new();
    path.push(format!("{:04}", when.year()));
    path.push(format!("{:02}", u8::from(when.month())));
    path.push(format!("{:02}", when.day()));
    if sequence == 0 {
        path.push(format!("{stamp}.{name}"));
    } else {
        path.push(format!("{stamp}.{sequence}.{name}"));
    }
    path
}

/// Reserves a history slot for `name` by creating an empty file there and
/// returns its path relative to `history_root`. Slots already taken within
/// the same millisecond get the next sequence number.
pub async fn claim_history_path(
    history_root: &Path,
    recorded_ms: i64,
    name: &str,
) -> io::Result<PathBuf> {
    let mut sequence = 0;
    loop {
        let relative = history_relative_path(recorded_ms, sequence, name);
        let destination = history_root.join(&relative);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&destination)
            .await
        {
            Ok(_) => return Ok(relative),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => sequence += 1,
            Err(err) => return Err(err),
        }
    }
}

/// Moves `source` into the history area. Falls back to copy-and-delete when
/// the history root lives on another filesystem.
pub async fn move_into_history(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(err),
        Err(_) => {
            tokio::fs::copy(source, destination).await?;
            tokio::fs::remove_file(source).await
        }
    }
}
