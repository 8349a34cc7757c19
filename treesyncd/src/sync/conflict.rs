use treesync_core::WireFile;

use super::index::FileEntry;

/// Local file state gathered right before an update is dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileState {
    pub size: u64,
    pub modified: i64,
    pub attributes: String,
    pub crc32: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Send local content to the server.
    Upload,
    /// Replace local content with the server's, keeping the old copy in history.
    Download,
    /// Contents and metadata agree; record the server entry locally.
    Adopt,
    /// Contents agree; push local timestamp and attributes.
    PushMetadata,
}

/// Decides how a locally changed file is reconciled with the server.
pub fn decide_update(
    local: &LocalFileState,
    stored: &FileEntry,
    server: Option<&WireFile>,
) -> UpdateDecision {
    let Some(server) = server else {
        return UpdateDecision::Upload;
    };
    if stored.modified < 0 {
        return UpdateDecision::Download;
    }
    if local.crc32 == server.crc && local.size == server.size {
        if local.modified == server.modified && local.attributes == server.attributes {
            return UpdateDecision::Adopt;
        }
        return UpdateDecision::PushMetadata;
    }
    if local.modified < server.modified {
        UpdateDecision::Download
    } else {
        // Newer or tied timestamps keep the local content.
        UpdateDecision::Upload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(crc32: u32, modified: i64) -> LocalFileState {
        LocalFileState {
            size: 10,
            modified,
            attributes: "644".into(),
            crc32,
        }
    }

    fn stored(modified: i64) -> FileEntry {
        FileEntry {
            id: 4,
            dir_id: 1,
            name: "a.txt".into(),
            size: 10,
            modified,
            attributes: "644".into(),
            crc32: 1,
            md5: [0; 16],
            changed: 0,
        }
    }

    fn server(crc: u32, modified: i64) -> WireFile {
        WireFile {
            id: 4,
            dir_id: 1,
            name: "a.txt".into(),
            size: 10,
            modified,
            attributes: "644".into(),
            crc,
            md5: [0; 16],
            changed: 0,
        }
    }

    #[test]
    fn missing_server_entry_is_recreated() {
        assert_eq!(
            decide_update(&local(1, 5), &stored(5), None),
            UpdateDecision::Upload
        );
    }

    #[test]
    fn negative_stored_timestamp_discards_local_state() {
        let remote = server(2, 1);
        assert_eq!(
            decide_update(&local(1, 100), &stored(-1), Some(&remote)),
            UpdateDecision::Download
        );
    }

    #[test]
    fn identical_content_adopts_or_pushes_metadata() {
        let remote = server(1, 5);
        assert_eq!(
            decide_update(&local(1, 5), &stored(3), Some(&remote)),
            UpdateDecision::Adopt
        );
        assert_eq!(
            decide_update(&local(1, 9), &stored(3), Some(&remote)),
            UpdateDecision::PushMetadata
        );
    }

    #[test]
    fn newer_side_wins_and_ties_favor_local() {
        let remote = server(2, 50);
        assert_eq!(
            decide_update(&local(1, 60), &stored(3), Some(&remote)),
            UpdateDecision::Upload
        );
        assert_eq!(
            decide_update(&local(1, 40), &stored(3), Some(&remote)),
            UpdateDecision::Download
        );
        assert_eq!(
            decide_update(&local(1, 50), &stored(3), Some(&remote)),
            UpdateDecision::Upload
        );
    }
}
