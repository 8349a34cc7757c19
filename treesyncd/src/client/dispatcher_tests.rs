use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use treesync_core::{
    Backoff, Command, CrcMessage, Envelope, FileResponse, LoginResponse, MessageStream,
    ROOT_DIR_ID, SessionConfig, crc32_of, temp_path,
};

use super::*;
use crate::sync::index::{MAX_ATTEMPTS, NewQueueItem};
use crate::sync::processor::QueueProcessor;

const PAYLOAD: &[u8] = b"new payload";

fn served_file() -> WireFile {
    WireFile {
        id: 9,
        dir_id: ROOT_DIR_ID,
        name: "a.txt".into(),
        size: PAYLOAD.len() as u64,
        modified: 2_000_000,
        attributes: "644".into(),
        crc: crc32_of(PAYLOAD),
        md5: [2; 16],
        changed: 2_000_000,
    }
}

/// Serves `served_file` but announces a CRC that does not match the bytes.
async fn spawn_corrupting_peer() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let downloads = Arc::new(AtomicUsize::new(0));
    let counter = downloads.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_corrupted(socket, counter.clone()));
        }
    });
    (addr, downloads)
}

async fn serve_corrupted(socket: TcpStream, downloads: Arc<AtomicUsize>) {
    let mut stream = MessageStream::new(socket);
    let file = FileResponse { file: served_file() };
    while let Ok(request) = stream.recv().await {
        let reply = match request.command().unwrap() {
            Command::Login => Envelope::response(Command::Login)
                .with_body(&LoginResponse {
                    session: "s1".into(),
                })
                .unwrap(),
            Command::GetFileInfo => Envelope::response(Command::GetFileInfo)
                .with_body(&file)
                .unwrap(),
            Command::DownloadFile => {
                downloads.fetch_add(1, Ordering::SeqCst);
                let go = Envelope::response(Command::DownloadFile)
                    .with_body(&file)
                    .unwrap();
                if stream.send(&go).await.is_err() || stream.write_raw(PAYLOAD).await.is_err() {
                    return;
                }
                let crc = CrcMessage {
                    crc: crc32_of(PAYLOAD) ^ 0xffff,
                };
                let Ok(reply) = stream
                    .exchange(&Envelope::request(Command::Crc, &crc).unwrap())
                    .await
                else {
                    return;
                };
                assert_eq!(reply.error_code(), ErrorCode::CrcMismatch);
                continue;
            }
            _ => Envelope::failure(request.command, ErrorCode::UnknownCommand, "unsupported"),
        };
        if stream.send(&reply).await.is_err() {
            return;
        }
    }
}

fn session_for(addr: &str) -> ClientSession {
    let mut config = SessionConfig::new(addr, "alice", "secret");
    config.backoff = Backoff::none();
    config.reconnect_cap = 2;
    config.timeout = Duration::from_secs(5);
    ClientSession::new(config)
}

#[tokio::test]
async fn corrupted_download_leaves_file_and_row_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let tree = LocalTree::new(dir.path().join("docs"), dir.path().join("history"));
    tokio::fs::create_dir_all(tree.root()).await.unwrap();
    let target = tree.root().join("a.txt");
    tokio::fs::write(&target, b"old content").await.unwrap();

    let store = InventoryStore::open_in_memory("docs", true).await.unwrap();
    let stored = FileEntry {
        id: 9,
        dir_id: ROOT_DIR_ID,
        name: "a.txt".into(),
        size: 11,
        modified: 1_000_000,
        attributes: "644".into(),
        crc32: crc32_of(b"old content"),
        md5: [1; 16],
        changed: 1_000_000,
    };
    store.file_list_insert_with_id(&stored).await.unwrap();
    store
        .enqueue(NewQueueItem::file(ActionType::DownloadFile, 9, ROOT_DIR_ID, "a.txt"))
        .await
        .unwrap();

    let (addr, downloads) = spawn_corrupting_peer().await;
    let mut session = session_for(&addr);
    let report = {
        let mut dispatcher = ClientDispatcher::new(&mut session, &tree);
        QueueProcessor::drain(&store, &mut dispatcher).await.unwrap()
    };

    assert_eq!(report.applied, 0);
    assert_eq!(report.failed, MAX_ATTEMPTS as usize);
    assert_eq!(downloads.load(Ordering::SeqCst), MAX_ATTEMPTS as usize);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), b"old content");
    assert!(!temp_path(&target).exists());
    assert_eq!(store.file(9).await.unwrap(), Some(stored));
    assert!(store.history_records().await.unwrap().is_empty());
    assert!(!tree.history_root().exists());
    let items = store.queue_items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].attempts, MAX_ATTEMPTS);
}
