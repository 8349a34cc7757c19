use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use treesync_core::{
    Backoff, ClientSession, Command, DirectoryName, Envelope, ErrorCode, FileListResponse,
    LoginRequest, LoginResponse, MessageStream, SessionConfig, SessionError, WireDir,
};

/// How the fake server treats the first connection it accepts.
#[derive(Clone, Copy)]
enum Script {
    Normal,
    DropFirstListing,
    RefuseLogin,
    HangUpAlways,
}

struct FakeServer {
    addr: String,
    connections: Arc<AtomicUsize>,
    opened: Arc<std::sync::Mutex<Vec<String>>>,
}

async fn spawn_server(script: Script) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let connections = Arc::new(AtomicUsize::new(0));
    let opened = Arc::new(std::sync::Mutex::new(Vec::new()));

    let counter = connections.clone();
    let opened_log = opened.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let opened_log = opened_log.clone();
            tokio::spawn(async move {
                serve(socket, index, script, opened_log).await;
            });
        }
    });

    FakeServer {
        addr,
        connections,
        opened,
    }
}

async fn serve(
    socket: TcpStream,
    index: usize,
    script: Script,
    opened: Arc<std::sync::Mutex<Vec<String>>>,
) {
    if matches!(script, Script::HangUpAlways) {
        return;
    }
    let mut stream = MessageStream::new(socket);
    while let Ok(request) = stream.recv().await {
        let reply = match request.command().unwrap() {
            Command::Login => {
                let login: LoginRequest = request.body().unwrap();
                if matches!(script, Script::RefuseLogin) || login.password != "secret" {
                    Envelope::failure(request.command, ErrorCode::AccessDenied, "bad password")
                } else {
                    Envelope::response(Command::Login)
                        .with_body(&LoginResponse {
                            session: format!("s{index}"),
                        })
                        .unwrap()
                }
            }
            Command::OpenDirectory => {
                let DirectoryName { name } = request.body().unwrap();
                opened.lock().unwrap().push(name);
                Envelope::response(Command::OpenDirectory)
            }
            Command::GetFileList => {
                assert_eq!(request.session.as_deref(), Some(format!("s{index}").as_str()));
                if index == 0 && matches!(script, Script::DropFirstListing) {
                    return;
                }
                let listing = FileListResponse {
                    directories: vec![WireDir {
                        id: 2,
                        parent_id: Some(1),
                        name: "docs".into(),
                        modified: 10,
                        attributes: "755".into(),
                        digest: [0; 16],
                    }],
                    files: Vec::new(),
                };
                Envelope::response(Command::GetFileList)
                    .with_body(&listing)
                    .unwrap()
            }
            Command::GetFileInfo => {
                Envelope::failure(request.command, ErrorCode::NotFound, "no such file")
            }
            _ => Envelope::failure(request.command, ErrorCode::UnknownCommand, "unsupported"),
        };
        if stream.send(&reply).await.is_err() {
            return;
        }
    }
}

fn config(addr: &str, password: &str) -> SessionConfig {
    let mut config = SessionConfig::new(addr, "alice", password);
    config.backoff = Backoff::none();
    config.reconnect_cap = 3;
    config.timeout = Duration::from_secs(5);
    config
}

#[tokio::test]
async fn lists_directory_after_login() {
    let server = spawn_server(Script::Normal).await;
    let mut session = ClientSession::connect(config(&server.addr, "secret"))
        .await
        .unwrap();
    session.open_directory("docs").await.unwrap();

    let listing = session.list_directory(1).await.unwrap();
    assert_eq!(listing.directories.len(), 1);
    assert_eq!(listing.directories[0].name, "docs");
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reconnects_and_reopens_directory_after_dropped_connection() {
    let server = spawn_server(Script::DropFirstListing).await;
    let mut session = ClientSession::connect(config(&server.addr, "secret"))
        .await
        .unwrap();
    session.open_directory("photos").await.unwrap();

    let listing = session.list_directory(1).await.unwrap();
    assert_eq!(listing.directories[0].id, 2);
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);
    assert_eq!(
        *server.opened.lock().unwrap(),
        vec!["photos".to_string(), "photos".to_string()]
    );
}

#[tokio::test]
async fn refused_login_is_fatal() {
    let server = spawn_server(Script::RefuseLogin).await;
    let err = ClientSession::connect(config(&server.addr, "secret"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SessionError::LoginRejected(_)));
    assert!(err.is_fatal());
    assert!(err.is_permanent());
}

#[tokio::test]
async fn gives_up_after_reconnect_cap() {
    let server = spawn_server(Script::HangUpAlways).await;
    let mut session = ClientSession::new(config(&server.addr, "secret"));

    let err = session.list_directory(1).await.unwrap_err();
    assert!(matches!(err, SessionError::ReconnectExhausted(3)));
    assert!(err.is_fatal());
    assert!(!err.is_permanent());
    assert_eq!(server.connections.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn missing_file_maps_to_none() {
    let server = spawn_server(Script::Normal).await;
    let mut session = ClientSession::connect(config(&server.addr, "secret"))
        .await
        .unwrap();
    assert!(session.file_info(42).await.unwrap().is_none());
}
