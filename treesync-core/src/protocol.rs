use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Largest JSON message accepted on the wire; also the transfer chunk size.
pub const MAX_MESSAGE_SIZE: usize = 10_240_000;
pub const TRANSFER_CHUNK_SIZE: usize = MAX_MESSAGE_SIZE;
/// Suffix of partially received files. Such files are never synced.
pub const TEMP_SUFFIX: &str = ".tsyncpart";
pub const ROOT_DIR_ID: i64 = 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown command: {0}")]
    UnknownCommand(u16),
    #[error("message body must be a JSON object")]
    UnexpectedBody,
    #[error("message exceeds {0} bytes")]
    MessageTooLarge(usize),
    #[error("socket operation timed out")]
    Timeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("response command {actual} does not match request {expected}")]
    CommandMismatch { expected: u16, actual: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Login = 1,
    Logout = 2,
    GetAccountData = 3,
    CreateSyncDirectory = 4,
    OpenDirectory = 5,
    GetFileList = 20,
    GetFileInfo = 21,
    GetDirectoryInfo = 22,
    GetDirectoryDigest = 23,
    CreateDirectory = 24,
    RemoveDirectory = 25,
    SetDirectoryInfo = 26,
    UploadFile = 27,
    DownloadFile = 28,
    RemoveFile = 29,
    SetFileInfo = 30,
    Rescan = 40,
    Stop = 41,
    Close = 50,
    Crc = 51,
}

impl Command {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Commands that may be issued before a successful login.
    pub fn is_public(self) -> bool {
        matches!(self, Command::Login | Command::Close)
    }

    /// Commands that operate on the session's open sync directory.
    pub fn needs_directory(self) -> bool {
        matches!(
            self,
            Command::GetFileList
                | Command::GetFileInfo
                | Command::GetDirectoryInfo
                | Command::GetDirectoryDigest
                | Command::CreateDirectory
                | Command::RemoveDirectory
                | Command::SetDirectoryInfo
                | Command::UploadFile
                | Command::DownloadFile
                | Command::RemoveFile
                | Command::SetFileInfo
                | Command::Rescan
        )
    }
}

impl TryFrom<u16> for Command {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let command = match value {
            1 => Command::Login,
            2 => Command::Logout,
            3 => Command::GetAccountData,
            4 => Command::CreateSyncDirectory,
            5 => Command::OpenDirectory,
            20 => Command::GetFileList,
            21 => Command::GetFileInfo,
            22 => Command::GetDirectoryInfo,
            23 => Command::GetDirectoryDigest,
            24 => Command::CreateDirectory,
            25 => Command::RemoveDirectory,
            26 => Command::SetDirectoryInfo,
            27 => Command::UploadFile,
            28 => Command::DownloadFile,
            29 => Command::RemoveFile,
            30 => Command::SetFileInfo,
            40 => Command::Rescan,
            41 => Command::Stop,
            50 => Command::Close,
            51 => Command::Crc,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    UnknownCommand = 1,
    InvalidRequest = 2,
    NotLoggedIn = 3,
    AccessDenied = 4,
    NoActiveDirectory = 5,
    InvalidName = 6,
    NotFound = 7,
    AlreadyExists = 8,
    CrcMismatch = 9,
    Io = 10,
    Store = 11,
    Busy = 12,
    Unknown = 0xFFFF,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(value: u32) -> Self {
        match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::UnknownCommand,
            2 => ErrorCode::InvalidRequest,
            3 => ErrorCode::NotLoggedIn,
            4 => ErrorCode::AccessDenied,
            5 => ErrorCode::NoActiveDirectory,
            6 => ErrorCode::InvalidName,
            7 => ErrorCode::NotFound,
            8 => ErrorCode::AlreadyExists,
            9 => ErrorCode::CrcMismatch,
            10 => ErrorCode::Io,
            11 => ErrorCode::Store,
            12 => ErrorCode::Busy,
            _ => ErrorCode::Unknown,
        }
    }
}

/// One wire message. Requests carry `Command`, optionally `Session`, and
/// command-specific fields; responses additionally carry `Error`/`ErrorMsg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Command")]
    pub command: u16,
    #[serde(rename = "Session", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<u32>,
    #[serde(rename = "ErrorMsg", default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Envelope {
    pub fn request<T: Serialize>(command: Command, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            command: command.code(),
            session: None,
            error: None,
            error_msg: None,
            body: body_map(body)?,
        })
    }

    pub fn response(command: Command) -> Self {
        Self {
            command: command.code(),
            session: None,
            error: Some(ErrorCode::Ok.code()),
            error_msg: None,
            body: Map::new(),
        }
    }

    /// Error reply. `command` is the raw request code so unknown commands can be echoed.
    pub fn failure(command: u16, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            command,
            session: None,
            error: Some(code.code()),
            error_msg: Some(message.into()),
            body: Map::new(),
        }
    }

    pub fn with_session(mut self, session: Option<&str>) -> Self {
        self.session = session.map(str::to_string);
        self
    }

    pub fn with_body<T: Serialize>(mut self, body: &T) -> Result<Self, ProtocolError> {
        self.body = body_map(body)?;
        Ok(self)
    }

    pub fn command(&self) -> Result<Command, ProtocolError> {
        Command::try_from(self.command)
    }

    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }

    pub fn error_code(&self) -> ErrorCode {
        self.error
            .map(ErrorCode::from_code)
            .unwrap_or(ErrorCode::Ok)
    }

    pub fn is_ok(&self) -> bool {
        self.error_code() == ErrorCode::Ok
    }

    pub fn error_message(&self) -> &str {
        self.error_msg.as_deref().unwrap_or_default()
    }
}

fn body_map<T: Serialize>(body: &T) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::to_value(body)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(ProtocolError::UnexpectedBody),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireDir {
    pub id: i64,
    #[serde(default)]
    pub parent_id: Option<i64>,
    pub name: String,
    pub modified: i64,
    pub attributes: String,
    #[serde(with = "hex16")]
    pub digest: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireFile {
    pub id: i64,
    pub dir_id: i64,
    pub name: String,
    pub size: u64,
    pub modified: i64,
    pub attributes: String,
    pub crc: u32,
    #[serde(with = "hex16")]
    pub md5: [u8; 16],
    pub changed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoginRequest {
    pub account: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoginResponse {
    pub session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountData {
    pub account: String,
    pub directories: Vec<String>,
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirectoryName {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirIdRequest {
    pub dir_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileIdRequest {
    pub file_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileListResponse {
    pub directories: Vec<WireDir>,
    pub files: Vec<WireFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirectoryResponse {
    pub directory: WireDir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileResponse {
    pub file: WireFile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DigestResponse {
    pub dir_id: i64,
    #[serde(with = "hex16")]
    pub digest: [u8; 16],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateDirectoryRequest {
    pub parent_id: i64,
    pub name: String,
    pub modified: i64,
    pub attributes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetDirectoryInfoRequest {
    pub dir_id: i64,
    pub modified: i64,
    pub attributes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetFileInfoRequest {
    pub file_id: i64,
    pub modified: i64,
    pub attributes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadRequest {
    pub dir_id: i64,
    pub name: String,
    pub size: u64,
    pub modified: i64,
    pub attributes: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CrcMessage {
    pub crc: u32,
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub fn parse_hex16(value: &str) -> Option<[u8; 16]> {
    if value.len() != 32 || !value.is_ascii() {
        return None;
    }
    let mut out = [0u8; 16];
    for (index, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&value[index * 2..index * 2 + 2], 16).ok()?;
    }
    Some(out)
}

mod hex16 {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_hex(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 16], D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_hex16(&raw).ok_or_else(|| D::Error::custom("expected 32 hex digits"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_uses_pascal_case_fields() {
        let env = Envelope::request(
            Command::GetFileList,
            &DirIdRequest { dir_id: ROOT_DIR_ID },
        )
        .unwrap()
        .with_session(Some("abc"));

        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({"Command": 20, "Session": "abc", "DirId": 1}));
    }

    #[test]
    fn failure_envelope_reports_code_and_message() {
        let env = Envelope::failure(999, ErrorCode::UnknownCommand, "no such command");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"Command": 999, "Error": 1, "ErrorMsg": "no such command"})
        );
        assert!(!env.is_ok());
        assert!(matches!(env.command(), Err(ProtocolError::UnknownCommand(999))));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let env: Envelope = serde_json::from_value(json!({"Command": 24, "Name": "a"})).unwrap();
        assert!(env.body::<CreateDirectoryRequest>().is_err());
    }

    #[test]
    fn wire_file_encodes_md5_as_hex() {
        let file = WireFile {
            id: 7,
            dir_id: 1,
            name: "a.txt".into(),
            size: 3,
            modified: 1_700_000_000_000,
            attributes: "644".into(),
            crc: 0x352441c2,
            md5: [0xab; 16],
            changed: 5,
        };
        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(value["Md5"], json!("abababababababababababababababab"));
        let back: WireFile = serde_json::from_value(value).unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn unknown_error_codes_are_preserved_as_unknown() {
        assert_eq!(ErrorCode::from_code(12), ErrorCode::Busy);
        assert_eq!(ErrorCode::from_code(4242), ErrorCode::Unknown);
    }

    #[test]
    fn parse_hex16_rejects_bad_input() {
        assert!(parse_hex16("zz").is_none());
        assert!(parse_hex16(&"g".repeat(32)).is_none());
        assert_eq!(parse_hex16(&"0f".repeat(16)), Some([0x0f; 16]));
    }
}
