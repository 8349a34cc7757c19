use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::MessageStream;
use crate::protocol::{
    Command, CrcMessage, Envelope, ErrorCode, ProtocolError, TEMP_SUFFIX, TRANSFER_CHUNK_SIZE,
};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transfer ended after {actual} of {expected} bytes")]
    ShortTransfer { expected: u64, actual: u64 },
    #[error("crc mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("peer rejected transfer ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("unexpected message {0} during transfer")]
    UnexpectedMessage(u16),
}

/// Something file bytes can be pulled from in chunks.
pub trait ChunkSource {
    fn read_chunk(
        &mut self,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize, TransferError>> + Send;
}

/// Something file bytes can be pushed into in chunks.
pub trait ChunkSink {
    fn write_chunk(&mut self, data: &[u8])
    -> impl Future<Output = Result<(), TransferError>> + Send;
}

impl ChunkSource for File {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        Ok(AsyncReadExt::read(self, buf).await?)
    }
}

impl ChunkSink for File {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransferError> {
        Ok(AsyncWriteExt::write_all(self, data).await?)
    }
}

impl<S> ChunkSource for MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
        Ok(self.read_raw(buf).await?)
    }
}

impl<S> ChunkSink for MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransferError> {
        Ok(self.write_raw(data).await?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    pub crc32: u32,
    pub md5: [u8; 16],
}

/// Moves exactly `size` bytes from `source` to `sink`, checksumming on the way.
pub async fn pump<R, W>(
    source: &mut R,
    sink: &mut W,
    size: u64,
    chunk_size: usize,
) -> Result<TransferSummary, TransferError>
where
    R: ChunkSource,
    W: ChunkSink,
{
    let capacity = usize::try_from(size)
        .unwrap_or(usize::MAX)
        .clamp(1, chunk_size.max(1));
    let mut buf = vec![0u8; capacity];
    let mut crc = crc32fast::Hasher::new();
    let mut md5 = md5::Context::new();
    let mut done = 0u64;

    while done < size {
        let want = (size - done).min(buf.len() as u64) as usize;
        let read = source.read_chunk(&mut buf[..want]).await?;
        if read == 0 {
            return Err(TransferError::ShortTransfer {
                expected: size,
                actual: done,
            });
        }
        let chunk = &buf[..read];
        sink.write_chunk(chunk).await?;
        crc.update(chunk);
        md5.consume(chunk);
        done += read as u64;
    }

    Ok(TransferSummary {
        bytes: done,
        crc32: crc.finalize(),
        md5: md5.compute().0,
    })
}

/// One side of a file transfer, seen from the side that runs it.
#[derive(Debug)]
pub enum TransferJob {
    /// Stream an already opened file to the peer, then send its CRC.
    Upload { source: File, size: u64 },
    /// Receive bytes into a temp file next to `target` and verify the peer's CRC.
    Download { target: PathBuf, size: u64 },
}

#[derive(Debug)]
pub enum TransferOutcome {
    /// The peer's reply to our CRC message. It may still be a failure envelope.
    Sent {
        summary: TransferSummary,
        response: Envelope,
    },
    /// Verified data waiting in `temp`. The caller acknowledges and promotes it.
    Received {
        summary: TransferSummary,
        temp: PathBuf,
    },
}

impl TransferJob {
    pub async fn run<S>(self, stream: &mut MessageStream<S>) -> Result<TransferOutcome, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self {
            TransferJob::Upload { mut source, size } => {
                let summary = pump(&mut source, stream, size, TRANSFER_CHUNK_SIZE).await?;
                let crc = Envelope::request(
                    Command::Crc,
                    &CrcMessage {
                        crc: summary.crc32,
                    },
                )?;
                let response = stream.exchange(&crc).await?;
                Ok(TransferOutcome::Sent { summary, response })
            }
            TransferJob::Download { target, size } => {
                let temp = temp_path(&target);
                match receive_into(stream, &temp, size).await {
                    Ok(summary) => Ok(TransferOutcome::Received { summary, temp }),
                    Err(err) => {
                        let _ = tokio::fs::remove_file(&temp).await;
                        Err(err)
                    }
                }
            }
        }
    }
}

async fn receive_into<S>(
    stream: &mut MessageStream<S>,
    temp: &Path,
    size: u64,
) -> Result<TransferSummary, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Some(parent) = temp.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = File::create(temp).await?;
    let summary = pump(stream, &mut file, size, TRANSFER_CHUNK_SIZE).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    let message = stream.recv().await?;
    if message.command != Command::Crc.code() {
        return Err(TransferError::UnexpectedMessage(message.command));
    }
    let CrcMessage { crc } = message.body()?;
    if crc != summary.crc32 {
        let reply = Envelope::failure(
            Command::Crc.code(),
            ErrorCode::CrcMismatch,
            format!("expected {crc:08x}, received {:08x}", summary.crc32),
        );
        stream.send(&reply).await?;
        return Err(TransferError::CrcMismatch {
            expected: crc,
            actual: summary.crc32,
        });
    }
    Ok(summary)
}

pub fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    target.with_file_name(name)
}

pub fn is_temp_name(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX)
}

/// Replaces `target` with the verified temp file.
pub async fn promote(temp: &Path, target: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(target).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    tokio::fs::rename(temp, target).await
}

pub fn crc32_of(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

const CHECKSUM_CHUNK_SIZE: usize = 64 * 1024;

struct Discard;

impl ChunkSink for Discard {
    async fn write_chunk(&mut self, _data: &[u8]) -> Result<(), TransferError> {
        Ok(())
    }
}

/// CRC32 and MD5 of a file on disk, computed with the same loop that transfers use.
pub async fn checksum_file(path: &Path) -> Result<TransferSummary, TransferError> {
    let mut file = File::open(path).await?;
    let size = file.metadata().await?.len();
    pump(&mut file, &mut Discard, size, CHECKSUM_CHUNK_SIZE).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    struct SliceSource<'a>(&'a [u8]);

    impl ChunkSource for SliceSource<'_> {
        async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransferError> {
            let n = buf.len().min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    impl ChunkSink for Vec<u8> {
        async fn write_chunk(&mut self, data: &[u8]) -> Result<(), TransferError> {
            self.extend_from_slice(data);
            Ok(())
        }
    }

    #[tokio::test]
    async fn pump_copies_in_chunks_and_checksums() {
        let data = b"hello transfer world".to_vec();
        let mut sink = Vec::new();
        let summary = pump(&mut SliceSource(&data), &mut sink, data.len() as u64, 3)
            .await
            .unwrap();

        assert_eq!(sink, data);
        assert_eq!(summary.bytes, data.len() as u64);
        assert_eq!(summary.crc32, crc32fast::hash(&data));
        assert_eq!(summary.md5, md5::compute(&data).0);
    }

    #[tokio::test]
    async fn pump_reports_short_source() {
        let mut sink = Vec::new();
        let err = pump(&mut SliceSource(b"abc"), &mut sink, 10, 4)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::ShortTransfer {
                expected: 10,
                actual: 3
            }
        ));
    }

    #[tokio::test]
    async fn upload_and_download_meet_over_a_stream() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.bin");
        let target = dir.path().join("out").join("copy.bin");
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&source_path, &data).await.unwrap();

        let (left, right) = duplex(8192);
        let mut sender = MessageStream::new(left);
        let mut receiver = MessageStream::new(right);

        let source = File::open(&source_path).await.unwrap();
        let upload = tokio::spawn(async move {
            TransferJob::Upload {
                source,
                size: 50_000,
            }
            .run(&mut sender)
            .await
        });

        let outcome = TransferJob::Download {
            target: target.clone(),
            size: 50_000,
        }
        .run(&mut receiver)
        .await
        .unwrap();
        let TransferOutcome::Received { temp, summary } = outcome else {
            panic!("expected received outcome");
        };
        assert_eq!(temp, temp_path(&target));
        receiver
            .send(&Envelope::response(Command::Crc))
            .await
            .unwrap();

        let sent = upload.await.unwrap().unwrap();
        let TransferOutcome::Sent { response, summary: sent_summary } = sent else {
            panic!("expected sent outcome");
        };
        assert!(response.is_ok());
        assert_eq!(sent_summary, summary);

        promote(&temp, &target).await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn crc_mismatch_removes_temp_and_replies_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("bad.bin");

        let (left, right) = duplex(1024);
        let mut sender = MessageStream::new(left);
        let mut receiver = MessageStream::new(right);
        let peer = tokio::spawn(async move {
            sender.write_raw(b"12345").await.unwrap();
            let crc = Envelope::request(Command::Crc, &CrcMessage { crc: 1 }).unwrap();
            sender.exchange(&crc).await.unwrap()
        });

        let err = TransferJob::Download {
            target: target.clone(),
            size: 5,
        }
        .run(&mut receiver)
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::CrcMismatch { expected: 1, .. }));
        assert!(!temp_path(&target).exists());

        let reply = peer.await.unwrap();
        assert_eq!(reply.error_code(), ErrorCode::CrcMismatch);
    }

    #[tokio::test]
    async fn checksum_file_matches_in_memory_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 13) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let summary = checksum_file(&path).await.unwrap();

        assert_eq!(summary.bytes, 200_000);
        assert_eq!(summary.crc32, crc32_of(&data));
        assert_eq!(summary.md5, md5::compute(&data).0);
    }

    #[test]
    fn temp_path_appends_suffix() {
        let temp = temp_path(Path::new("/data/docs/a.txt"));
        assert_eq!(temp, PathBuf::from("/data/docs/a.txt.tsyncpart"));
        assert!(is_temp_name("a.txt.tsyncpart"));
        assert!(!is_temp_name("a.txt"));
    }
}
