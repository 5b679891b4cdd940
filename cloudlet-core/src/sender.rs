//! Sender task: drains the command queue onto the socket write half,
//! streaming file payloads after their header frames.

use std::io;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::queue::{Command, CommandReceiver, Pop, POLL_INTERVAL};
use crate::wire;

/// Chunk size for streaming file payloads.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Notices from the sender task to the session driver.
#[derive(Debug)]
pub enum SenderNotice {
    /// Overlay metadata payload fully written.
    MetadataSent { bytes: u64 },
    /// One segment payload fully written.
    SegmentSent { name: String, bytes: u64 },
    /// Cumulative payload bytes written so far, headers excluded.
    Progress { total_sent: u64 },
    /// A payload file could not be opened. Its header was never written;
    /// the stream stays frame-aligned.
    FileUnavailable { name: String, error: String },
    /// Loop ended. `error` carries the fatal write failure, `None` when the
    /// loop stopped on shutdown or a drained queue.
    Stopped { error: Option<io::Error> },
}

/// Run the sender until shutdown, queue disconnect, or a write failure.
/// Socket writes are raced against the shutdown flag, so a peer that stops
/// reading cannot pin the task. Always emits `Stopped` last.
pub async fn run_sender<W>(
    mut writer: W,
    mut commands: CommandReceiver,
    notices: mpsc::UnboundedSender<SenderNotice>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut total_sent: u64 = 0;
    let error = loop {
        if *shutdown.borrow() {
            break None;
        }
        let command = match commands.pop(POLL_INTERVAL).await {
            Pop::Empty => continue,
            Pop::Disconnected => break None,
            Pop::Item(command) => command,
        };
        let written = write_command(
            &mut writer,
            &command,
            &mut chunk,
            &mut total_sent,
            &notices,
            &mut shutdown,
        )
        .await;
        match written {
            Ok(Written::Complete(Some(done))) => {
                let _ = notices.send(done);
            }
            Ok(Written::Complete(None)) => {}
            Ok(Written::Interrupted) => break None,
            Err(WriteFailure::File { name, error }) => {
                warn!(%name, %error, "payload unavailable, command dropped");
                let _ = notices.send(SenderNotice::FileUnavailable { name, error });
            }
            Err(WriteFailure::Io(err)) => break Some(err),
        }
    };
    debug!(total_sent, "sender loop ended");
    let _ = notices.send(SenderNotice::Stopped { error });
}

enum WriteFailure {
    /// Failed before the header went out; the stream is still clean.
    File { name: String, error: String },
    /// The socket or a mid-stream payload read failed; the stream is dead.
    Io(io::Error),
}

impl From<io::Error> for WriteFailure {
    fn from(err: io::Error) -> Self {
        WriteFailure::Io(err)
    }
}

enum Written {
    /// Command fully on the wire, with the completion notice for payloads.
    Complete(Option<SenderNotice>),
    /// Shutdown fired mid-write; the stream is only fit for teardown.
    Interrupted,
}

async fn write_command<W>(
    writer: &mut W,
    command: &Command,
    chunk: &mut [u8],
    total_sent: &mut u64,
    notices: &mpsc::UnboundedSender<SenderNotice>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Written, WriteFailure>
where
    W: AsyncWrite + Unpin,
{
    // The payload is opened before the header goes out; a missing file must
    // not leave the server waiting on promised bytes.
    let mut file = match &command.body {
        Some(payload) => match File::open(&payload.path).await {
            Ok(file) => Some(file),
            Err(err) => {
                return Err(WriteFailure::File {
                    name: payload
                        .segment
                        .clone()
                        .unwrap_or_else(|| payload.path.display().to_string()),
                    error: err.to_string(),
                });
            }
        },
        None => None,
    };

    let frame = wire::encode_frame(&command.header)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if !write_racing_shutdown(writer, &frame, shutdown).await? {
        return Ok(Written::Interrupted);
    }
    writer.flush().await?;

    let (Some(payload), Some(file)) = (&command.body, file.as_mut()) else {
        return Ok(Written::Complete(None));
    };

    let mut remaining = payload.size;
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        let n = file.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(WriteFailure::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("payload truncated with {remaining} bytes left"),
            )));
        }
        if !write_racing_shutdown(writer, &chunk[..n], shutdown).await? {
            return Ok(Written::Interrupted);
        }
        remaining -= n as u64;
        *total_sent += n as u64;
        let _ = notices.send(SenderNotice::Progress {
            total_sent: *total_sent,
        });
    }
    writer.flush().await?;

    Ok(Written::Complete(Some(match &payload.segment {
        Some(name) => SenderNotice::SegmentSent {
            name: name.clone(),
            bytes: payload.size,
        },
        None => SenderNotice::MetadataSent {
            bytes: payload.size,
        },
    })))
}

/// One write raced against shutdown. `Ok(false)` means the flag fired first;
/// the bytes may be partially written, so the stream is only fit for closing.
async fn write_racing_shutdown<W>(
    writer: &mut W,
    bytes: &[u8],
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, io::Error>
where
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        result = writer.write_all(bytes) => result.map(|()| true),
        _ = shutdown.wait_for(|stop| *stop) => Ok(false),
    }
}
