//! Receiver task: reads frames off the socket read half and forwards them
//! unchanged. Interpretation belongs to the session driver.

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::value::Fields;
use crate::wire::{self, FrameDecodeError};

/// Events forwarded to the session driver.
#[derive(Debug)]
pub enum ReceiverEvent {
    Frame(Fields),
    /// Stream ended cleanly on a frame boundary.
    Closed,
    /// Read or decode failure; the connection is unusable afterwards.
    Failed(FrameDecodeError),
}

/// Run the receiver until EOF, a failure, or shutdown. Terminates the event
/// stream with `Closed` or `Failed` unless shut down first.
pub async fn run_receiver<R>(
    mut reader: R,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            frame = wire::read_frame(&mut reader) => match frame {
                Ok(Some(fields)) => {
                    if events.send(ReceiverEvent::Frame(fields)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = events.send(ReceiverEvent::Closed);
                    break;
                }
                Err(err) => {
                    let _ = events.send(ReceiverEvent::Failed(err));
                    break;
                }
            }
        }
    }
    debug!("receiver loop ended");
}
