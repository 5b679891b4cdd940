//! Command queue: producers push protocol messages, the sender drains them
//! in FIFO order.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

use crate::value::Fields;

/// Bound on one queue wait. Keeps the sender loop responsive to shutdown
/// without spinning.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// File streamed immediately after a command's header frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub path: PathBuf,
    /// Byte count promised by the header; exactly this many bytes follow.
    pub size: u64,
    /// Segment name, `None` for the overlay metadata payload.
    pub segment: Option<String>,
}

/// One queued message: header fields plus an optional file body.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub header: Fields,
    pub body: Option<FilePayload>,
}

impl Command {
    pub fn bare(header: Fields) -> Self {
        Self { header, body: None }
    }

    pub fn with_body(header: Fields, body: FilePayload) -> Self {
        Self {
            header,
            body: Some(body),
        }
    }
}

/// Producer half. Clones share one queue; pushes never block.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandQueue {
    /// Enqueue a command. Discarded if the consumer already shut down.
    pub fn push(&self, command: Command) {
        let _ = self.tx.send(command);
    }
}

/// Consumer half, held by the sender task.
#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<Command>,
}

/// Outcome of one bounded pop.
#[derive(Debug)]
pub enum Pop {
    Item(Command),
    /// Nothing arrived within the wait; the caller re-checks shutdown and
    /// tries again.
    Empty,
    /// Every producer is gone; no further commands can arrive.
    Disconnected,
}

impl CommandReceiver {
    pub async fn pop(&mut self, wait: Duration) -> Pop {
        match time::timeout(wait, self.rx.recv()).await {
            Ok(Some(command)) => Pop::Item(command),
            Ok(None) => Pop::Disconnected,
            Err(_) => Pop::Empty,
        }
    }
}

pub fn command_queue() -> (CommandQueue, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandQueue { tx }, CommandReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: i64) -> Command {
        Command::bare(Fields::new().with("command", n))
    }

    #[tokio::test]
    async fn pops_in_push_order() {
        let (queue, mut rx) = command_queue();
        for n in 0..5 {
            queue.push(numbered(n));
        }
        for n in 0..5 {
            match rx.pop(POLL_INTERVAL).await {
                Pop::Item(cmd) => assert_eq!(cmd, numbered(n)),
                other => panic!("expected item, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn clones_feed_one_queue() {
        let (queue, mut rx) = command_queue();
        let clone = queue.clone();
        queue.push(numbered(1));
        clone.push(numbered(2));
        queue.push(numbered(3));
        let mut seen = Vec::new();
        for _ in 0..3 {
            if let Pop::Item(cmd) = rx.pop(POLL_INTERVAL).await {
                seen.push(cmd);
            }
        }
        assert_eq!(seen, [numbered(1), numbered(2), numbered(3)]);
    }

    #[tokio::test]
    async fn empty_pop_returns_after_the_wait() {
        let (_queue, mut rx) = command_queue();
        let started = std::time::Instant::now();
        assert!(matches!(rx.pop(Duration::from_millis(20)).await, Pop::Empty));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn dropped_producers_disconnect_after_draining() {
        let (queue, mut rx) = command_queue();
        queue.push(numbered(1));
        drop(queue);
        assert!(matches!(rx.pop(POLL_INTERVAL).await, Pop::Item(_)));
        assert!(matches!(rx.pop(POLL_INTERVAL).await, Pop::Disconnected));
    }
}
