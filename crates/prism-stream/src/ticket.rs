//! Completion handle for a submitted chunk.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Resolves to `true` once a worker has processed the chunk, or `false`
/// when it was rejected, failed or dropped at shutdown.
///
/// Await it from async code or call [`ChunkTicket::wait`] from a plain
/// thread.
#[must_use = "a ticket does nothing unless awaited or waited on"]
#[derive(Debug)]
pub struct ChunkTicket {
    rx: oneshot::Receiver<bool>,
}

impl ChunkTicket {
    pub(crate) fn pending() -> (oneshot::Sender<bool>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A ticket that is already resolved.
    pub fn resolved(value: bool) -> Self {
        let (tx, ticket) = Self::pending();
        let _ = tx.send(value);
        ticket
    }

    /// Blocks the current thread until the chunk is resolved.
    ///
    /// Must not be called from inside an async runtime worker; await the
    /// ticket there instead.
    pub fn wait(self) -> bool {
        self.rx.blocking_recv().unwrap_or(false)
    }
}

impl Future for ChunkTicket {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_wait() {
        assert!(ChunkTicket::resolved(true).wait());
        assert!(!ChunkTicket::resolved(false).wait());
    }

    #[test]
    fn test_dropped_sender_resolves_false() {
        let (tx, ticket) = ChunkTicket::pending();
        drop(tx);
        assert!(!ticket.wait());
    }

    #[tokio::test]
    async fn test_await_from_other_thread() {
        let (tx, ticket) = ChunkTicket::pending();
        std::thread::spawn(move || {
            let _ = tx.send(true);
        });
        assert!(ticket.await);
    }
}
