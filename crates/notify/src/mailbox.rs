//! Async push-pull queue backing one SSE stream.
//!
//! A mailbox pairs an unbounded sender (held by the channel registry) with
//! a `Stream` consumer (held by the HTTP response). Pushing resolves a
//! waiting consumer or buffers; pulling drains the buffer or suspends.
//! Dropping either half ends the stream: a dropped consumer makes the next
//! `push` report failure so the holder can prune it, and the close hook
//! runs exactly once however the consumer goes away.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

pub fn mailbox<T>() -> (MailboxSender<T>, MailboxStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MailboxSender { tx },
        MailboxStream { rx, on_close: None },
    )
}

#[derive(Debug)]
pub struct MailboxSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> MailboxSender<T> {
    /// Deliver a message; `false` means the consumer is gone.
    pub fn push(&self, message: T) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct MailboxStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> MailboxStream<T> {
    /// Run `hook` once when the stream terminates (drop or sender close).
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    fn finish(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl<T> Stream for MailboxStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<T> Drop for MailboxStream<T> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn buffered_pushes_drain_in_order() {
        let (tx, mut stream) = mailbox();
        assert!(tx.push(1));
        assert!(tx.push(2));
        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));
    }

    #[tokio::test]
    async fn pull_suspends_until_push() {
        let (tx, mut stream) = mailbox();
        let pushed = tokio::spawn(async move {
            tokio::task::yield_now().await;
            tx.push(7)
        });
        assert_eq!(stream.next().await, Some(7));
        assert!(pushed.await.unwrap());
    }

    #[tokio::test]
    async fn dropped_consumer_fails_push() {
        let (tx, stream) = mailbox::<u32>();
        drop(stream);
        assert!(!tx.push(1));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn close_hook_runs_once_on_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let (_tx, stream) = mailbox::<u32>();
        let stream = stream.on_close(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        drop(stream);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_hook_runs_when_sender_side_ends() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let (tx, stream) = mailbox::<u32>();
        let mut stream = stream.on_close(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        tx.push(1);
        drop(tx);
        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Terminating again (drop) must not re-run the hook.
        drop(stream);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
