use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

/// Buffer between a producer task and its subscriber.
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// Handle to a continuous push-based result stream.
///
/// Items are delivered in the order the producer emits them. Dropping the
/// handle (or calling [`Subscription::unsubscribe`]) aborts the producer
/// task, which is the only teardown a listener needs.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    producer: Option<AbortHandle>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::Receiver<T>, producer: &JoinHandle<()>) -> Self {
        Self {
            rx,
            producer: Some(producer.abort_handle()),
        }
    }

    /// A subscription fed by a sender the caller drives directly.
    pub fn channel() -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (tx, Self { rx, producer: None })
    }

    /// Next item, or `None` once the producer has finished.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl<T: Clone + Send + Sync + 'static> Subscription<T> {
    /// Forward every value published on a watch channel, starting with the
    /// current one.
    pub fn from_watch(mut watch_rx: watch::Receiver<T>) -> Self {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let producer = tokio::spawn(async move {
            loop {
                let value = watch_rx.borrow_and_update().clone();
                if tx.send(value).await.is_err() {
                    break;
                }
                if watch_rx.changed().await.is_err() {
                    break;
                }
            }
        });
        Self::new(rx, &producer)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn drop_aborts_producer() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        let producer = tokio::spawn(async move {
            let mut n = 0;
            while tx.send(n).await.is_ok() {
                n += 1;
            }
        });
        let mut sub = Subscription::new(rx, &producer);
        assert_eq!(sub.next().await, Some(0));
        drop(sub);
        // either aborted or stopped because the receiver went away
        assert!(producer.await.map_or_else(|e| e.is_cancelled(), |_| true));
    }

    #[tokio::test]
    async fn watch_subscription_emits_current_then_changes() {
        let (watch_tx, watch_rx) = watch::channel(1u32);
        let mut sub = Subscription::from_watch(watch_rx);
        assert_eq!(sub.next().await, Some(1));
        watch_tx.send_replace(2);
        assert_eq!(StreamExt::next(&mut sub).await, Some(2));
    }
}
