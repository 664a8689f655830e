//! Hybrid channel backing both directions of the exchange.
//!
//! Messages travel through a `crossbeam::channel` so the synchronous decision
//! thread can block on them cheaply, while a `tokio::sync::Notify` lets the
//! async stream tasks await the same channel without polling.
//!
//! Two flavours:
//! - [`Flavor::Overwrite`]: a single slot. A send replaces whatever value has
//!   not been consumed yet, so the receiver always sees the latest one.
//! - [`Flavor::Queue`]: unbounded FIFO, every value is delivered.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, TryRecvError, TrySendError};
use tokio::sync::Notify;

use super::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Overwrite,
    Queue,
}

struct Shared {
    /// Woken on every send and when the last sender goes away.
    recv_notify: Notify,
    receiver_dropped: AtomicBool,
}

/// Sending half. Not cloneable: each conduit has exactly one producer.
pub struct ConduitSender<T> {
    /// Taken on drop so the disconnect is visible before receivers wake.
    inner: Option<channel::Sender<T>>,
    /// Handle used to evict the pending value in overwrite mode.
    evict: Option<channel::Receiver<T>>,
    shared: Arc<Shared>,
}

impl<T> Drop for ConduitSender<T> {
    fn drop(&mut self) {
        drop(self.inner.take());
        self.shared.recv_notify.notify_waiters();
    }
}

impl<T> ConduitSender<T> {
    /// Deliver `msg` without blocking. In overwrite mode an unread value is
    /// discarded and reported as `Ok(true)`.
    pub fn send(&self, msg: T) -> Result<bool, ExchangeError> {
        let Some(inner) = self.inner.as_ref() else {
            return Err(ExchangeError::Disconnected);
        };
        if self.shared.receiver_dropped.load(Ordering::Acquire) {
            return Err(ExchangeError::Disconnected);
        }
        let mut msg = msg;
        let mut replaced = false;
        loop {
            match inner.try_send(msg) {
                Ok(()) => {
                    self.shared.recv_notify.notify_waiters();
                    return Ok(replaced);
                }
                Err(TrySendError::Full(returned)) => {
                    msg = returned;
                    if let Some(evict) = &self.evict {
                        replaced |= evict.try_recv().is_ok();
                    }
                }
                Err(TrySendError::Disconnected(_)) => return Err(ExchangeError::Disconnected),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.receiver_dropped.load(Ordering::Acquire)
    }
}

/// Receiving half, usable from both sync and async code.
pub struct ConduitReceiver<T> {
    inner: channel::Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> Drop for ConduitReceiver<T> {
    fn drop(&mut self) {
        self.shared.receiver_dropped.store(true, Ordering::Release);
    }
}

impl<T> ConduitReceiver<T> {
    /// `Ok(None)` when nothing is pending.
    pub fn try_recv(&self) -> Result<Option<T>, ExchangeError> {
        match self.inner.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ExchangeError::Disconnected),
        }
    }

    /// Block the current thread for at most `timeout`.
    ///
    /// Must not be called from inside the async runtime.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, ExchangeError> {
        self.inner.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ExchangeError::Timeout,
            RecvTimeoutError::Disconnected => ExchangeError::Disconnected,
        })
    }

    pub async fn recv_async(&self) -> Result<T, ExchangeError> {
        loop {
            // Register interest before checking so a send racing with the
            // check still wakes us.
            let mut notified = pin!(self.shared.recv_notify.notified());
            notified.as_mut().enable();
            if let Some(msg) = self.try_recv()? {
                return Ok(msg);
            }
            notified.await;
        }
    }

    pub async fn recv_timeout_async(&self, timeout: Duration) -> Result<T, ExchangeError> {
        tokio::time::timeout(timeout, self.recv_async())
            .await
            .map_err(|_| ExchangeError::Timeout)?
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub fn conduit<T>(flavor: Flavor) -> (ConduitSender<T>, ConduitReceiver<T>) {
    let (tx, rx) = match flavor {
        Flavor::Overwrite => channel::bounded(1),
        Flavor::Queue => channel::unbounded(),
    };
    let shared = Arc::new(Shared {
        recv_notify: Notify::new(),
        receiver_dropped: AtomicBool::new(false),
    });
    let evict = (flavor == Flavor::Overwrite).then(|| rx.clone());
    (
        ConduitSender {
            inner: Some(tx),
            evict,
            shared: shared.clone(),
        },
        ConduitReceiver { inner: rx, shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_keeps_latest() {
        let (tx, rx) = conduit::<u32>(Flavor::Overwrite);
        assert!(!tx.send(1).unwrap());
        assert!(tx.send(2).unwrap());
        assert!(tx.send(3).unwrap());
        assert_eq!(rx.try_recv().unwrap(), Some(3));
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn queue_keeps_everything_in_order() {
        let (tx, rx) = conduit::<u32>(Flavor::Queue);
        for i in 0..100 {
            assert!(!tx.send(i).unwrap());
        }
        for i in 0..100 {
            assert_eq!(rx.recv_timeout(Duration::from_millis(10)).unwrap(), i);
        }
    }

    #[test]
    fn blocking_read_times_out() {
        let (_tx, rx) = conduit::<u32>(Flavor::Overwrite);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(20)),
            Err(ExchangeError::Timeout)
        );
    }

    #[test]
    fn dropping_either_side_disconnects() {
        let (tx, rx) = conduit::<u32>(Flavor::Overwrite);
        tx.send(7).unwrap();
        drop(tx);
        // buffered value still readable
        assert_eq!(rx.try_recv().unwrap(), Some(7));
        assert_eq!(rx.try_recv(), Err(ExchangeError::Disconnected));

        let (tx, rx) = conduit::<u32>(Flavor::Overwrite);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.send(1), Err(ExchangeError::Disconnected));
    }

    #[tokio::test]
    async fn async_receiver_wakes_on_send_from_thread() {
        let (tx, rx) = conduit::<u32>(Flavor::Queue);
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.send(42).unwrap();
            tx
        });
        assert_eq!(rx.recv_timeout_async(Duration::from_secs(5)).await, Ok(42));
        drop(sender.join().unwrap());
        assert_eq!(rx.recv_async().await, Err(ExchangeError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn async_read_times_out() {
        let (_tx, rx) = conduit::<u32>(Flavor::Overwrite);
        assert_eq!(
            rx.recv_timeout_async(Duration::from_secs(30)).await,
            Err(ExchangeError::Timeout)
        );
    }
}
