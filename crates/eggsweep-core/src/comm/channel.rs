//! Lock-free channels for inter-thread communication
//!
//! Thin wrapper around crossbeam-channel mapped onto the crate error type.
//! Used for the per-link outbound frame queues.

use crossbeam_channel::{self as cc, RecvTimeoutError, TryRecvError, TrySendError};
use std::time::Duration;

use crate::{Error, Result};

/// Sender half of a channel
#[derive(Debug)]
pub struct Sender<T> {
    inner: cc::Sender<T>,
}

impl<T> Sender<T> {
    /// Try to send without blocking
    #[inline]
    pub fn try_send(&self, value: T) -> Result<()> {
        match self.inner.try_send(value) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::ChannelFull),
            Err(TrySendError::Disconnected(_)) => Err(Error::ChannelClosed),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Receiver half of a channel
#[derive(Debug)]
pub struct Receiver<T> {
    inner: cc::Receiver<T>,
}

impl<T> Receiver<T> {
    /// Try to receive without blocking
    #[inline]
    pub fn try_recv(&self) -> Result<Option<T>> {
        match self.inner.try_recv() {
            Ok(v) => Ok(Some(v)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::ChannelClosed),
        }
    }

    /// Receive with a timeout
    #[inline]
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.inner.recv_timeout(timeout) {
            Ok(v) => Ok(Some(v)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::ChannelClosed),
        }
    }

    /// Drain all currently queued messages
    #[inline]
    pub fn drain(&self) -> Vec<T> {
        let mut v = Vec::with_capacity(self.inner.len());
        while let Ok(msg) = self.inner.try_recv() {
            v.push(msg);
        }
        v
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Create a bounded channel with the specified capacity
pub fn bounded_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = cc::bounded(capacity);
    (Sender { inner: tx }, Receiver { inner: rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_send_and_recv() {
        let (tx, rx) = bounded_channel::<u32>(2);
        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();
        assert!(matches!(tx.try_send(3), Err(Error::ChannelFull)));
        assert_eq!(rx.try_recv().unwrap(), Some(1));
        assert_eq!(rx.try_recv().unwrap(), Some(2));
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn test_drain_preserves_order() {
        let (tx, rx) = bounded_channel::<u32>(8);
        for i in 0..5 {
            tx.try_send(i).unwrap();
        }
        assert_eq!(rx.drain(), vec![0, 1, 2, 3, 4]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_recv_timeout_empty() {
        let (_tx, rx) = bounded_channel::<u32>(1);
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(5)).unwrap(),
            None
        );
    }
}
