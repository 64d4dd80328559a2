//! Per-event-kind fan-out to server-streaming subscribers.
//!
//! Each subscription is a bounded channel handed to one gRPC response
//! stream. Delivery is best-effort with a single attempt per message: a
//! subscription whose channel is full (slow consumer) or whose receiver
//! is gone (dropped connection) is removed immediately and the others
//! are unaffected. The subscription set is mutated under a lock; sends
//! happen on a snapshot taken under it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tonic::Status;

use edgeiam_common::{IamError, Result};

/// Buffered messages per subscription, beyond the transport's own window.
const SUBSCRIPTION_CAPACITY: usize = 16;

struct WriterInner<T> {
    subscriptions: Vec<(u64, mpsc::Sender<std::result::Result<T, Status>>)>,
    next_id: u64,
    closed: bool,
}

/// Fan-out writer for one kind of server-streamed event.
pub struct StreamWriter<T> {
    inner: Mutex<WriterInner<T>>,
}

impl<T: Clone> StreamWriter<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WriterInner { subscriptions: Vec::new(), next_id: 0, closed: false }),
        }
    }

    /// Adds a subscription and returns its receiving end.
    ///
    /// Fails with `WrongState` after [`close`](Self::close).
    pub fn subscribe(&self) -> Result<mpsc::Receiver<std::result::Result<T, Status>>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(IamError::wrong_state("stream writer is closed"));
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscriptions.push((id, tx));

        Ok(rx)
    }

    /// Delivers `message` to every live subscription.
    ///
    /// Returns the number of subscriptions that received it.
    pub fn write(&self, message: T) -> usize {
        let targets: Vec<(u64, mpsc::Sender<std::result::Result<T, Status>>)> = {
            let inner = self.inner.lock();
            if inner.closed {
                return 0;
            }
            inner.subscriptions.clone()
        };

        let mut failed = Vec::new();
        let mut delivered = 0;

        for (id, tx) in &targets {
            match tx.try_send(Ok(message.clone())) {
                Ok(()) => delivered += 1,
                Err(_) => failed.push(*id),
            }
        }

        if !failed.is_empty() {
            let mut inner = self.inner.lock();
            inner.subscriptions.retain(|(id, _)| !failed.contains(id));
        }

        delivered
    }

    /// Rejects new subscriptions and drops all current ones, ending the
    /// client streams.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscriptions.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }
}

impl<T: Clone> Default for StreamWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cert-change writers keyed by certificate type.
///
/// Subscribers ask for a specific type, so each type gets its own
/// [`StreamWriter`]. Duplicate subscriptions from the same client are
/// allowed; each one is an independent stream.
pub struct CertWriterSet<T> {
    writers: Mutex<HashMap<String, Arc<StreamWriter<T>>>>,
    closed: Mutex<bool>,
}

impl<T: Clone> CertWriterSet<T> {
    pub fn new() -> Self {
        Self { writers: Mutex::new(HashMap::new()), closed: Mutex::new(false) }
    }

    /// Subscription entry point for one certificate type.
    pub fn subscribe(&self, cert_type: &str) -> Result<mpsc::Receiver<std::result::Result<T, Status>>> {
        if *self.closed.lock() {
            return Err(IamError::wrong_state("stream writer is closed"));
        }

        let writer = {
            let mut writers = self.writers.lock();
            writers
                .entry(cert_type.to_string())
                .or_insert_with(|| Arc::new(StreamWriter::new()))
                .clone()
        };
        writer.subscribe()
    }

    /// Delivers a change event to subscribers of `cert_type`.
    pub fn write(&self, cert_type: &str, message: T) -> usize {
        let writer = self.writers.lock().get(cert_type).cloned();
        match writer {
            Some(writer) => writer.write(message),
            None => 0,
        }
    }

    pub fn close(&self) {
        *self.closed.lock() = true;
        let writers = std::mem::take(&mut *self.writers.lock());
        for writer in writers.values() {
            writer.close();
        }
    }
}

impl<T: Clone> Default for CertWriterSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_reaches_every_subscriber() {
        let writer = StreamWriter::new();
        let mut rx1 = writer.subscribe().unwrap();
        let mut rx2 = writer.subscribe().unwrap();

        assert_eq!(writer.write("hello".to_string()), 2);

        assert_eq!(rx1.try_recv().unwrap().unwrap(), "hello");
        assert_eq!(rx2.try_recv().unwrap().unwrap(), "hello");
    }

    #[test]
    fn test_single_subscriber_observes_dispatch_order() {
        let writer = StreamWriter::new();
        let mut rx = writer.subscribe().unwrap();

        writer.write(1u32);
        writer.write(2u32);
        writer.write(3u32);

        assert_eq!(rx.try_recv().unwrap().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap().unwrap(), 3);
    }

    #[test]
    fn test_dropped_subscriber_is_evicted_others_unaffected() {
        let writer = StreamWriter::new();
        let rx1 = writer.subscribe().unwrap();
        let mut rx2 = writer.subscribe().unwrap();
        drop(rx1);

        assert_eq!(writer.write("msg".to_string()), 1);
        assert_eq!(writer.subscriber_count(), 1);
        assert_eq!(rx2.try_recv().unwrap().unwrap(), "msg");
    }

    #[test]
    fn test_slow_subscriber_is_evicted() {
        let writer = StreamWriter::new();
        let _rx_slow = writer.subscribe().unwrap();
        let mut rx_ok = writer.subscribe().unwrap();

        // Fill the slow subscriber's buffer without draining it.
        for i in 0..SUBSCRIPTION_CAPACITY as u32 {
            writer.write(i);
        }
        assert_eq!(writer.subscriber_count(), 2);

        // One more write overflows the stalled channel and evicts it.
        writer.write(999);
        assert_eq!(writer.subscriber_count(), 1);

        for i in 0..SUBSCRIPTION_CAPACITY as u32 {
            assert_eq!(rx_ok.try_recv().unwrap().unwrap(), i);
        }
        assert_eq!(rx_ok.try_recv().unwrap().unwrap(), 999);
    }

    #[test]
    fn test_close_removes_subscriptions_and_rejects_new() {
        let writer = StreamWriter::new();
        let mut rx = writer.subscribe().unwrap();

        writer.close();
        assert_eq!(writer.subscriber_count(), 0);
        assert!(writer.subscribe().is_err());
        assert_eq!(writer.write("late".to_string()), 0);

        // The client stream ends: the sender side is gone.
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }

    #[test]
    fn test_cert_writer_set_routes_by_type() {
        let set = CertWriterSet::new();
        let mut rx_iam = set.subscribe("iam").unwrap();
        let mut rx_online = set.subscribe("online").unwrap();

        assert_eq!(set.write("iam", "cert-a".to_string()), 1);
        assert_eq!(set.write("online", "cert-b".to_string()), 1);
        assert_eq!(set.write("offline", "cert-c".to_string()), 0);

        assert_eq!(rx_iam.try_recv().unwrap().unwrap(), "cert-a");
        assert!(rx_iam.try_recv().is_err());
        assert_eq!(rx_online.try_recv().unwrap().unwrap(), "cert-b");
    }

    #[test]
    fn test_cert_writer_set_allows_duplicate_subscriptions() {
        let set = CertWriterSet::new();
        let mut rx1 = set.subscribe("iam").unwrap();
        let mut rx2 = set.subscribe("iam").unwrap();

        assert_eq!(set.write("iam", 7u32), 2);
        assert_eq!(rx1.try_recv().unwrap().unwrap(), 7);
        assert_eq!(rx2.try_recv().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_cert_writer_set_close() {
        let set = CertWriterSet::new();
        let _rx = set.subscribe("iam").unwrap();
        set.close();
        assert!(set.subscribe("iam").is_err());
        assert_eq!(set.write("iam", 1u32), 0);
    }
}
