//! Admission control
//!
//! At most `max_concurrent` requests run at once. Up to `max_queued` more
//! wait their turn in FIFO order (tokio's semaphore is fair). Anything beyond
//! that is rejected immediately with a retryable `Overloaded` error.

use crate::storage::error::{StoreError, StoreResult};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_concurrent: usize,
    pub max_queued: usize,
    /// Give up waiting in the queue after this long
    pub queue_timeout: Option<Duration>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            max_queued: 256,
            queue_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ThrottleStats {
    pub in_flight: usize,
    pub queued: usize,
    pub admitted: u64,
    pub queued_total: u64,
    pub rejected: u64,
    pub peak_in_flight: usize,
    pub peak_queued: usize,
}

#[derive(Debug)]
struct Inner {
    config: ThrottleConfig,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    admitted: AtomicU64,
    queued_total: AtomicU64,
    rejected: AtomicU64,
    peak_in_flight: AtomicUsize,
    peak_queued: AtomicUsize,
}

impl Inner {
    fn grant(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Permit {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::Relaxed);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Permit {
            inner: self.clone(),
            _permit: permit,
        }
    }
}

/// Result of a non-blocking admission attempt
pub enum Admission {
    /// Run now
    Admitted(Permit),
    /// Holds a queue slot; wait on it for a permit
    Queued(Ticket),
    /// Queue is full
    Rejected,
}

/// A running request. Dropping it lets the next queued request in.
#[derive(Debug)]
pub struct Permit {
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A reserved place in the admission queue
pub struct Ticket {
    inner: Arc<Inner>,
}

impl Ticket {
    /// Wait for a permit, bounded by the queue timeout
    pub async fn wait(self) -> StoreResult<Permit> {
        let acquire = self.inner.permits.clone().acquire_owned();
        let permit = match self.inner.config.queue_timeout {
            Some(limit) => match tokio::time::timeout(limit, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    self.inner.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(StoreError::Overloaded(format!(
                        "no capacity within {:?}",
                        limit
                    )));
                }
            },
            None => acquire.await,
        };
        let permit = permit.map_err(|_| StoreError::Closed)?;
        Ok(self.inner.grant(permit))
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.inner.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct Throttle {
    inner: Arc<Inner>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                config,
                permits,
                in_flight: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                admitted: AtomicU64::new(0),
                queued_total: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                peak_in_flight: AtomicUsize::new(0),
                peak_queued: AtomicUsize::new(0),
            }),
        }
    }

    pub fn try_admit(&self) -> Admission {
        let inner = &self.inner;
        if let Ok(permit) = inner.permits.clone().try_acquire_owned() {
            return Admission::Admitted(inner.grant(permit));
        }

        let max_queued = inner.config.max_queued;
        match inner
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < max_queued).then_some(queued + 1)
            }) {
            Ok(previous) => {
                inner.peak_queued.fetch_max(previous + 1, Ordering::Relaxed);
                inner.queued_total.fetch_add(1, Ordering::Relaxed);
                Admission::Queued(Ticket {
                    inner: inner.clone(),
                })
            }
            Err(_) => {
                inner.rejected.fetch_add(1, Ordering::Relaxed);
                Admission::Rejected
            }
        }
    }

    /// Admit now, or wait in the queue; `Overloaded` if the queue is full
    pub async fn admit(&self) -> StoreResult<Permit> {
        match self.try_admit() {
            Admission::Admitted(permit) => Ok(permit),
            Admission::Queued(ticket) => ticket.wait().await,
            Admission::Rejected => {
                tracing::debug!(
                    "Rejecting request: {} running, {} queued",
                    self.inner.in_flight.load(Ordering::Relaxed),
                    self.inner.queued.load(Ordering::Relaxed)
                );
                Err(StoreError::Overloaded(format!(
                    "admission queue full ({} waiting)",
                    self.inner.config.max_queued
                )))
            }
        }
    }

    /// Stop admitting; queued waiters fail with `Closed`
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn stats(&self) -> ThrottleStats {
        let inner = &self.inner;
        ThrottleStats {
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            queued: inner.queued.load(Ordering::Relaxed),
            admitted: inner.admitted.load(Ordering::Relaxed),
            queued_total: inner.queued_total.load(Ordering::Relaxed),
            rejected: inner.rejected.load(Ordering::Relaxed),
            peak_in_flight: inner.peak_in_flight.load(Ordering::Relaxed),
            peak_queued: inner.peak_queued.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(max_concurrent: usize, max_queued: usize) -> Throttle {
        Throttle::new(ThrottleConfig {
            max_concurrent,
            max_queued,
            queue_timeout: Some(Duration::from_secs(5)),
        })
    }

    #[tokio::test]
    async fn test_admit_queue_reject() {
        let t = throttle(1, 1);
        let Admission::Admitted(running) = t.try_admit() else {
            panic!("first request should run");
        };
        let Admission::Queued(ticket) = t.try_admit() else {
            panic!("second request should queue");
        };
        assert!(matches!(t.try_admit(), Admission::Rejected));
        assert!(t.admit().await.unwrap_err().is_retryable());

        drop(running);
        let permit = ticket.wait().await.unwrap();
        let stats = t.stats();
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.rejected, 2);
        drop(permit);
        assert_eq!(t.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_queue_timeout_is_overloaded() {
        let t = Throttle::new(ThrottleConfig {
            max_concurrent: 1,
            max_queued: 4,
            queue_timeout: Some(Duration::from_millis(30)),
        });
        let _running = t.admit().await.unwrap();
        let err = t.admit().await.unwrap_err();
        assert!(matches!(err, StoreError::Overloaded(_)));
        assert_eq!(t.stats().queued, 0);
    }

    /// Under a burst, concurrency and queue depth never exceed their limits
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_respects_bounds() {
        let t = throttle(4, 8);
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let t = t.clone();
            tasks.push(tokio::spawn(async move {
                match t.admit().await {
                    Ok(_permit) => {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        true
                    }
                    Err(e) => {
                        assert!(e.is_retryable());
                        false
                    }
                }
            }));
        }
        let mut done = 0;
        for task in tasks {
            if task.await.unwrap() {
                done += 1;
            }
        }

        let stats = t.stats();
        assert!(stats.peak_in_flight <= 4);
        assert!(stats.peak_queued <= 8);
        assert_eq!(stats.admitted, done);
        assert_eq!(stats.admitted + stats.rejected, 64);
        assert_eq!((stats.in_flight, stats.queued), (0, 0));
    }
}
