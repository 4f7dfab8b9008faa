//! # Transaction Scheduler
//!
//! Serializes all bus activity on one transport. Every master transaction,
//! every slave receive/respond cycle and every line reconfiguration runs
//! while holding a [`BusPermit`]; only one permit exists at a time.
//!
//! Waiters are served strictly first come, first served: the underlying
//! `tokio::sync::Mutex` is fair, and each caller draws a ticket when it
//! reaches the scheduler so the order can be observed in logs and tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Who holds the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusRole {
    /// Master request/response transaction
    Master,
    /// Slave receive and respond cycle
    Slave,
    /// Line configuration change
    Config,
}

impl fmt::Display for BusRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusRole::Master => write!(f, "master"),
            BusRole::Slave => write!(f, "slave"),
            BusRole::Config => write!(f, "config"),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    next_ticket: AtomicU64,
    waiting: AtomicUsize,
    granted: AtomicU64,
}

/// FIFO mutual exclusion for one transport
#[derive(Debug, Clone)]
pub struct TransactionScheduler {
    bus: Arc<Mutex<()>>,
    counters: Arc<Counters>,
}

impl Default for TransactionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionScheduler {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Mutex::new(())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for exclusive use of the bus
    pub async fn acquire(&self, role: BusRole) -> BusPermit {
        let ticket = self.counters.next_ticket.fetch_add(1, Ordering::SeqCst);
        let waiting = WaitingGuard::enter(&self.counters);
        trace!("bus ticket {} queued ({})", ticket, role);

        let guard = self.bus.clone().lock_owned().await;
        drop(waiting);
        self.grant(guard, ticket, role)
    }

    /// Take the bus only if it is free and nobody is queued
    pub fn try_acquire(&self, role: BusRole) -> Option<BusPermit> {
        let guard = self.bus.clone().try_lock_owned().ok()?;
        let ticket = self.counters.next_ticket.fetch_add(1, Ordering::SeqCst);
        Some(self.grant(guard, ticket, role))
    }

    /// Callers currently waiting for the bus
    pub fn queued(&self) -> usize {
        self.counters.waiting.load(Ordering::SeqCst)
    }

    /// Permits handed out so far
    pub fn granted(&self) -> u64 {
        self.counters.granted.load(Ordering::SeqCst)
    }

    /// Whether some permit is currently held
    pub fn is_busy(&self) -> bool {
        self.bus.try_lock().is_err()
    }

    fn grant(&self, guard: OwnedMutexGuard<()>, ticket: u64, role: BusRole) -> BusPermit {
        self.counters.granted.fetch_add(1, Ordering::SeqCst);
        trace!("bus ticket {} granted ({})", ticket, role);
        BusPermit {
            _guard: guard,
            ticket,
            role,
            acquired_at: Instant::now(),
        }
    }
}

/// Decrements the waiting count even if the acquiring future is dropped
struct WaitingGuard<'a>(&'a Counters);

impl<'a> WaitingGuard<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.waiting.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive use of the bus; released on drop
#[derive(Debug)]
pub struct BusPermit {
    _guard: OwnedMutexGuard<()>,
    ticket: u64,
    role: BusRole,
    acquired_at: Instant,
}

impl BusPermit {
    /// Position in the order of arrival at the scheduler
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn role(&self) -> BusRole {
        self.role
    }

    pub fn held_for(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for BusPermit {
    fn drop(&mut self) {
        trace!(
            "bus ticket {} released ({}) after {:?}",
            self.ticket,
            self.role,
            self.acquired_at.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_single_permit() {
        let scheduler = TransactionScheduler::new();
        let permit = scheduler.acquire(BusRole::Master).await;
        assert!(scheduler.is_busy());
        assert!(scheduler.try_acquire(BusRole::Slave).is_none());

        drop(permit);
        assert!(!scheduler.is_busy());
        assert!(scheduler.try_acquire(BusRole::Slave).is_some());
    }

    #[tokio::test]
    async fn test_waiters_served_in_arrival_order() {
        let scheduler = TransactionScheduler::new();
        let held = scheduler.acquire(BusRole::Master).await;

        let mut first = task::spawn(scheduler.acquire(BusRole::Master));
        let mut second = task::spawn(scheduler.acquire(BusRole::Slave));
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert_eq!(scheduler.queued(), 2);

        drop(held);
        assert!(first.is_woken());
        assert_pending!(second.poll());
        let first_permit = assert_ready!(first.poll());
        assert_eq!(first_permit.ticket(), 1);
        assert_eq!(first_permit.role(), BusRole::Master);

        drop(first_permit);
        let second_permit = assert_ready!(second.poll());
        assert_eq!(second_permit.ticket(), 2);
        assert_eq!(second_permit.role(), BusRole::Slave);
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.granted(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let scheduler = TransactionScheduler::new();
        let held = scheduler.acquire(BusRole::Config).await;

        let mut waiter = task::spawn(scheduler.acquire(BusRole::Master));
        assert_pending!(waiter.poll());
        assert_eq!(scheduler.queued(), 1);

        drop(waiter);
        assert_eq!(scheduler.queued(), 0);
        drop(held);
        assert!(scheduler.try_acquire(BusRole::Master).is_some());
    }
}
