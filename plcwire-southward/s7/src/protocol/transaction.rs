//! Transaction admission: a FIFO gate sized to the negotiated AMQ plus the
//! PDU reference allocator. Both live behind one lock so that a ticket's
//! slot and its identifier are always granted and released together.
use plcwire_sdk::{DriverError, DriverResult};
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// First identifier handed out on a fresh connection.
const FIRST_PDU_REF: u16 = 10;

#[derive(Debug)]
struct GateInner {
    /// Current semaphore; replaced wholesale when capacity changes
    semaphore: Arc<Semaphore>,
    capacity: usize,
    next_ref: u16,
    /// Identifiers held by live tickets
    outstanding: HashSet<u16>,
    /// Admissions parked until the next capacity is installed
    suspended: bool,
    closed: bool,
}

impl GateInner {
    /// Next identifier in 1..=0xFFFF that is not currently outstanding.
    fn allocate_ref(&mut self) -> u16 {
        loop {
            let id = self.next_ref;
            self.next_ref = if id == u16::MAX { 1 } else { id + 1 };
            if self.outstanding.insert(id) {
                return id;
            }
        }
    }
}

/// Bounds concurrently outstanding transactions.
///
/// Waiters queue in arrival order on a tokio [`Semaphore`]. A capacity change
/// installs a fresh semaphore and closes the previous one, so tickets already
/// granted finish under the old limit while queued callers re-enter against
/// the new one. While suspended the installed semaphore has no permits, so
/// callers queue until [`AdmissionGate::set_capacity`] opens it again.
#[derive(Clone)]
pub struct AdmissionGate {
    inner: Arc<Mutex<GateInner>>,
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = self.lock();
        f.debug_struct("AdmissionGate")
            .field("capacity", &g.capacity)
            .field("outstanding", &g.outstanding.len())
            .field("suspended", &g.suspended)
            .field("closed", &g.closed)
            .finish()
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(1)
    }
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                next_ref: FIRST_PDU_REF,
                outstanding: HashSet::new(),
                suspended: false,
                closed: false,
            })),
        }
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a free slot, then allocate a PDU reference for it.
    pub async fn acquire(&self) -> DriverResult<Ticket> {
        loop {
            let semaphore = {
                let g = self.lock();
                if g.closed {
                    return Err(DriverError::NotConnected);
                }
                Arc::clone(&g.semaphore)
            };
            let permit = Arc::clone(&semaphore).acquire_owned().await;
            let mut g = self.lock();
            if g.closed {
                return Err(DriverError::NotConnected);
            }
            match permit {
                Ok(permit) if Arc::ptr_eq(&g.semaphore, &semaphore) => {
                    let pdu_ref = g.allocate_ref();
                    tracing::trace!(pdu_ref, outstanding = g.outstanding.len(), "slot granted");
                    return Ok(Ticket {
                        pdu_ref,
                        gate: Arc::clone(&self.inner),
                        permit: Some(permit),
                    });
                }
                // Capacity changed while we were queued; retry on the new semaphore.
                _ => continue,
            }
        }
    }

    /// Allocate a PDU reference without taking a slot.
    ///
    /// For handshake exchanges, which run one at a time while admissions are
    /// suspended.
    pub fn unmetered(&self) -> DriverResult<Ticket> {
        let mut g = self.lock();
        if g.closed {
            return Err(DriverError::NotConnected);
        }
        let pdu_ref = g.allocate_ref();
        Ok(Ticket {
            pdu_ref,
            gate: Arc::clone(&self.inner),
            permit: None,
        })
    }

    /// Park queued and future callers until the next [`set_capacity`](Self::set_capacity).
    /// Tickets already granted stay valid.
    pub fn suspend(&self) {
        let mut g = self.lock();
        if g.closed || g.suspended {
            return;
        }
        tracing::debug!(capacity = g.capacity, "admissions suspended");
        let previous = std::mem::replace(&mut g.semaphore, Arc::new(Semaphore::new(0)));
        g.suspended = true;
        previous.close();
    }

    /// Replace the capacity and lift a suspension. Only callers queued or
    /// arriving afterwards see it.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut g = self.lock();
        if g.closed || (!g.suspended && g.capacity == capacity) {
            return;
        }
        tracing::debug!(from = g.capacity, to = capacity, "admission capacity changed");
        let previous = std::mem::replace(&mut g.semaphore, Arc::new(Semaphore::new(capacity)));
        g.capacity = capacity;
        g.suspended = false;
        previous.close();
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Number of tickets currently alive.
    #[inline]
    pub fn outstanding(&self) -> usize {
        self.lock().outstanding.len()
    }

    /// Reject every queued and future acquire. Live tickets stay valid until dropped.
    pub fn close(&self) {
        let mut g = self.lock();
        g.closed = true;
        g.semaphore.close();
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// One admitted transaction: its slot plus its PDU reference.
///
/// Dropping the ticket returns both; the identifier is released first so it
/// can never be observed as reusable while the slot is still counted.
/// Handshake tickets carry no slot.
pub struct Ticket {
    pdu_ref: u16,
    gate: Arc<Mutex<GateInner>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Ticket {
    #[inline]
    pub fn pdu_ref(&self) -> u16 {
        self.pdu_ref
    }

    /// Whether this ticket occupies an admission slot.
    #[inline]
    pub fn is_metered(&self) -> bool {
        self.permit.is_some()
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("pdu_ref", &self.pdu_ref)
            .field("metered", &self.is_metered())
            .finish()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut g = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        g.outstanding.remove(&self.pdu_ref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::{
        sync::mpsc,
        time::{sleep, timeout},
    };

    #[tokio::test(start_paused = true)]
    async fn queued_callers_are_admitted_in_arrival_order() {
        let gate = AdmissionGate::new(1);
        let first = gate.acquire().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for name in ["a", "b", "c"] {
            let gate = gate.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let ticket = gate.acquire().await.unwrap();
                tx.send(name).unwrap();
                sleep(Duration::from_millis(5)).await;
                drop(ticket);
            });
            sleep(Duration::from_millis(1)).await;
        }
        assert!(rx.try_recv().is_err());

        drop(first);
        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, Some("b"));
        assert_eq!(rx.recv().await, Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn outstanding_never_exceeds_capacity() {
        let gate = AdmissionGate::new(2);
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for i in 0..12u64 {
            let gate = gate.clone();
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let ticket = gate.acquire().await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(gate.outstanding() <= 2);
                sleep(Duration::from_millis(3 + i % 4)).await;
                live.fetch_sub(1, Ordering::SeqCst);
                drop(ticket);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(gate.outstanding(), 0);
    }

    #[tokio::test]
    async fn identifiers_wrap_and_skip_zero() {
        let gate = AdmissionGate::new(4);
        gate.lock().next_ref = u16::MAX - 1;
        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        let c = gate.acquire().await.unwrap();
        assert_eq!(
            [a.pdu_ref(), b.pdu_ref(), c.pdu_ref()],
            [u16::MAX - 1, u16::MAX, 1]
        );
    }

    #[tokio::test]
    async fn outstanding_identifiers_are_not_reissued() {
        let gate = AdmissionGate::new(4);
        let held = gate.acquire().await.unwrap();
        assert_eq!(held.pdu_ref(), FIRST_PDU_REF);
        gate.lock().next_ref = FIRST_PDU_REF;
        let next = gate.acquire().await.unwrap();
        assert_eq!(next.pdu_ref(), FIRST_PDU_REF + 1);

        drop(held);
        gate.lock().next_ref = FIRST_PDU_REF;
        assert_eq!(gate.acquire().await.unwrap().pdu_ref(), FIRST_PDU_REF);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_change_only_affects_new_admissions() {
        let gate = AdmissionGate::new(1);
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|t| t.pdu_ref()) })
        };
        sleep(Duration::from_millis(1)).await;
        assert!(!waiter.is_finished());

        gate.set_capacity(3);
        let id = waiter.await.unwrap().unwrap();
        assert_ne!(id, held.pdu_ref());
        assert_eq!(gate.capacity(), 3);
        // The ticket granted under the old capacity is still live.
        assert_eq!(gate.outstanding(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_gate_parks_callers_until_capacity_is_set() {
        let gate = AdmissionGate::new(1);
        let stale = gate.acquire().await.unwrap();
        let queued = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|t| t.pdu_ref()) })
        };
        sleep(Duration::from_millis(1)).await;

        gate.suspend();
        assert!(gate.is_suspended());
        // Releasing the stale slot does not let the queued caller through.
        drop(stale);
        sleep(Duration::from_millis(5)).await;
        assert!(!queued.is_finished());

        // Handshake traffic still gets identifiers, and they are unique.
        let hs = gate.unmetered().unwrap();
        assert!(!hs.is_metered());
        assert_eq!(gate.outstanding(), 1);

        // Same capacity as before; installing it still lifts the suspension.
        gate.set_capacity(1);
        assert!(!gate.is_suspended());
        let id = queued.await.unwrap().unwrap();
        assert_ne!(id, hs.pdu_ref());
    }

    #[tokio::test(start_paused = true)]
    async fn tickets_held_across_a_suspension_do_not_block_the_new_capacity() {
        let gate = AdmissionGate::new(1);
        let stranded = gate.acquire().await.unwrap();
        gate.suspend();
        gate.set_capacity(1);
        let fresh = timeout(Duration::from_millis(10), gate.acquire())
            .await
            .expect("new capacity is free")
            .unwrap();
        assert!(fresh.is_metered());
        assert_ne!(fresh.pdu_ref(), stranded.pdu_ref());
    }

    #[tokio::test]
    async fn closed_gate_refuses_unmetered_tickets() {
        let gate = AdmissionGate::new(1);
        gate.close();
        assert!(matches!(gate.unmetered(), Err(DriverError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_queued_and_future_callers() {
        let gate = AdmissionGate::new(1);
        let _held = gate.acquire().await.unwrap();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        sleep(Duration::from_millis(1)).await;
        gate.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DriverError::NotConnected)
        ));
        assert!(gate.acquire().await.is_err());
    }
}
