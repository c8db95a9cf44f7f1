use std::sync::atomic::{AtomicU8, Ordering};

use aperture_device::RequestId;

/// Lifecycle state of one request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Slot has no buffers attached.
    Idle,
    /// Buffers attached, not yet queued to the driver.
    Filled,
    /// Queued; the driver owns the buffers.
    Submitted,
    /// Driver finished; waiting for the consumer loop.
    Completed,
    /// Frame handed to the sink; buffers about to be recycled.
    Delivered,
    /// Cancelled during teardown; buffers released without delivery.
    Cancelled,
}

impl RequestState {
    fn encode(self) -> u8 {
        match self {
            RequestState::Idle => 0,
            RequestState::Filled => 1,
            RequestState::Submitted => 2,
            RequestState::Completed => 3,
            RequestState::Delivered => 4,
            RequestState::Cancelled => 5,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw {
            0 => RequestState::Idle,
            1 => RequestState::Filled,
            2 => RequestState::Submitted,
            3 => RequestState::Completed,
            4 => RequestState::Delivered,
            _ => RequestState::Cancelled,
        }
    }

    fn allows(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Idle, Filled)
                | (Filled, Submitted)
                | (Submitted, Completed)
                | (Submitted, Cancelled)
                | (Completed, Delivered)
                | (Delivered, Idle)
                | (Cancelled, Idle)
        )
    }
}

/// Attempted transition that the ledger refused.
#[derive(Debug, thiserror::Error)]
#[error("{id} cannot move {from:?} -> {to:?} (slot is {found:?})")]
pub struct LedgerError {
    pub id: RequestId,
    pub from: RequestState,
    pub to: RequestState,
    pub found: RequestState,
}

/// Per-slot request state machine shared between the consumer loop and the
/// driver's completion context.
///
/// Every transition is a compare-exchange on one `AtomicU8`, so the
/// `Submitted -> Completed` step is safe to take from a driver callback
/// without locks or allocation. Out-of-order transitions are rejected rather
/// than patched over: a refused transition means buffers would have been
/// double-released or leaked.
///
/// # Example
/// ```rust
/// use aperture::ledger::{RequestLedger, RequestState};
/// use aperture_device::RequestId;
///
/// let ledger = RequestLedger::new(2);
/// let id = RequestId(0);
/// ledger.transition(id, RequestState::Idle, RequestState::Filled).unwrap();
/// assert_eq!(ledger.state(id), RequestState::Filled);
/// assert!(ledger
///     .transition(id, RequestState::Completed, RequestState::Delivered)
///     .is_err());
/// ```
pub struct RequestLedger {
    slots: Vec<AtomicU8>,
}

impl RequestLedger {
    /// Create a ledger with `count` slots, all `Idle`.
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the ledger has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current state of a slot.
    pub fn state(&self, id: RequestId) -> RequestState {
        RequestState::decode(self.slots[id.0].load(Ordering::Acquire))
    }

    /// Atomically move a slot from `from` to `to`.
    pub fn transition(
        &self,
        id: RequestId,
        from: RequestState,
        to: RequestState,
    ) -> Result<(), LedgerError> {
        if !from.allows(to) {
            return Err(LedgerError {
                id,
                from,
                to,
                found: self.state(id),
            });
        }
        self.slots[id.0]
            .compare_exchange(
                from.encode(),
                to.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|found| LedgerError {
                id,
                from,
                to,
                found: RequestState::decode(found),
            })
    }

    /// Slots the consumer has not yet settled: submitted to the driver, or
    /// completed but not yet drained from the done lane.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                matches!(
                    RequestState::decode(slot.load(Ordering::Acquire)),
                    RequestState::Submitted | RequestState::Completed
                )
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_round_trips() {
        let ledger = RequestLedger::new(1);
        let id = RequestId(0);
        for (from, to) in [
            (RequestState::Idle, RequestState::Filled),
            (RequestState::Filled, RequestState::Submitted),
            (RequestState::Submitted, RequestState::Completed),
            (RequestState::Completed, RequestState::Delivered),
            (RequestState::Delivered, RequestState::Idle),
        ] {
            ledger.transition(id, from, to).unwrap();
        }
        assert_eq!(ledger.state(id), RequestState::Idle);
    }

    #[test]
    fn refuses_skipping_states() {
        let ledger = RequestLedger::new(1);
        let id = RequestId(0);
        let err = ledger
            .transition(id, RequestState::Idle, RequestState::Submitted)
            .unwrap_err();
        assert_eq!(err.found, RequestState::Idle);
        // A stale claimed state loses the race against the real one.
        ledger
            .transition(id, RequestState::Idle, RequestState::Filled)
            .unwrap();
        assert!(
            ledger
                .transition(id, RequestState::Idle, RequestState::Filled)
                .is_err()
        );
    }

    #[test]
    fn cancellation_branch() {
        let ledger = RequestLedger::new(1);
        let id = RequestId(0);
        ledger
            .transition(id, RequestState::Idle, RequestState::Filled)
            .unwrap();
        ledger
            .transition(id, RequestState::Filled, RequestState::Submitted)
            .unwrap();
        assert_eq!(ledger.in_flight(), 1);
        ledger
            .transition(id, RequestState::Submitted, RequestState::Cancelled)
            .unwrap();
        assert_eq!(ledger.in_flight(), 0);
        ledger
            .transition(id, RequestState::Cancelled, RequestState::Idle)
            .unwrap();
    }
}
