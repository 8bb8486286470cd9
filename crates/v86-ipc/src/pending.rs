//! Table of requests awaiting a reply.

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

use crate::Envelope;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PendingError {
    /// The next sequence number's slot still holds a live request.
    #[error("pending slot {seq} is still in use")]
    SlotBusy { seq: u32 },
}

/// What happened to a reply handed to [`PendingTable::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The slot is live but the token differs.
    Stale,
    /// No request is waiting at that sequence number.
    Unknown,
    /// The caller stopped waiting before the reply arrived.
    Abandoned,
}

#[derive(Debug)]
struct Pending {
    ack: u32,
    reply: oneshot::Sender<Envelope>,
}

/// Slots indexed by sequence number.
///
/// Sequence numbers increase by one per registration and wrap at the
/// table's capacity, so the slot of a request is its sequence number. A slot
/// is freed by a matching delivery or by retirement.
#[derive(Debug)]
pub struct PendingTable {
    slots: Vec<Option<Pending>>,
    next_seq: u32,
}

impl PendingTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            next_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_live(&self, seq: u32) -> bool {
        matches!(self.slots.get(seq as usize), Some(Some(_)))
    }

    /// Claims the next slot for a request with token `ack`.
    ///
    /// The sequence number advances even when the slot is busy, so a single
    /// stuck request does not block every later one.
    pub fn register(
        &mut self,
        ack: u32,
        reply: oneshot::Sender<Envelope>,
    ) -> Result<u32, PendingError> {
        let seq = self.next_seq;
        self.next_seq = (seq + 1) % self.slots.len() as u32;
        let slot = &mut self.slots[seq as usize];
        if slot.is_some() {
            return Err(PendingError::SlotBusy { seq });
        }
        *slot = Some(Pending { ack, reply });
        Ok(seq)
    }

    pub fn deliver(&mut self, reply: Envelope) -> Delivery {
        let Some(slot) = self.slots.get_mut(reply.seq as usize) else {
            return Delivery::Unknown;
        };
        if slot.as_ref().is_some_and(|p| p.ack != reply.ack) {
            trace!(seq = reply.seq, ack = reply.ack, "stale reply token");
            return Delivery::Stale;
        }
        let Some(pending) = slot.take() else {
            return Delivery::Unknown;
        };
        match pending.reply.send(reply) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Abandoned,
        }
    }

    /// Frees `seq` if it still belongs to the request with token `ack`.
    pub fn retire(&mut self, seq: u32, ack: u32) -> bool {
        match self.slots.get_mut(seq as usize) {
            Some(slot) if slot.as_ref().is_some_and(|p| p.ack == ack) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
