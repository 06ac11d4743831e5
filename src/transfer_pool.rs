//! Fixed set of asynchronous reads kept in flight while streaming.
//!
//! Each slot owns one buffer. The buffer moves into the transport on
//! submission and comes back inside the [`Completion`]. Every submission is
//! tagged with a sequence number and completions are delivered strictly in
//! that order, whatever order the transport finishes them in.
//!
//! # Teardown
//!
//! [`TransferPool::abort`] cancels every submitted slot exactly once. From
//! then on completions are released as they arrive and nothing is
//! resubmitted. The pool is drained once [`TransferPool::outstanding`] reaches
//! zero.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::transport::{Completion, ReadRequest, SlotId, SubmitError, TransferStatus, Transport, TransportError};

/// Upper bound on the number of simultaneously submitted transfers.
pub const NUM_SIMUL_TRANSFERS: usize = 32;

/// Milliseconds of data a single transfer buffer holds.
const BUFFER_MS: u64 = 10;
/// Milliseconds of data all transfers together should hold.
const POOL_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Unable to allocate a {size} byte transfer buffer")]
    Allocation { size: usize },

    #[error("Failed to submit transfer {slot}: {source}")]
    Submit {
        slot: SlotId,
        #[source]
        source: TransportError,
    },
}

/// Number, size and timeout of the transfers for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub num_transfers: usize,
    pub buffer_size: usize,
    pub timeout: Duration,
}

impl PoolGeometry {
    /// Sizes buffers to hold 10 ms of data each (rounded up to `block_size`)
    /// and enough of them for about 500 ms, with a read timeout covering the
    /// whole pool plus 25 % headroom.
    pub fn for_rate(samplerate: u64, bytes_per_sample: usize, block_size: usize) -> Self {
        let block = block_size.max(1) as u64;
        let bytes_per_ms = (samplerate / 1000 * bytes_per_sample as u64).max(1);

        let buffer_size = (BUFFER_MS * bytes_per_ms).div_ceil(block).max(1) * block;
        let num_transfers = (POOL_MS * bytes_per_ms / buffer_size).clamp(1, NUM_SIMUL_TRANSFERS as u64);
        let total_ms = buffer_size * num_transfers / bytes_per_ms;
        let timeout_ms = (total_ms + total_ms / 4).max(1);

        Self {
            num_transfers: num_transfers as usize,
            buffer_size: buffer_size as usize,
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Submitted,
    CompletedOk,
    CompletedError,
    Cancelled,
}

#[derive(Debug)]
pub struct TransferSlot {
    state: SlotState,
    /// Present while the pool owns the buffer.
    buffer: Option<Vec<u8>>,
    cancel_requested: bool,
}

impl TransferSlot {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            buffer: None,
            cancel_requested: false,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

/// Outcome of handing the next in-sequence completion to the pool.
#[derive(Debug)]
pub enum Delivery {
    /// A transfer carrying data. Hand it back through
    /// [`TransferPool::recycle`] or [`TransferPool::release`].
    Data(Completion),
    /// An empty or failed transfer that was resubmitted.
    Empty,
    /// Too many consecutive empty transfers.
    Stalled,
    DeviceGone,
    /// An empty transfer could not be resubmitted.
    ResubmitFailed(PoolError),
}

#[derive(Debug)]
pub struct TransferPool {
    geometry: PoolGeometry,
    max_empty_transfers: u32,
    slots: Vec<TransferSlot>,
    outstanding: usize,
    next_seq: u64,
    deliver_seq: u64,
    reorder: BTreeMap<u64, Completion>,
    empty_transfers: u32,
    aborting: bool,
}

impl TransferPool {
    pub fn new(geometry: PoolGeometry, max_empty_transfers: u32) -> Self {
        Self {
            geometry,
            max_empty_transfers,
            slots: (0..geometry.num_transfers).map(|_| TransferSlot::new()).collect(),
            outstanding: 0,
            next_seq: 0,
            deliver_seq: 0,
            reorder: BTreeMap::new(),
            empty_transfers: 0,
            aborting: false,
        }
    }

    pub fn geometry(&self) -> PoolGeometry {
        self.geometry
    }

    pub fn slots(&self) -> &[TransferSlot] {
        &self.slots
    }

    /// Number of reads currently owned by the transport.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    pub fn is_drained(&self) -> bool {
        self.aborting && self.outstanding == 0
    }

    pub fn empty_transfers(&self) -> u32 {
        self.empty_transfers
    }

    /// Allocates and submits every slot. On failure the slots submitted so
    /// far are cancelled and the pool is left aborting.
    pub fn submit_all<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<(), PoolError> {
        tracing::info!(
            num_transfers = self.geometry.num_transfers,
            buffer_size = self.geometry.buffer_size,
            timeout_ms = self.geometry.timeout.as_millis() as u64,
            "Submitting transfers"
        );

        for slot in 0..self.slots.len() {
            let buffer = match self.slots[slot].buffer.take() {
                Some(buffer) => buffer,
                None => match self.allocate() {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        log::error!("{e}");
                        self.abort(transport);
                        return Err(e);
                    }
                },
            };
            if let Err(e) = self.submit_slot(slot, buffer, transport) {
                log::error!("{e}");
                self.abort(transport);
                return Err(e);
            }
        }
        Ok(())
    }

    fn allocate(&self) -> Result<Vec<u8>, PoolError> {
        let size = self.geometry.buffer_size;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size)
            .map_err(|_| PoolError::Allocation { size })?;
        buffer.resize(size, 0);
        Ok(buffer)
    }

    fn submit_slot<T: Transport + ?Sized>(
        &mut self,
        slot: SlotId,
        mut buffer: Vec<u8>,
        transport: &mut T,
    ) -> Result<(), PoolError> {
        buffer.resize(self.geometry.buffer_size, 0);
        let request = ReadRequest {
            slot,
            seq: self.next_seq,
            buffer,
            timeout: self.geometry.timeout,
        };
        match transport.submit(request) {
            Ok(()) => {
                self.next_seq += 1;
                self.outstanding += 1;
                let entry = &mut self.slots[slot];
                entry.state = SlotState::Submitted;
                entry.cancel_requested = false;
                Ok(())
            }
            Err(SubmitError { request, source }) => {
                let entry = &mut self.slots[slot];
                entry.buffer = Some(request.buffer);
                entry.state = SlotState::Free;
                Err(PoolError::Submit { slot, source })
            }
        }
    }

    /// Takes back a completion from the transport. While aborting it is
    /// released on the spot; otherwise it waits for its turn in sequence.
    pub fn enqueue(&mut self, completion: Completion) {
        let Some(entry) = self.slots.get_mut(completion.slot) else {
            log::warn!("Dropping completion for unknown slot {}", completion.slot);
            return;
        };
        if entry.state != SlotState::Submitted {
            log::warn!(
                "Dropping duplicate completion for slot {} ({:?})",
                completion.slot,
                entry.state
            );
            return;
        }
        entry.state = match completion.status {
            TransferStatus::Completed | TransferStatus::TimedOut => SlotState::CompletedOk,
            TransferStatus::Cancelled => SlotState::Cancelled,
            TransferStatus::NoDevice | TransferStatus::Error => SlotState::CompletedError,
        };
        self.outstanding = self.outstanding.saturating_sub(1);

        if self.aborting {
            self.release(completion);
        } else {
            self.reorder.insert(completion.seq, completion);
        }
    }

    /// Delivers the next completion in sequence, if it has arrived.
    pub fn next_delivery<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Option<Delivery> {
        if self.aborting {
            return None;
        }
        let completion = self.reorder.remove(&self.deliver_seq)?;
        self.deliver_seq += 1;

        let status = completion.status;
        if status == TransferStatus::NoDevice {
            log::warn!("Device disappeared while streaming");
            self.release(completion);
            return Some(Delivery::DeviceGone);
        }

        let has_data = matches!(status, TransferStatus::Completed | TransferStatus::TimedOut)
            && completion.actual_length() > 0;
        if has_data {
            self.empty_transfers = 0;
            return Some(Delivery::Data(completion));
        }

        self.empty_transfers += 1;
        if status != TransferStatus::Completed && status != TransferStatus::TimedOut {
            log::debug!("Transfer on slot {} ended with {status:?}", completion.slot);
        }
        if self.empty_transfers > self.max_empty_transfers {
            log::warn!(
                "{} consecutive empty transfers, giving up",
                self.empty_transfers
            );
            self.release(completion);
            return Some(Delivery::Stalled);
        }
        match self.recycle(completion, transport) {
            Ok(()) => Some(Delivery::Empty),
            Err(e) => Some(Delivery::ResubmitFailed(e)),
        }
    }

    /// Resubmits the slot of a delivered completion. While aborting the
    /// completion is released instead. A failed resubmission releases the
    /// slot.
    pub fn recycle<T: Transport + ?Sized>(
        &mut self,
        completion: Completion,
        transport: &mut T,
    ) -> Result<(), PoolError> {
        if self.aborting {
            self.release(completion);
            return Ok(());
        }
        let slot = completion.slot;
        self.submit_slot(slot, completion.into_buffer(), transport)
    }

    /// Returns the buffer of a completion to its slot without resubmitting.
    pub fn release(&mut self, completion: Completion) {
        let slot = completion.slot;
        if let Some(entry) = self.slots.get_mut(slot) {
            if entry.state != SlotState::Cancelled {
                entry.state = SlotState::Free;
            }
            entry.buffer = Some(completion.into_buffer());
        }
    }

    /// Cancels every submitted slot. Safe to call repeatedly; each slot is
    /// cancelled at most once.
    pub fn abort<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if !self.aborting {
            tracing::info!(outstanding = self.outstanding, "Aborting transfers");
            self.aborting = true;
        }

        let undelivered = std::mem::take(&mut self.reorder);
        for completion in undelivered.into_values() {
            self.release(completion);
        }

        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.state == SlotState::Submitted && !entry.cancel_requested {
                entry.cancel_requested = true;
                transport.cancel(slot);
            }
        }
    }

    /// Gives up on reads the transport can no longer complete. Their buffers
    /// stay with the transport.
    pub fn abandon_in_flight(&mut self) {
        if self.outstanding > 0 {
            log::warn!("Abandoning {} in-flight transfers", self.outstanding);
        }
        self.aborting = true;
        for entry in &mut self.slots {
            if entry.state == SlotState::Submitted {
                entry.state = SlotState::Cancelled;
            }
        }
        self.outstanding = 0;
    }
}
