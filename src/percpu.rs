//! C1 — per-CPU, per-domain status and pending-IRQ state.
//!
//! One `PerCpuDomainState` exists for every `(cpu, domain slot)` pair; see
//! spec.md §3. The STALL bit is the virtualized IF flag (invariant 6/7);
//! it lives in the low-order bit of `status` so the hot path
//! (`is_stalled`) is a single atomic load and mask, matching spec.md §9's
//! "known offset... low-order bit of the first word" requirement.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::irqlog::IrqLog;

bitflags! {
    pub struct DomainStatus: u32 {
        /// Virtualized IF: while set, IRQs destined for this (cpu, domain)
        /// accumulate in the pending log instead of running their ISR.
        const STALL = 1 << 0;
        /// Set while `sync_stage` is draining the pending log for this
        /// (cpu, domain), to prevent nested replay (spec.md §4.5).
        const SYNC = 1 << 1;
        /// Set when the stage is running on a borrowed/foreign stack and
        /// must not be migrated mid-handler.
        const NOSTACK = 1 << 2;
    }
}

pub struct PerCpuDomainState {
    status: AtomicU32,
    pending: IrqLog,
    /// Bitmask of events currently being handled by this (cpu, domain),
    /// drained by `catch_event` before it unmaps a handler (spec.md §4.7).
    evsync: AtomicU64,
}

impl PerCpuDomainState {
    pub fn new(nr_irqs: usize, first_virq: usize) -> Self {
        Self {
            status: AtomicU32::new(0),
            pending: IrqLog::new(nr_irqs, first_virq),
            evsync: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> DomainStatus {
        DomainStatus::from_bits_truncate(self.status.load(Ordering::SeqCst))
    }

    pub fn is_stalled(&self) -> bool {
        self.status().contains(DomainStatus::STALL)
    }

    pub fn is_in_sync(&self) -> bool {
        self.status().contains(DomainStatus::SYNC)
    }

    /// Sets STALL, returning the prior value of the bit (spec.md
    /// `test_and_stall`).
    pub fn test_and_set_stall(&self) -> bool {
        let prev = self
            .status
            .fetch_or(DomainStatus::STALL.bits(), Ordering::SeqCst);
        prev & DomainStatus::STALL.bits() != 0
    }

    /// Clears STALL, returning the prior value of the bit (spec.md
    /// `test_and_unstall`).
    pub fn test_and_clear_stall(&self) -> bool {
        let prev = self
            .status
            .fetch_and(!DomainStatus::STALL.bits(), Ordering::SeqCst);
        prev & DomainStatus::STALL.bits() != 0
    }

    pub fn set_stall(&self) {
        self.status
            .fetch_or(DomainStatus::STALL.bits(), Ordering::SeqCst);
    }

    pub fn clear_stall(&self) {
        self.status
            .fetch_and(!DomainStatus::STALL.bits(), Ordering::SeqCst);
    }

    /// Sets `status` to exactly `STALL` or not, preserving other bits
    /// (spec.md `restore(dom, x)`).
    pub fn restore_stall(&self, stalled: bool) {
        if stalled {
            self.set_stall();
        } else {
            self.clear_stall();
        }
    }

    pub fn test_and_set_sync(&self) -> bool {
        let prev = self
            .status
            .fetch_or(DomainStatus::SYNC.bits(), Ordering::SeqCst);
        prev & DomainStatus::SYNC.bits() != 0
    }

    pub fn clear_sync(&self) {
        self.status
            .fetch_and(!DomainStatus::SYNC.bits(), Ordering::SeqCst);
    }

    pub fn set_sync(&self) {
        self.status
            .fetch_or(DomainStatus::SYNC.bits(), Ordering::SeqCst);
    }

    pub fn pending(&self) -> &IrqLog {
        &self.pending
    }

    pub fn set_pending(&self, irq: usize, locked: bool) -> bool {
        self.pending.set_pending(irq, locked)
    }

    pub fn next_pending(&self, dovirt: bool) -> Option<u32> {
        self.pending.next_pending(dovirt)
    }

    pub fn lock_irq(&self, irq: usize) -> bool {
        self.pending.move_to_held(irq)
    }

    pub fn unlock_irq(&self, irq: usize) -> bool {
        self.pending.restore_from_held(irq)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.has_any_pending()
    }

    pub fn irqall(&self, irq: usize) -> u64 {
        self.pending.irqall(irq)
    }

    pub fn mark_event_active(&self, event_bit: u64) {
        self.evsync.fetch_or(event_bit, Ordering::SeqCst);
    }

    pub fn clear_event(&self, event_bit: u64) {
        self.evsync.fetch_and(!event_bit, Ordering::SeqCst);
    }

    pub fn evsync_mask(&self) -> u64 {
        self.evsync.load(Ordering::SeqCst)
    }
}
