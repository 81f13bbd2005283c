//! C6 — Dispatcher: `handle_irq`, `dispatch_wired`, `walk_pipeline`,
//! `sync_stage`, `suspend_domain`, `dispatch_event`, `catch_event`,
//! `trigger_irq`, `lock_irq`, `unlock_irq`, `virtualize_irq` (spec.md §4.1,
//! §4.3, §4.5, §4.7).
//!
//! Everything here runs against a snapshot of the priority order
//! (`Pipeline::order_snapshot`), never the live list, so a concurrent
//! `register_domain`/`unregister_domain` can't invalidate a walk in
//! progress (spec.md §4.7 "safe to mutation").

use alloc::sync::Arc;

use pipeline_error::PipelineError;

use crate::domain::{AckFn, DomainAttr, DomainFlags, EventHandlerFn, HandlerSpec, IrqControl, ROOT_SLOT};
use crate::critical::CriticalSection;
use crate::hal::IrqNumber;
use crate::pipeline::{critical_ipi_irq, Pipeline};

pub struct Dispatcher<const N: usize> {
    pub pipeline: Arc<Pipeline<N>>,
    pub critical: CriticalSection<N>,
}

impl<const N: usize> Dispatcher<N> {
    pub fn new(pipeline: Arc<Pipeline<N>>) -> Self {
        let critical = CriticalSection::new(pipeline.clone());
        Self { pipeline, critical }
    }

    fn topmost_slot(&self) -> usize {
        *self
            .pipeline
            .order_snapshot()
            .first()
            .unwrap_or(&ROOT_SLOT)
    }

    fn start_slot(&self, cpu: usize, irq: usize) -> usize {
        let current = self.pipeline.current_slot(cpu);
        let sticky = self
            .pipeline
            .domain(current)
            .map(|d| d.irq(irq).control().contains(IrqControl::STICKY))
            .unwrap_or(false);
        if sticky {
            current
        } else {
            self.topmost_slot()
        }
    }

    fn root_should_continue(&self, cpu: usize) -> bool {
        let current = self.pipeline.current_slot(cpu);
        self.pipeline
            .domain(current)
            .map(|d| d.is_root())
            .unwrap_or(false)
            && !self.pipeline.percpu(cpu, current).is_stalled()
    }

    /// Walks forward from `start` marking `irq` pending on every `HANDLE`
    /// domain, acking exactly once, stopping at the first domain that does
    /// not `PASS` (spec.md §4.5 step 4). Shared by `handle_irq` and
    /// `trigger_irq` (SPEC_FULL.md §C.2).
    fn propagate(&self, cpu: usize, start: usize, irq: usize, already_acked: bool) -> bool {
        let order = self.pipeline.order_snapshot();
        let start_pos = order.iter().position(|&s| s == start).unwrap_or(0);
        let mut acked = already_acked;
        for &slot in &order[start_pos..] {
            let dom = match self.pipeline.domain(slot) {
                Some(d) => d,
                None => continue,
            };
            let control = dom.irq(irq).control();
            if control.contains(IrqControl::HANDLE) {
                let locked = dom.irq(irq).is_locked();
                self.pipeline.percpu(cpu, slot).set_pending(irq, locked);
                if !acked {
                    if let Some(ack_fn) = dom.irq(irq).ack() {
                        ack_fn(IrqNumber::from(irq as u32));
                    }
                    acked = true;
                }
            }
            if !control.contains(IrqControl::PASS) {
                break;
            }
        }
        acked
    }

    /// Entered with hw IF off, after the arch stub has decoded a vector into
    /// `irq` (and possibly already acked it). Returns whether the root stub
    /// should continue its own native IRQ path.
    pub fn handle_irq(&self, cpu: usize, irq: usize, already_acked: bool) -> bool {
        #[cfg(feature = "debug-context-checks")]
        debug_assert_eq!(
            cpu,
            self.pipeline.hal.processor_id().data(),
            "handle_irq called with a cpu id that does not match the running processor"
        );
        if irq == critical_ipi_irq(self.pipeline.nr_irqs) {
            self.critical.do_critical_sync(cpu);
            return false;
        }

        let start = self.start_slot(cpu, irq);
        let wired = self
            .pipeline
            .domain(start)
            .map(|d| d.irq(irq).control().contains(IrqControl::WIRED))
            .unwrap_or(false);
        if wired {
            self.dispatch_wired(cpu, start, irq);
            return self.root_should_continue(cpu);
        }

        self.propagate(cpu, start, irq, already_acked);

        let current = self.pipeline.current_slot(cpu);
        let current_is_ahead = self
            .pipeline
            .domain(current)
            .map(|d| d.flags().contains(DomainFlags::AHEAD))
            .unwrap_or(false);
        let head_has_nothing_pending = match self.pipeline.head() {
            Some(h) => !self.pipeline.percpu(cpu, h.slot).has_pending(),
            None => true,
        };
        if !(current_is_ahead && head_has_nothing_pending) {
            self.walk_pipeline(cpu, start);
        }

        self.root_should_continue(cpu)
    }

    /// Software self-injection (spec.md §8 law, SPEC_FULL.md §C.2): shares
    /// `propagate` with `handle_irq`, skipping ack since nothing hardware
    /// acked this vector.
    pub fn trigger_irq(&self, cpu: usize, irq: usize) -> bool {
        let start = self.pipeline.current_slot(cpu);
        self.propagate(cpu, start, irq, true);
        self.walk_pipeline(cpu, start);
        self.root_should_continue(cpu)
    }

    /// Entered with hw IF already off, same as `handle_irq`.
    fn dispatch_wired(&self, cpu: usize, head_slot: usize, irq: usize) {
        let dom = match self.pipeline.domain(head_slot) {
            Some(d) => d,
            None => return,
        };
        if dom.irq(irq).is_locked() {
            self.pipeline.percpu(cpu, head_slot).set_pending(irq, true);
            return;
        }
        if self.pipeline.percpu(cpu, head_slot).is_stalled() {
            self.pipeline.percpu(cpu, head_slot).set_pending(irq, false);
            return;
        }
        self.dispatch_wired_nocheck(cpu, head_slot, irq);
    }

    fn dispatch_wired_nocheck(&self, cpu: usize, head_slot: usize, irq: usize) {
        let dom = match self.pipeline.domain(head_slot) {
            Some(d) => d,
            None => return,
        };
        let prev_slot = self.pipeline.set_current_slot(cpu, head_slot);
        self.pipeline.percpu(cpu, head_slot).set_stall();
        if let Some(handler) = dom.irq(irq).handler() {
            handler(IrqNumber::from(irq as u32), dom.irq(irq).cookie());
        }
        self.pipeline.percpu(cpu, head_slot).clear_stall();
        self.pipeline.set_current_slot(cpu, prev_slot);
        if self.pipeline.percpu(cpu, head_slot).has_pending() {
            if prev_slot == head_slot {
                self.sync_stage(cpu, head_slot, false);
            } else {
                self.walk_pipeline(cpu, head_slot);
            }
        }
    }

    /// Iterates `start` and its successors; breaks at the first stalled one,
    /// synchronizes or temporarily adopts each pending one in turn (spec.md
    /// §4.5: "iterate from start to end of list").
    pub fn walk_pipeline(&self, cpu: usize, start: usize) {
        let order = self.pipeline.order_snapshot();
        let start_pos = match order.iter().position(|&s| s == start) {
            Some(p) => p,
            None => return,
        };
        for &slot in &order[start_pos..] {
            if self.pipeline.percpu(cpu, slot).is_stalled() {
                break;
            }
            if !self.pipeline.percpu(cpu, slot).has_pending() {
                continue;
            }
            let original_current = self.pipeline.current_slot(cpu);
            if slot == original_current {
                self.sync_stage(cpu, slot, false);
                continue;
            }
            self.pipeline.set_current_slot(cpu, slot);
            self.suspend_domain(cpu, slot);
            if self.pipeline.current_slot(cpu) == slot {
                // Not preempted by a migration onto some other stage.
                self.pipeline.set_current_slot(cpu, original_current);
            }
            if self.pipeline.percpu(cpu, original_current).has_pending()
                && !self.pipeline.percpu(cpu, original_current).is_stalled()
            {
                self.sync_stage(cpu, original_current, false);
            }
        }
    }

    /// Deferred-interrupt replay ("optimistic interrupt protection", spec.md
    /// §4.5). `dovirt` restricts the drain to the virtual-IRQ range.
    pub fn sync_stage(&self, cpu: usize, slot: usize, dovirt: bool) {
        let percpu = self.pipeline.percpu(cpu, slot);
        let was_sync = percpu.test_and_set_sync();
        if was_sync && slot != ROOT_SLOT {
            return;
        }
        let is_head = self
            .pipeline
            .domain(slot)
            .map(|d| d.is_head())
            .unwrap_or(false);

        loop {
            let irq = match percpu.next_pending(dovirt) {
                Some(i) => i as usize,
                None => break,
            };
            let dom = match self.pipeline.domain(slot) {
                Some(d) => d,
                None => break,
            };
            if dom.irq(irq).is_locked() {
                // Raced with a LOCK between queueing and draining: redirect
                // to held instead of invoking the handler.
                percpu.lock_irq(irq);
                continue;
            }
            percpu.set_stall();
            if !is_head {
                unsafe { self.pipeline.hal.local_irq_enable_hw() };
            }
            if let Some(handler) = dom.irq(irq).handler() {
                handler(IrqNumber::from(irq as u32), dom.irq(irq).cookie());
            }
            if !is_head {
                unsafe { self.pipeline.hal.local_irq_disable_hw() };
            }
            percpu.clear_stall();

            if self.pipeline.hal.processor_id().data() != cpu {
                // Migrated mid-handler: leave SYNC set for the scheduler to
                // clear on context switch (spec.md §9 Open Question).
                percpu.set_sync();
                return;
            }
        }
        percpu.clear_sync();
    }

    /// Yields the current stage: if it has pending work, drain it in place;
    /// else hand the CPU to the next stage down the pipeline with pending
    /// work (spec.md §4.5).
    fn suspend_domain(&self, cpu: usize, slot: usize) {
        let percpu = self.pipeline.percpu(cpu, slot);
        percpu.clear_stall();
        percpu.clear_sync();
        if percpu.has_pending() {
            self.sync_stage(cpu, slot, false);
            return;
        }
        let order = self.pipeline.order_snapshot();
        let pos = match order.iter().position(|&s| s == slot) {
            Some(p) => p,
            None => return,
        };
        for &next_slot in &order[pos + 1..] {
            if self.pipeline.percpu(cpu, next_slot).has_pending() {
                self.pipeline.set_current_slot(cpu, next_slot);
                self.sync_stage(cpu, next_slot, false);
                break;
            }
        }
    }

    /// Walks the pipeline invoking every domain's handler for `event` in
    /// priority order until one returns `true` (spec.md §4.7).
    pub fn dispatch_event(&self, cpu: usize, event: usize, data: usize) -> bool {
        let order = self.pipeline.order_snapshot();
        let event_bit = 1u64 << event;
        for &slot in &order {
            let dom = match self.pipeline.domain(slot) {
                Some(d) => d,
                None => continue,
            };
            let handler = match dom.event_handler(event) {
                Some(h) => h,
                None => continue,
            };
            let prev = self.pipeline.set_current_slot(cpu, slot);
            self.pipeline.percpu(cpu, slot).mark_event_active(event_bit);
            unsafe { self.pipeline.hal.local_irq_enable_hw() };
            let handled = handler(event as u32, data);
            unsafe { self.pipeline.hal.local_irq_disable_hw() };
            self.pipeline.percpu(cpu, slot).clear_event(event_bit);
            if self.pipeline.current_slot(cpu) == slot {
                self.pipeline.set_current_slot(cpu, prev);
            }

            let cur = self.pipeline.current_slot(cpu);
            let cur_is_root = self.pipeline.domain(cur).map(|d| d.is_root()).unwrap_or(false);
            if !cur_is_root
                && !self.pipeline.percpu(cpu, cur).is_stalled()
                && self.pipeline.percpu(cpu, cur).has_pending()
            {
                self.sync_stage(cpu, cur, false);
            }

            if handled {
                return true;
            }
        }
        false
    }

    /// Swaps `slot`'s handler for `event`. Unmapping (`handler = None`)
    /// blocks until every CPU's `evsync` bit for this event has cleared, so
    /// the caller can safely free the handler's code afterward.
    pub fn catch_event(
        &self,
        slot: usize,
        event: usize,
        handler: Option<EventHandlerFn>,
    ) -> Option<EventHandlerFn> {
        let dom = match self.pipeline.domain(slot) {
            Some(d) => d,
            None => return None,
        };
        let prev = dom.catch_event(event, handler);
        if handler.is_none() {
            let bit = 1u64 << event;
            for cpu in 0..self.pipeline.num_cpus() {
                while self.pipeline.percpu(cpu, slot).evsync_mask() & bit != 0 {
                    core::hint::spin_loop();
                }
            }
        }
        prev
    }

    /// Invokes `attr.entry` (if any) with `current_domain` switched to the
    /// new slot, then resyncs ROOT in case the entry left anything pending
    /// behind it (spec.md §4.2).
    /// Installs a handler/ack/cookie and control mode on `target_slot`'s
    /// descriptor for `irq`, enforcing the two cross-domain rules
    /// `IrqDescriptor::configure` has no way to see on its own (spec.md
    /// §4.3): enabling is domain-scoped, and a hardware vector's ack is
    /// inherited from ROOT's descriptor when the caller supplies none.
    pub fn virtualize_irq(
        &self,
        caller_slot: usize,
        target_slot: usize,
        irq: usize,
        handler: HandlerSpec,
        cookie: usize,
        mut ack: Option<AckFn>,
        mode: IrqControl,
    ) -> Result<(), PipelineError> {
        if mode.contains(IrqControl::ENABLE) && caller_slot != target_slot {
            return Err(PipelineError::NotPermitted);
        }
        let dom = self
            .pipeline
            .domain(target_slot)
            .ok_or(PipelineError::NotFound)?;
        if ack.is_none() && irq < self.pipeline.first_virq {
            ack = self.pipeline.root().irq(irq).ack();
        }
        let is_head_domain = dom.is_head();
        dom.irq(irq).configure(handler, cookie, ack, mode, is_head_domain)
    }

    /// Atomically sets the domain's LOCK control bit for `irq`, then moves
    /// any already-pending occurrence of it on every online CPU from
    /// `lomap` into `irqheld_map` (spec.md §4.1 `lock(cpu,dom,irq)`).
    pub fn lock_irq(&self, slot: usize, irq: usize) -> Result<(), PipelineError> {
        let dom = self.pipeline.domain(slot).ok_or(PipelineError::NotFound)?;
        dom.irq(irq).set_lock_bit();
        for cpu in 0..self.pipeline.num_cpus() {
            self.pipeline.percpu(cpu, slot).lock_irq(irq);
        }
        Ok(())
    }

    /// Clears the domain's LOCK control bit for `irq`, then restores any
    /// held occurrence of it on every online CPU back into `lomap` and its
    /// summary levels (spec.md §4.1 `unlock(dom,irq)`).
    pub fn unlock_irq(&self, slot: usize, irq: usize) -> Result<(), PipelineError> {
        let dom = self.pipeline.domain(slot).ok_or(PipelineError::NotFound)?;
        dom.irq(irq).clear_lock_bit();
        for cpu in 0..self.pipeline.num_cpus() {
            self.pipeline.percpu(cpu, slot).unlock_irq(irq);
        }
        Ok(())
    }

    pub fn register_domain(&self, cpu: usize, attr: DomainAttr) -> Result<usize, PipelineError> {
        let entry = attr.entry;
        let slot = self.pipeline.register_domain(cpu, attr)?;
        if let Some(entry_fn) = entry {
            if let Some(dom) = self.pipeline.domain(slot) {
                let prev = self.pipeline.set_current_slot(cpu, slot);
                entry_fn(&dom);
                self.pipeline.set_current_slot(cpu, prev);
            }
        }
        if self.pipeline.percpu(cpu, ROOT_SLOT).has_pending()
            && !self.pipeline.percpu(cpu, ROOT_SLOT).is_stalled()
        {
            self.sync_stage(cpu, ROOT_SLOT, false);
        }
        Ok(slot)
    }

    /// Forces the domain PASS-only, busy-drains its pending log on every
    /// CPU, then performs the structural removal (spec.md §5 "domain
    /// unregistration waits indefinitely for pending drain").
    pub fn unregister_domain(&self, cpu: usize, slot: usize) -> Result<Arc<crate::domain::Domain>, PipelineError> {
        let dom = self.pipeline.domain(slot).ok_or(PipelineError::NotFound)?;
        for irq in 0..dom.nr_irqs() {
            dom.control_irq(irq, IrqControl::all(), IrqControl::PASS);
        }
        for c in 0..self.pipeline.num_cpus() {
            while self.pipeline.percpu(c, slot).has_pending() {
                self.sync_stage(c, slot, false);
            }
        }
        self.pipeline.unregister_domain(cpu, slot)
    }

    /// Models the legacy "sti; hlt" atomically (spec.md §4.4).
    pub fn halt_root(&self, cpu: usize) {
        self.pipeline.percpu(cpu, ROOT_SLOT).clear_stall();
        let pending = self.pipeline.percpu(cpu, ROOT_SLOT).has_pending();
        unsafe { self.pipeline.hal.local_irq_enable_hw() };
        if pending {
            self.sync_stage(cpu, ROOT_SLOT, false);
        } else {
            self.pipeline.hal.wait_for_interrupt();
        }
    }
}
