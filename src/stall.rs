//! C5 — StallGate: the per-(cpu, domain) stall bit, virtualizing the CPU's
//! IF flag (spec.md §4.4).
//!
//! The actual "drain the pending log" behavior of `unstall_head`/
//! `restore_head` belongs to the Dispatcher (C6): these take a `drain`
//! closure supplied by the caller instead of calling `sync_stage`/
//! `walk_pipeline` directly, so this module stays below `dispatch` in the
//! dependency order while still living where spec.md §2's table puts it.

use crate::hal::save_and_disable_irq;
use crate::pipeline::Pipeline;

/// Hw-IRQs-off around a status-word manipulation; leaves hw IF off
/// afterwards if `domain_is_head`, else restores the pre-call state
/// (spec.md §4.4: "the head owns the CPU").
fn with_hw_off<const N: usize, R>(
    pipeline: &Pipeline<N>,
    domain_is_head: bool,
    body: impl FnOnce() -> R,
) -> R {
    let guard = save_and_disable_irq(&pipeline.hal);
    let result = body();
    if domain_is_head {
        guard.disarm();
    }
    result
}

fn is_head<const N: usize>(pipeline: &Pipeline<N>, slot: usize) -> bool {
    pipeline
        .domain(slot)
        .map(|d| d.is_head())
        .unwrap_or(false)
}

pub fn stall<const N: usize>(pipeline: &Pipeline<N>, cpu: usize, slot: usize) {
    let head = is_head(pipeline, slot);
    with_hw_off(pipeline, head, || pipeline.percpu(cpu, slot).set_stall());
}

pub fn unstall<const N: usize>(pipeline: &Pipeline<N>, cpu: usize, slot: usize) {
    let head = is_head(pipeline, slot);
    with_hw_off(pipeline, head, || pipeline.percpu(cpu, slot).clear_stall());
}

pub fn test_and_stall<const N: usize>(pipeline: &Pipeline<N>, cpu: usize, slot: usize) -> bool {
    let head = is_head(pipeline, slot);
    with_hw_off(pipeline, head, || {
        pipeline.percpu(cpu, slot).test_and_set_stall()
    })
}

pub fn test_and_unstall<const N: usize>(pipeline: &Pipeline<N>, cpu: usize, slot: usize) -> bool {
    let head = is_head(pipeline, slot);
    with_hw_off(pipeline, head, || {
        pipeline.percpu(cpu, slot).test_and_clear_stall()
    })
}

/// `restore(dom, x)`: set the stall bit to exactly `x`.
pub fn restore<const N: usize>(pipeline: &Pipeline<N>, cpu: usize, slot: usize, stalled: bool) {
    let head = is_head(pipeline, slot);
    with_hw_off(pipeline, head, || {
        pipeline.percpu(cpu, slot).restore_stall(stalled)
    });
}

/// Clears HEAD's STALL bit; if anything was left pending, invokes `drain`
/// (the caller picks `sync_stage` or `walk_pipeline` depending on whether
/// HEAD is the currently running domain, spec.md §4.4).
pub fn unstall_head<const N: usize>(pipeline: &Pipeline<N>, cpu: usize, head_slot: usize, drain: impl FnOnce()) {
    with_hw_off(pipeline, true, || {
        pipeline.percpu(cpu, head_slot).clear_stall();
    });
    if pipeline.percpu(cpu, head_slot).has_pending() {
        drain();
    }
}

/// Optimized `restore_head(x)`: skips the slow path entirely when `x`
/// already matches the current STALL bit.
pub fn restore_head<const N: usize>(
    pipeline: &Pipeline<N>,
    cpu: usize,
    head_slot: usize,
    stalled: bool,
    drain: impl FnOnce(),
) {
    if pipeline.percpu(cpu, head_slot).is_stalled() == stalled {
        return;
    }
    if stalled {
        with_hw_off(pipeline, true, || {
            pipeline.percpu(cpu, head_slot).set_stall();
        });
    } else {
        unstall_head(pipeline, cpu, head_slot, drain);
    }
}
