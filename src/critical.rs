//! Cross-CPU critical section (spec.md §4.6 `critical_enter`/`critical_exit`,
//! `do_critical_sync`).
//!
//! A caller that needs every CPU frozen (no domain's dispatcher can run,
//! hardware IRQs masked everywhere) calls `critical_enter`. On a single-CPU
//! build this collapses to a plain hardware IRQ mask (spec.md §4.6 step 2,
//! mirrored by the `smp` feature). On SMP it additionally sends a reserved
//! IPI (`pipeline::critical_ipi_irq`) to every other CPU and waits for each
//! to join `cpu_sync_map` before returning, so the caller knows the whole
//! machine is held.
//!
//! `barrier` is the baton: the owner takes it before sending the IPI and
//! holds it for the lifetime of the critical section. Remote CPUs land in
//! `do_critical_sync` (dispatched there directly by `Dispatcher::handle_irq`,
//! spec.md §4.7, rather than through a registered handler), mark themselves
//! in `cpu_sync_map`, and then block trying to take `barrier` themselves.
//! When the owner calls `critical_exit` it releases `barrier` once; exactly
//! one blocked remote wins it, runs `sync_fn`, releases it again for the
//! next remote, and clears its own `cpu_sync_map` bit — a one-at-a-time
//! relay through every pending CPU. The owner's `critical_exit` does not
//! return control until `cpu_sync_map` is empty again.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use pipeline_sync::{RawSpinlock, SpinLock};

use crate::hal::{HwFlags, IpiTarget, IrqNumber};
use crate::pipeline::{critical_ipi_irq, Pipeline};

const NO_OWNER: usize = usize::MAX;

/// Saved hardware flags from `critical_enter`, consumed by `critical_exit`.
pub struct CriticalGuard {
    flags: HwFlags,
    single_cpu: bool,
}

pub struct CriticalSection<const N: usize> {
    pipeline: Arc<Pipeline<N>>,
    /// Serializes distinct owners across time; a CPU already holding the
    /// section skips straight to the reentrant counter.
    critical_lock: RawSpinlock,
    /// Held by the owner for the duration of the section; remote CPUs relay
    /// through it one at a time once the owner releases it.
    barrier: RawSpinlock,
    cpu_sync_map: AtomicU64,
    reentrant_count: AtomicUsize,
    owner_cpu: AtomicUsize,
    sync_fn: SpinLock<Option<Arc<dyn Fn() + Send + Sync>>>,
    /// Bumped once the owner has taken `barrier` and sent the IPI, so test
    /// harnesses driving `do_critical_sync` by hand know it is safe to race
    /// for `barrier` rather than happening to win it first.
    ipi_epoch: AtomicUsize,
}

impl<const N: usize> CriticalSection<N> {
    pub fn new(pipeline: Arc<Pipeline<N>>) -> Self {
        Self {
            pipeline,
            critical_lock: RawSpinlock::new(),
            barrier: RawSpinlock::new(),
            cpu_sync_map: AtomicU64::new(0),
            reentrant_count: AtomicUsize::new(0),
            owner_cpu: AtomicUsize::new(NO_OWNER),
            sync_fn: SpinLock::new(None),
            ipi_epoch: AtomicUsize::new(0),
        }
    }

    /// Enters the section. `sync_fn`, if given, runs once on every other CPU
    /// before this call returns (ignored on re-entry by the current owner).
    pub fn critical_enter(
        &self,
        cpu: usize,
        sync_fn: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> CriticalGuard {
        let flags = unsafe { self.pipeline.hal.local_irq_save_hw() };

        if self.pipeline.num_cpus() <= 1 {
            return CriticalGuard {
                flags,
                single_cpu: true,
            };
        }

        if self.owner_cpu.load(Ordering::SeqCst) != cpu {
            // Back off proportional to CPU id: a cheap, deterministic
            // tie-break between two CPUs racing to become owner.
            while !self.critical_lock.try_lock() {
                for _ in 0..(cpu as u32 + 1) * 16 {
                    core::hint::spin_loop();
                }
            }
            self.owner_cpu.store(cpu, Ordering::SeqCst);
            self.barrier.lock();
            *self.sync_fn.lock() = sync_fn;
            self.pipeline.hal.send_ipi(
                IrqNumber::from(critical_ipi_irq(self.pipeline.nr_irqs) as u32),
                IpiTarget::AllButSelf,
            );
            self.ipi_epoch.fetch_add(1, Ordering::SeqCst);
            let expected = all_but_self_mask(self.pipeline.num_cpus(), cpu);
            while self.cpu_sync_map.load(Ordering::SeqCst) & expected != expected {
                core::hint::spin_loop();
            }
        }

        self.reentrant_count.fetch_add(1, Ordering::SeqCst);
        CriticalGuard {
            flags,
            single_cpu: false,
        }
    }

    pub fn critical_exit(&self, guard: CriticalGuard) {
        if guard.single_cpu {
            unsafe { self.pipeline.hal.local_irq_restore_hw(guard.flags) };
            return;
        }

        if self.reentrant_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.barrier.unlock();
            while self.cpu_sync_map.load(Ordering::SeqCst) != 0 {
                core::hint::spin_loop();
            }
            *self.sync_fn.lock() = None;
            self.owner_cpu.store(NO_OWNER, Ordering::SeqCst);
            self.ipi_epoch.store(0, Ordering::SeqCst);
            self.critical_lock.unlock();
        }

        unsafe { self.pipeline.hal.local_irq_restore_hw(guard.flags) };
    }

    /// Runs on a remote CPU in response to the critical IPI. `Dispatcher`
    /// routes this vector here directly rather than through a registered
    /// handler (spec.md §4.7).
    pub fn do_critical_sync(&self, cpu: usize) {
        self.cpu_sync_map.fetch_or(1 << cpu, Ordering::SeqCst);
        self.barrier.lock();
        let f = self.sync_fn.lock().clone();
        if let Some(f) = f {
            f();
        }
        self.barrier.unlock();
        self.cpu_sync_map.fetch_and(!(1 << cpu), Ordering::SeqCst);
    }

    pub fn cpu_sync_map(&self) -> u64 {
        self.cpu_sync_map.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.owner_cpu.load(Ordering::SeqCst) != NO_OWNER
    }

    /// Bumped once per `critical_enter` call that actually sends the IPI.
    /// A software `Hal` has no interrupt controller to deliver that IPI
    /// through, so a harness driving `do_critical_sync` by hand polls this
    /// to learn when the owner has reached the point a real IPI would have
    /// landed, rather than racing `do_critical_sync` against the owner's own
    /// `barrier.lock()`.
    pub fn ipi_epoch(&self) -> usize {
        self.ipi_epoch.load(Ordering::SeqCst)
    }
}

fn all_but_self_mask(num_cpus: usize, cpu: usize) -> u64 {
    let all = if num_cpus >= 64 {
        u64::MAX
    } else {
        (1u64 << num_cpus) - 1
    };
    all & !(1 << cpu)
}
