//! Arch/platform interface consumed by the pipeline core.
//!
//! Mirrors the shape of the teacher's `exception::InterruptArch` trait: a
//! single trait the core dispatches through for everything that actually
//! touches hardware (hw IF flag, APIC, IPIs, TSC). Unlike
//! `InterruptArch`/`CurrentIrqArch`, which the teacher resolves at compile
//! time to a concrete per-arch type, `Hal` here is consumed as `Arc<dyn Hal>`
//! — the same trait-object pattern the teacher uses for `IrqChip` and
//! `SoftirqVec` — so a pipeline can be built and driven by host-side tests
//! (§8 scenario 5 spins up four `std::thread`s standing in for four CPUs)
//! without pulling in a real arch backend.

use alloc::sync::Arc;

use crate::int_like;

int_like!(CpuId, usize);
int_like!(IrqNumber, u32);
int_like!(HardwareIrqNumber, u32);

/// Opaque snapshot of the hardware interrupt-enable flag, as returned by
/// [`Hal::local_irq_save_hw`] and consumed by [`Hal::local_irq_restore_hw`].
///
/// Treat as a bag of bits; only the `Hal` implementation that produced one
/// knows how to interpret it (on x86 this would be the pushed `RFLAGS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwFlags(pub usize);

/// Destination for [`Hal::send_ipi`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiTarget {
    /// Every CPU other than the caller (§4.6 critical section rendezvous).
    AllButSelf,
    /// A single named CPU.
    Cpu(CpuId),
}

/// The interfaces spec.md §6 lists as consumed from the arch/platform layer.
///
/// Every method here corresponds to one bullet of §6's "The core consumes"
/// list. None of it is implemented in this crate: a hosting kernel supplies a
/// concrete `Hal` (real hardware) and the test suite supplies a software
/// stand-in (see `tests/support.rs`).
pub trait Hal: Send + Sync {
    /// Read and disable the hardware IF flag in one step. Returns the state
    /// from before the call so it can be handed to `local_irq_restore_hw`.
    ///
    /// # Safety
    ///
    /// Must only be paired with a matching `local_irq_restore_hw` on the same
    /// CPU; nesting is the caller's responsibility (the core never nests
    /// these itself — see [`crate::stall::StallGate`]).
    unsafe fn local_irq_save_hw(&self) -> HwFlags;

    /// Restore a previously saved hardware IF flag.
    ///
    /// # Safety
    ///
    /// `flags` must have come from a `local_irq_save_hw` call on this same
    /// CPU with no intervening restore.
    unsafe fn local_irq_restore_hw(&self, flags: HwFlags);

    /// Unconditionally enable the hardware IF flag.
    ///
    /// # Safety
    ///
    /// Must not be called from a context where the caller's own invariants
    /// depend on IRQs staying masked (e.g. inside the head domain's ISR,
    /// spec.md §3 invariant 7).
    unsafe fn local_irq_enable_hw(&self);

    /// Unconditionally disable the hardware IF flag.
    ///
    /// # Safety
    ///
    /// See `local_irq_enable_hw`.
    unsafe fn local_irq_disable_hw(&self);

    /// True if the hardware IF flag is currently set.
    fn irqs_enabled_hw(&self) -> bool;

    /// Index of the CPU this call is running on, 0-based and stable for the
    /// duration of the call (no migration mid-call).
    fn processor_id(&self) -> CpuId;

    /// Total number of CPUs this `Hal` is configured for.
    fn num_cpus(&self) -> usize;

    /// Send the CRITICAL IPI (or any other software IPI vector) to `target`.
    fn send_ipi(&self, vector: IrqNumber, target: IpiTarget);

    /// Acknowledge a hardware vector at the interrupt controller.
    fn ack_apic(&self, irq: HardwareIrqNumber);

    /// Unmask a hardware vector at the interrupt controller.
    fn enable_vector(&self, irq: HardwareIrqNumber);

    /// Mask a hardware vector at the interrupt controller.
    fn disable_vector(&self, irq: HardwareIrqNumber);

    /// Free-running cycle counter, used only by the optional tick helpers
    /// (`sysinfo`); a `Hal` with no such counter may return 0.
    fn rdtsc(&self) -> u64 {
        0
    }

    /// Park the CPU until the next interrupt, with hw IF already on
    /// (`halt_root`'s "sti; hlt", spec.md §4.4). A `Hal` with no idle
    /// instruction may busy-spin or return immediately; either is safe,
    /// just less power-efficient.
    fn wait_for_interrupt(&self) {}

    /// CPU clock frequency in Hz, for `sysinfo` (spec.md §6); 0 if unknown.
    fn cpu_frequency_hz(&self) -> u64 {
        0
    }

    /// The hardware vector driving the system tick, if this platform wires
    /// one through the pipeline (spec.md §4.5 step 7, §6 `sysinfo`).
    fn tick_irq(&self) -> Option<HardwareIrqNumber> {
        None
    }

    /// Timer frequency in Hz backing `tick_irq`, for `sysinfo`; 0 if none.
    fn timer_frequency_hz(&self) -> u64 {
        0
    }
}

/// RAII restoration of a saved hardware IF flag, mirroring the teacher's
/// `IrqFlagsGuard`.
///
/// Dropping the guard restores the flag captured at construction. Built by
/// [`save_and_disable_irq`].
pub struct IrqFlagsGuard {
    hal: Arc<dyn Hal>,
    flags: HwFlags,
    armed: bool,
}

impl IrqFlagsGuard {
    /// Consume the guard without restoring (the caller has taken over
    /// responsibility for the flag, e.g. handing it to `StallGate::restore`).
    pub fn disarm(mut self) -> HwFlags {
        self.armed = false;
        self.flags
    }
}

impl Drop for IrqFlagsGuard {
    fn drop(&mut self) {
        if self.armed {
            unsafe { self.hal.local_irq_restore_hw(self.flags) };
        }
    }
}

/// Save the current hardware IF flag and disable interrupts, returning a
/// guard that restores it on drop.
pub fn save_and_disable_irq(hal: &Arc<dyn Hal>) -> IrqFlagsGuard {
    let flags = unsafe { hal.local_irq_save_hw() };
    IrqFlagsGuard {
        hal: hal.clone(),
        flags,
        armed: true,
    }
}
