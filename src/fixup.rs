//! Shared divert/handle IF fixup (spec.md §9, SPEC_FULL.md §C.3).
//!
//! "Divert" (the active non-root domain takes an exception itself) and
//! "handle" (the exception is forwarded to ROOT) both need to patch the
//! interrupted context's saved IF bit so it reflects the *domain's* STALL
//! bit rather than the hardware's real IF — otherwise code resuming after
//! the exception would see a flag state it never asked for. Both paths
//! share this one helper instead of duplicating the patch-up.

use crate::pipeline::Pipeline;

/// The virtualized IF bit as the interrupted domain should observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualFlags {
    pub stalled: bool,
}

/// Computes the fixed-up virtual flags for `(cpu, slot)`. Callers patch
/// whatever trap-frame representation they have with `stalled` in place of
/// the hardware IF bit; this crate has no trap-frame type of its own (entering
/// and leaving IRQ frames is out of scope, spec.md §1).
pub fn fixup_trap_flags<const N: usize>(pipeline: &Pipeline<N>, cpu: usize, slot: usize) -> VirtualFlags {
    VirtualFlags {
        stalled: pipeline.percpu(cpu, slot).is_stalled(),
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::domain::DomainAttr;
    use crate::hal::test_hal::TestHal;
    use alloc::sync::Arc;

    #[test]
    fn fixup_reflects_stall_bit_not_hw_flag() {
        let hal: Arc<dyn crate::hal::Hal> = Arc::new(TestHal::new(1));
        let pipeline = Pipeline::<4>::new(
            hal,
            64,
            8,
            32,
            DomainAttr {
                name: "root",
                domid: 0,
                priority: 0,
                sprintk: false,
                entry: None,
            },
        );
        crate::stall::stall(&pipeline, 0, 0);
        let flags = fixup_trap_flags(&pipeline, 0, 0);
        assert!(flags.stalled);
    }
}
