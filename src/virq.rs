//! Virtual IRQ allocator (spec.md §3 "Virtual IRQ" lifecycle, §6
//! `alloc_virq`/`free_virq`): a single bitmap over the virq range
//! `[first_virq, nr_irqs)`.

use alloc::vec;
use alloc::vec::Vec;

use pipeline_error::PipelineError;
use pipeline_sync::SpinLock;

pub struct VirqAllocator {
    first_virq: usize,
    used: SpinLock<Vec<bool>>,
}

impl VirqAllocator {
    pub fn new(first_virq: usize, nr_irqs: usize) -> Self {
        assert!(first_virq < nr_irqs, "virq range must be non-empty");
        Self {
            first_virq,
            used: SpinLock::new(vec![false; nr_irqs - first_virq]),
        }
    }

    /// Draws the lowest-numbered free virq.
    pub fn alloc_virq(&self) -> Result<usize, PipelineError> {
        let mut used = self.used.lock();
        let slot = used
            .iter()
            .position(|&taken| !taken)
            .ok_or(PipelineError::NoSlots)?;
        used[slot] = true;
        Ok(self.first_virq + slot)
    }

    pub fn free_virq(&self, irq: usize) -> Result<(), PipelineError> {
        if irq < self.first_virq {
            return Err(PipelineError::InvalidArgument);
        }
        let idx = irq - self.first_virq;
        let mut used = self.used.lock();
        let slot = used.get_mut(idx).ok_or(PipelineError::InvalidArgument)?;
        if !*slot {
            return Err(PipelineError::NotFound);
        }
        *slot = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn alloc_then_free_is_identity() {
        let alloc = VirqAllocator::new(32, 64);
        let before: Vec<bool> = alloc.used.lock().clone();
        let irq = alloc.alloc_virq().unwrap();
        assert!(irq >= 32);
        alloc.free_virq(irq).unwrap();
        assert_eq!(*alloc.used.lock(), before);
    }

    #[test]
    fn double_free_is_rejected() {
        let alloc = VirqAllocator::new(32, 64);
        let irq = alloc.alloc_virq().unwrap();
        alloc.free_virq(irq).unwrap();
        assert_eq!(alloc.free_virq(irq).unwrap_err(), PipelineError::NotFound);
    }

    #[test]
    fn exhaustion_returns_no_slots() {
        let alloc = VirqAllocator::new(62, 64);
        alloc.alloc_virq().unwrap();
        alloc.alloc_virq().unwrap();
        assert_eq!(alloc.alloc_virq().unwrap_err(), PipelineError::NoSlots);
    }
}
