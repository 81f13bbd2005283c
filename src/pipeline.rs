//! C4 — Pipeline: the priority-sorted list of domains and the per-CPU
//! arrays indexed by domain slot.
//!
//! `MAX_DOMAINS` is a const generic (a small, fixed-size slab is the
//! natural fit and keeps every slot index access a bounds-checked array
//! read instead of a `Vec` indirection); `NR_IRQS`/`NR_EVENTS` are runtime
//! parameters backing `Vec`-allocated bitmaps instead of a second and third
//! const generic, since sizing a fixed array from an arbitrary const
//! generic requires the unstable `generic_const_exprs` feature — see
//! DESIGN.md for the full writeup of this Open Question resolution.
//!
//! Ownership mirrors spec.md §9: domains are referenced by slot index, not
//! by back-pointer, to avoid a `Domain → PerCpuDomainState → Domain` cycle.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{info, warn};
use pipeline_error::PipelineError;
use pipeline_sync::SpinLock;

use crate::domain::{Domain, DomainAttr, IrqControl, ROOT_SLOT};
use crate::hal::Hal;
use crate::percpu::PerCpuDomainState;

struct Slots<const MAX_DOMAINS: usize> {
    domains: [Option<Arc<Domain>>; MAX_DOMAINS],
    /// Slot indices sorted by descending priority; the head slot (if
    /// occupied) is always `order[0]` (spec.md §3 invariant 2).
    order: Vec<usize>,
}

impl<const MAX_DOMAINS: usize> Slots<MAX_DOMAINS> {
    fn new() -> Self {
        Self {
            domains: core::array::from_fn(|_| None),
            order: Vec::new(),
        }
    }

    fn lowest_free_slot(&self) -> Option<usize> {
        // Slot 0 is ROOT, slot MAX_DOMAINS-1 is HEAD; neither is handed out
        // by the generic allocator.
        (1..MAX_DOMAINS - 1).find(|&s| self.domains[s].is_none())
    }

    fn domid_taken(&self, domid: u32) -> bool {
        self.domains.iter().flatten().any(|d| d.domid == domid)
    }

    fn insert_ordered(&mut self, slot: usize) {
        let priority = self.domains[slot].as_ref().unwrap().priority();
        let pos = self
            .order
            .iter()
            .position(|&s| self.domains[s].as_ref().unwrap().priority() < priority)
            .unwrap_or(self.order.len());
        self.order.insert(pos, slot);
    }

    fn remove_ordered(&mut self, slot: usize) {
        self.order.retain(|&s| s != slot);
    }
}

/// The reserved, pre-wired vector used for the critical-section rendezvous
/// IPI (SPEC_FULL.md §C.1). Always the topmost addressable vector.
pub fn critical_ipi_irq(nr_irqs: usize) -> usize {
    nr_irqs - 1
}

pub struct Pipeline<const MAX_DOMAINS: usize> {
    pub(crate) hal: Arc<dyn Hal>,
    pub(crate) nr_irqs: usize,
    pub(crate) nr_events: usize,
    pub(crate) first_virq: usize,
    slots: SpinLock<Slots<MAX_DOMAINS>>,
    percpu: Vec<[PerCpuDomainState; MAX_DOMAINS]>,
    current_domain: Vec<AtomicUsize>,
}

impl<const MAX_DOMAINS: usize> Pipeline<MAX_DOMAINS> {
    /// Builds a pipeline and bootstraps the ROOT domain at slot 0. ROOT is
    /// exempt from the "caller must be ROOT" check every later
    /// `register_domain` enforces, since no domain yet exists to satisfy it.
    pub fn new(
        hal: Arc<dyn Hal>,
        nr_irqs: usize,
        nr_events: usize,
        first_virq: usize,
        root_attr: DomainAttr,
    ) -> Arc<Self> {
        assert!(MAX_DOMAINS >= 2, "need at least ROOT and HEAD slots");
        let num_cpus = hal.num_cpus();
        #[cfg(not(feature = "smp"))]
        assert_eq!(num_cpus, 1, "non-smp build only supports a single CPU");
        let mut percpu = Vec::with_capacity(num_cpus);
        for _ in 0..num_cpus {
            percpu.push(core::array::from_fn(|_| {
                PerCpuDomainState::new(nr_irqs, first_virq)
            }));
        }
        let mut current_domain = Vec::with_capacity(num_cpus);
        for _ in 0..num_cpus {
            current_domain.push(AtomicUsize::new(ROOT_SLOT));
        }

        let mut slots = Slots::new();
        let root = Domain::new(ROOT_SLOT, nr_irqs, nr_events, &root_attr);
        slots.domains[ROOT_SLOT] = Some(Arc::new(root));
        slots.insert_ordered(ROOT_SLOT);
        pre_wire_critical_ipi(slots.domains[ROOT_SLOT].as_ref().unwrap(), nr_irqs);

        Arc::new(Self {
            hal,
            nr_irqs,
            nr_events,
            first_virq,
            slots: SpinLock::new(slots),
            percpu,
            current_domain,
        })
    }

    pub fn num_cpus(&self) -> usize {
        self.percpu.len()
    }

    pub fn percpu(&self, cpu: usize, slot: usize) -> &PerCpuDomainState {
        &self.percpu[cpu][slot]
    }

    pub fn current_slot(&self, cpu: usize) -> usize {
        self.current_domain[cpu].load(Ordering::SeqCst)
    }

    pub fn set_current_slot(&self, cpu: usize, slot: usize) -> usize {
        self.current_domain[cpu].swap(slot, Ordering::SeqCst)
    }

    pub fn domain(&self, slot: usize) -> Option<Arc<Domain>> {
        self.slots.lock().domains[slot].clone()
    }

    pub fn root(&self) -> Arc<Domain> {
        self.domain(ROOT_SLOT).expect("ROOT is never unregistered out from under a live pipeline")
    }

    pub fn head(&self) -> Option<Arc<Domain>> {
        self.domain(MAX_DOMAINS - 1)
    }

    /// A snapshot of the priority order, highest first. Taken under the
    /// slots lock and then released, matching spec.md §4.7's "safe to
    /// mutation: use a snapshot" guidance for list walks.
    pub fn order_snapshot(&self) -> Vec<usize> {
        self.slots.lock().order.clone()
    }

    pub fn register_domain(&self, calling_cpu: usize, attr: DomainAttr) -> Result<usize, PipelineError> {
        if self.current_slot(calling_cpu) != ROOT_SLOT {
            warn!("register_domain({}): caller is not ROOT", attr.name);
            return Err(PipelineError::NotPermitted);
        }
        let mut slots = self.slots.lock();
        if slots.domid_taken(attr.domid) {
            warn!("register_domain({}): domid {} already taken", attr.name, attr.domid);
            return Err(PipelineError::Busy);
        }
        let slot = if attr.priority == crate::domain::HEAD_PRIORITY {
            let head_slot = MAX_DOMAINS - 1;
            if slots.domains[head_slot].is_some() {
                warn!("register_domain({}): head slot already occupied", attr.name);
                return Err(PipelineError::Busy);
            }
            head_slot
        } else {
            slots.lowest_free_slot().ok_or(PipelineError::NoSlots)?
        };
        let domain = Domain::new(slot, self.nr_irqs, self.nr_events, &attr);
        pre_wire_critical_ipi(&domain, self.nr_irqs);
        slots.domains[slot] = Some(Arc::new(domain));
        slots.insert_ordered(slot);
        info!("domain '{}' registered at slot {}", attr.name, slot);
        Ok(slot)
    }

    /// Structural teardown only: clearing IRQ dispositions and draining
    /// per-CPU pending maps is the caller's (`Dispatcher`'s) job, since it
    /// needs `sync_stage`/`walk_pipeline` semantics this layer doesn't have.
    pub fn unregister_domain(&self, calling_cpu: usize, slot: usize) -> Result<Arc<Domain>, PipelineError> {
        if self.current_slot(calling_cpu) != ROOT_SLOT {
            return Err(PipelineError::NotPermitted);
        }
        if slot == ROOT_SLOT {
            return Err(PipelineError::InvalidArgument);
        }
        let mut slots = self.slots.lock();
        let domain = slots.domains[slot].take().ok_or(PipelineError::NotFound)?;
        slots.remove_ordered(slot);
        info!("domain unregistered from slot {}", slot);
        Ok(domain)
    }
}

fn pre_wire_critical_ipi(domain: &Domain, nr_irqs: usize) {
    let irq = critical_ipi_irq(nr_irqs);
    domain.control_irq(
        irq,
        IrqControl::PASS,
        IrqControl::STICKY | IrqControl::SYSTEM | IrqControl::HANDLE,
    );
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::hal::test_hal::TestHal;

    fn root_attr() -> DomainAttr {
        DomainAttr {
            name: "root",
            domid: 0,
            priority: 0,
            sprintk: false,
            entry: None,
        }
    }

    fn head_attr() -> DomainAttr {
        DomainAttr {
            name: "head",
            domid: 1,
            priority: crate::domain::HEAD_PRIORITY,
            sprintk: false,
            entry: None,
        }
    }

    fn make_pipeline() -> Arc<Pipeline<4>> {
        let hal: Arc<dyn Hal> = Arc::new(TestHal::new(1));
        Pipeline::<4>::new(hal, 64, 8, 32, root_attr())
    }

    #[test]
    fn root_is_bootstrapped_at_slot_zero() {
        let p = make_pipeline();
        assert_eq!(p.root().slot, ROOT_SLOT);
        assert_eq!(p.order_snapshot(), alloc_vec_usize(&[0]));
    }

    #[test]
    fn head_registration_claims_top_slot() {
        let p = make_pipeline();
        let slot = p.register_domain(0, head_attr()).unwrap();
        assert_eq!(slot, 3);
        assert_eq!(p.order_snapshot(), alloc_vec_usize(&[3, 0]));
        assert!(p.head().is_some());
    }

    #[test]
    fn duplicate_head_rejected() {
        let p = make_pipeline();
        p.register_domain(0, head_attr()).unwrap();
        let err = p.register_domain(0, head_attr()).unwrap_err();
        assert_eq!(err, PipelineError::Busy);
    }

    #[test]
    fn duplicate_domid_rejected() {
        let p = make_pipeline();
        let mut attr = head_attr();
        attr.priority = 5;
        attr.domid = 0; // collides with root
        let err = p.register_domain(0, attr).unwrap_err();
        assert_eq!(err, PipelineError::Busy);
    }

    #[test]
    fn no_slots_when_middle_slots_exhausted() {
        let p = make_pipeline();
        // MAX_DOMAINS=4: slot 0 root, slot 3 head, only slot 1,2 free.
        p.register_domain(0, DomainAttr { name: "a", domid: 10, priority: 5, sprintk: false, entry: None }).unwrap();
        p.register_domain(0, DomainAttr { name: "b", domid: 11, priority: 6, sprintk: false, entry: None }).unwrap();
        let err = p
            .register_domain(0, DomainAttr { name: "c", domid: 12, priority: 7, sprintk: false, entry: None })
            .unwrap_err();
        assert_eq!(err, PipelineError::NoSlots);
    }

    #[test]
    fn non_root_caller_rejected() {
        let p = make_pipeline();
        p.set_current_slot(0, 1);
        let err = p.register_domain(0, head_attr()).unwrap_err();
        assert_eq!(err, PipelineError::NotPermitted);
    }

    #[test]
    fn unregister_removes_from_order_and_frees_slot() {
        let p = make_pipeline();
        let slot = p.register_domain(0, head_attr()).unwrap();
        p.unregister_domain(0, slot).unwrap();
        assert_eq!(p.order_snapshot(), alloc_vec_usize(&[0]));
        assert!(p.head().is_none());
    }

    #[test]
    fn priority_order_is_descending() {
        let p = make_pipeline();
        p.register_domain(0, DomainAttr { name: "low", domid: 10, priority: 1, sprintk: false, entry: None }).unwrap();
        p.register_domain(0, DomainAttr { name: "high", domid: 11, priority: 9, sprintk: false, entry: None }).unwrap();
        // root priority 0 sorts after both.
        assert_eq!(p.order_snapshot(), alloc_vec_usize(&[2, 1, 0]));
    }

    fn alloc_vec_usize(s: &[usize]) -> Vec<usize> {
        s.to_vec()
    }
}
