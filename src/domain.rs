//! C3 — Domain: a registered pipeline stage.
//!
//! One `Domain` per slot in the `Pipeline`. Everything that is mutated only
//! on the slow reconfiguration path (`virtualize_irq`, `control_irq`,
//! `catch_event`) lives behind small per-descriptor locks; the bits read on
//! every dispatch (`control`, the LOCK bit) are a bare `AtomicU32` so the hot
//! path never blocks on the slow path.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use log::warn;
use pipeline_error::PipelineError;
use pipeline_sync::SpinLock;

use crate::hal::IrqNumber;

bitflags! {
    pub struct DomainFlags: u32 {
        /// This domain holds the pipeline's invariant-head slot (spec.md
        /// §3's `HEAD_PRIORITY` sentinel, §9's "invariant head"). At most
        /// one domain carries this flag at a time.
        const AHEAD = 1 << 0;
        /// A printk virq is wired on this platform for this domain.
        const SPRINTK = 1 << 1;
    }
}

bitflags! {
    pub struct IrqControl: u32 {
        const HANDLE = 1 << 0;
        const PASS = 1 << 1;
        const ENABLE = 1 << 2;
        const STICKY = 1 << 3;
        const SYSTEM = 1 << 4;
        const LOCK = 1 << 5;
        const WIRED = 1 << 6;
        const EXCLUSIVE = 1 << 7;
    }
}

/// An interrupt service routine. Plain `fn` pointers (no closure captures),
/// matching the C-callback shape every collaborator named in spec.md §6
/// presents (`ack`, `handler`); state crosses the boundary via `cookie`
/// rather than capture, the same split the teacher's legacy
/// `SOFTIRQ_HANDLER_PTR` call sites use for C-interop handlers.
pub type IrqHandlerFn = fn(irq: IrqNumber, cookie: usize);
pub type AckFn = fn(irq: IrqNumber);
/// An event handler; returns whether it handled the event (stops
/// propagation per spec.md §4.7).
pub type EventHandlerFn = fn(event: u32, data: usize) -> bool;

/// What to do with the handler slot on `virtualize_irq` (spec.md §4.3).
#[derive(Clone, Copy)]
pub enum HandlerSpec {
    /// Clear the handler.
    None,
    /// `SAME_HANDLER`: keep whatever handler/cookie is already installed.
    Same,
    /// Install a new handler and cookie.
    Set(IrqHandlerFn),
}

struct IrqSlow {
    ack: Option<AckFn>,
    handler: Option<IrqHandlerFn>,
    cookie: usize,
}

/// One domain's view of one IRQ vector.
pub struct IrqDescriptor {
    control: AtomicU32,
    slow: SpinLock<IrqSlow>,
}

impl IrqDescriptor {
    fn new() -> Self {
        Self {
            control: AtomicU32::new(IrqControl::PASS.bits()),
            slow: SpinLock::new(IrqSlow {
                ack: None,
                handler: None,
                cookie: 0,
            }),
        }
    }

    pub fn control(&self) -> IrqControl {
        IrqControl::from_bits_truncate(self.control.load(Ordering::SeqCst))
    }

    /// Clear then set control bits, applying spec.md §4.3's implications
    /// (`STICKY` implies `HANDLE`; clearing either of `HANDLE`/`STICKY`
    /// clears both). Returns the resulting control set.
    pub fn update_control(&self, mut clear: IrqControl, mut set: IrqControl) -> IrqControl {
        if clear.intersects(IrqControl::HANDLE | IrqControl::STICKY) {
            clear |= IrqControl::HANDLE | IrqControl::STICKY;
        }
        if set.contains(IrqControl::STICKY) {
            set |= IrqControl::HANDLE;
        }
        self.control.fetch_and(!clear.bits(), Ordering::SeqCst);
        self.control.fetch_or(set.bits(), Ordering::SeqCst);
        self.control()
    }

    /// Atomically set the LOCK bit; returns whether it was already set.
    pub fn set_lock_bit(&self) -> bool {
        let prev = self.control.fetch_or(IrqControl::LOCK.bits(), Ordering::SeqCst);
        prev & IrqControl::LOCK.bits() != 0
    }

    /// Atomically clear the LOCK bit; returns whether it had been set.
    pub fn clear_lock_bit(&self) -> bool {
        let prev = self
            .control
            .fetch_and(!IrqControl::LOCK.bits(), Ordering::SeqCst);
        prev & IrqControl::LOCK.bits() != 0
    }

    pub fn is_locked(&self) -> bool {
        self.control().contains(IrqControl::LOCK)
    }

    pub fn handler(&self) -> Option<IrqHandlerFn> {
        self.slow.lock().handler
    }

    pub fn ack(&self) -> Option<AckFn> {
        self.slow.lock().ack
    }

    pub fn cookie(&self) -> usize {
        self.slow.lock().cookie
    }

    /// Install handler/ack/cookie and control mode. `is_head_domain` gates
    /// `WIRED` (spec.md §4.3, §9: wired IRQs require the invariant head).
    pub fn configure(
        &self,
        handler: HandlerSpec,
        cookie: usize,
        ack: Option<AckFn>,
        mut mode: IrqControl,
        is_head_domain: bool,
    ) -> Result<(), PipelineError> {
        if mode.contains(IrqControl::WIRED) {
            if !is_head_domain {
                return Err(PipelineError::InvalidArgument);
            }
            if mode.intersects(IrqControl::PASS | IrqControl::STICKY) {
                return Err(PipelineError::InvalidArgument);
            }
        }
        if mode.contains(IrqControl::STICKY) {
            mode |= IrqControl::HANDLE;
        }

        let mut slow = self.slow.lock();
        match handler {
            HandlerSpec::Set(h) => {
                if mode.contains(IrqControl::EXCLUSIVE) && slow.handler.is_some() {
                    warn!("configure: EXCLUSIVE handler already installed");
                    return Err(PipelineError::Busy);
                }
                slow.handler = Some(h);
                slow.cookie = cookie;
            }
            HandlerSpec::Same => {}
            HandlerSpec::None => slow.handler = None,
        }
        if let Some(ack_fn) = ack {
            slow.ack = Some(ack_fn);
        }
        drop(slow);
        self.control.store(mode.bits(), Ordering::SeqCst);
        Ok(())
    }
}

/// Encodes `Option<EventHandlerFn>` in an `AtomicUsize` (0 = `None`), for a
/// lock-free `catch_event` swap (spec.md §4.7: "atomically swap the
/// handler"), the same fn-pointer-as-usize trick the teacher's legacy
/// softirq dispatch table uses for its C-interop handler slots.
struct AtomicEventHandler(AtomicUsize);

impl AtomicEventHandler {
    const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    fn get(&self) -> Option<EventHandlerFn> {
        let raw = self.0.load(Ordering::SeqCst);
        if raw == 0 {
            None
        } else {
            Some(unsafe { core::mem::transmute::<usize, EventHandlerFn>(raw) })
        }
    }

    /// Returns the previous handler.
    fn swap(&self, handler: Option<EventHandlerFn>) -> Option<EventHandlerFn> {
        let raw = match handler {
            Some(f) => f as usize,
            None => 0,
        };
        let prev = self.0.swap(raw, Ordering::SeqCst);
        if prev == 0 {
            None
        } else {
            Some(unsafe { core::mem::transmute::<usize, EventHandlerFn>(prev) })
        }
    }
}

/// Registration-time parameters for [`Domain`] (spec.md §4.2).
pub struct DomainAttr {
    pub name: &'static str,
    pub domid: u32,
    /// `HEAD_PRIORITY` claims the invariant head slot; any other value is a
    /// normal priority, higher sorting earlier.
    pub priority: i64,
    pub sprintk: bool,
    /// Run once, immediately after insertion, with `current_domain`
    /// temporarily switched to this domain (spec.md §4.2).
    pub entry: Option<fn(&Domain)>,
}

/// The sentinel priority claiming the pipeline's invariant head slot.
pub const HEAD_PRIORITY: i64 = i64::MAX;
pub const ROOT_SLOT: usize = 0;

/// A read-only reporting view of a [`Domain`] (spec.md §9: no proc/sysfs
/// exposure, but the data behind it is still made available).
#[derive(Debug, Clone)]
pub struct DomainSnapshot {
    pub name: &'static str,
    pub domid: u32,
    pub slot: usize,
    pub priority: i64,
    pub flags: DomainFlags,
}

pub struct Domain {
    pub slot: usize,
    priority: i64,
    pub name: &'static str,
    pub domid: u32,
    flags: AtomicU32,
    irqs: Vec<IrqDescriptor>,
    evhand: Vec<AtomicEventHandler>,
    evself: AtomicU64,
    /// Serializes slow-path reconfiguration (spec.md §3 `mutex`). Not a
    /// scheduler-backed mutex: task scheduling inside a domain is out of
    /// scope (spec.md §1 Non-goals), so a spinlock is the right primitive.
    reconfig_lock: SpinLock<()>,
}

impl Domain {
    pub fn new(slot: usize, nr_irqs: usize, nr_events: usize, attr: &DomainAttr) -> Self {
        let mut irqs = Vec::with_capacity(nr_irqs);
        for _ in 0..nr_irqs {
            irqs.push(IrqDescriptor::new());
        }
        let mut evhand = Vec::with_capacity(nr_events);
        for _ in 0..nr_events {
            evhand.push(AtomicEventHandler::new());
        }
        let mut flags = DomainFlags::empty();
        if attr.priority == HEAD_PRIORITY {
            flags |= DomainFlags::AHEAD;
        }
        #[cfg(feature = "sprintk")]
        if attr.sprintk {
            flags |= DomainFlags::SPRINTK;
        }
        Self {
            slot,
            priority: attr.priority,
            name: attr.name,
            domid: attr.domid,
            flags: AtomicU32::new(flags.bits()),
            irqs,
            evhand,
            evself: AtomicU64::new(0),
            reconfig_lock: SpinLock::new(()),
        }
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn is_head(&self) -> bool {
        self.priority == HEAD_PRIORITY
    }

    pub fn is_root(&self) -> bool {
        self.slot == ROOT_SLOT
    }

    pub fn flags(&self) -> DomainFlags {
        DomainFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn irq(&self, irq: usize) -> &IrqDescriptor {
        &self.irqs[irq]
    }

    pub fn nr_irqs(&self) -> usize {
        self.irqs.len()
    }

    /// Adjusts control bits on the given vector for *this* domain (spec.md
    /// `control_irq` always targets the current domain; callers resolve
    /// "current" before calling this).
    pub fn control_irq(&self, irq: usize, clear: IrqControl, set: IrqControl) -> IrqControl {
        self.irqs[irq].update_control(clear, set)
    }

    pub fn lock_reconfig(&self) -> pipeline_sync::SpinLockGuard<'_, ()> {
        self.reconfig_lock.lock()
    }

    pub fn event_handler(&self, event: usize) -> Option<EventHandlerFn> {
        self.evhand[event].get()
    }

    /// Swaps the handler for `event`, returning the previous one.
    pub fn catch_event(&self, event: usize, handler: Option<EventHandlerFn>) -> Option<EventHandlerFn> {
        self.evhand[event].swap(handler)
    }

    pub fn evself(&self) -> u64 {
        self.evself.load(Ordering::SeqCst)
    }

    pub fn set_evself(&self, mask: u64) {
        self.evself.store(mask, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> DomainSnapshot {
        DomainSnapshot {
            name: self.name,
            domid: self.domid,
            slot: self.slot,
            priority: self.priority,
            flags: self.flags(),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    fn dummy_attr(priority: i64) -> DomainAttr {
        DomainAttr {
            name: "test",
            domid: 1,
            priority,
            sprintk: false,
            entry: None,
        }
    }

    fn isr(_irq: IrqNumber, _cookie: usize) {}

    #[test]
    fn fresh_descriptor_defaults_to_pass() {
        let dom = Domain::new(0, 8, 4, &dummy_attr(0));
        assert_eq!(dom.irq(0).control(), IrqControl::PASS);
        assert!(dom.irq(0).handler().is_none());
    }

    #[test]
    fn wired_rejected_on_non_head_domain() {
        let dom = Domain::new(0, 8, 4, &dummy_attr(0));
        let err = dom
            .irq(0)
            .configure(HandlerSpec::Set(isr), 0, None, IrqControl::WIRED, false)
            .unwrap_err();
        assert_eq!(err, PipelineError::InvalidArgument);
    }

    #[test]
    fn wired_accepted_on_head_domain() {
        let dom = Domain::new(0, 8, 4, &dummy_attr(HEAD_PRIORITY));
        assert!(dom.is_head());
        dom.irq(0)
            .configure(HandlerSpec::Set(isr), 0, None, IrqControl::WIRED, true)
            .unwrap();
        assert!(dom.irq(0).control().contains(IrqControl::WIRED));
    }

    #[test]
    fn exclusive_rejects_second_handler() {
        let dom = Domain::new(0, 8, 4, &dummy_attr(0));
        dom.irq(0)
            .configure(HandlerSpec::Set(isr), 0, None, IrqControl::EXCLUSIVE, false)
            .unwrap();
        let err = dom
            .irq(0)
            .configure(HandlerSpec::Set(isr), 0, None, IrqControl::EXCLUSIVE, false)
            .unwrap_err();
        assert_eq!(err, PipelineError::Busy);
    }

    #[test]
    fn sticky_implies_handle() {
        let dom = Domain::new(0, 8, 4, &dummy_attr(0));
        let result = dom.control_irq(0, IrqControl::empty(), IrqControl::STICKY);
        assert!(result.contains(IrqControl::HANDLE));
    }

    #[test]
    fn clearing_handle_clears_sticky_too() {
        let dom = Domain::new(0, 8, 4, &dummy_attr(0));
        dom.control_irq(0, IrqControl::empty(), IrqControl::STICKY);
        let result = dom.control_irq(0, IrqControl::HANDLE, IrqControl::empty());
        assert!(!result.contains(IrqControl::STICKY));
        assert!(!result.contains(IrqControl::HANDLE));
    }

    #[test]
    fn lock_bit_round_trip() {
        let dom = Domain::new(0, 8, 4, &dummy_attr(0));
        assert!(!dom.irq(0).set_lock_bit());
        assert!(dom.irq(0).is_locked());
        assert!(dom.irq(0).clear_lock_bit());
        assert!(!dom.irq(0).is_locked());
    }

    fn event_handler(_event: u32, _data: usize) -> bool {
        true
    }

    #[test]
    fn catch_event_swaps_and_reports_previous() {
        let dom = Domain::new(0, 8, 4, &dummy_attr(0));
        assert!(dom.catch_event(0, Some(event_handler)).is_none());
        assert!(dom.event_handler(0).is_some());
        let prev = dom.catch_event(0, None);
        assert!(prev.is_some());
        assert!(dom.event_handler(0).is_none());
    }

    #[test]
    fn snapshot_reports_identity() {
        let dom = Domain::new(2, 8, 4, &dummy_attr(HEAD_PRIORITY));
        let snap = dom.snapshot();
        assert_eq!(snap.slot, 2);
        assert_eq!(snap.priority, HEAD_PRIORITY);
        assert!(snap.flags.contains(DomainFlags::AHEAD));
    }
}
