//! Scenario 6: domain A (head) and ROOT both register a handler for the
//! same event. A returns "handled". Expect: ROOT's handler is never
//! invoked, `dispatch_event` returns true, and pipeline state (current
//! slot) is unchanged afterward.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use interrupt_pipeline::{Dispatcher, Hal, Pipeline, ROOT_SLOT};
use support::TestHal;

const SYSCALL: usize = 1;

static HEAD_EVENT_CALLS: AtomicU32 = AtomicU32::new(0);
static ROOT_EVENT_CALLS: AtomicU32 = AtomicU32::new(0);

fn head_event_handler(_event: u32, _data: usize) -> bool {
    HEAD_EVENT_CALLS.fetch_add(1, Ordering::SeqCst);
    true
}

fn root_event_handler(_event: u32, _data: usize) -> bool {
    ROOT_EVENT_CALLS.fetch_add(1, Ordering::SeqCst);
    true
}

#[test]
fn head_handling_event_stops_propagation_to_root() {
    HEAD_EVENT_CALLS.store(0, Ordering::SeqCst);
    ROOT_EVENT_CALLS.store(0, Ordering::SeqCst);

    let hal: Arc<dyn Hal> = Arc::new(TestHal::new(1));
    let pipeline = Pipeline::<4>::new(hal.clone(), 64, 8, 32, support::root_attr());
    let dispatcher = Dispatcher::new(pipeline.clone());

    let head_slot = dispatcher
        .register_domain(0, support::head_attr(1))
        .unwrap();
    dispatcher.catch_event(head_slot, SYSCALL, Some(head_event_handler));
    dispatcher.catch_event(ROOT_SLOT, SYSCALL, Some(root_event_handler));

    let slot_before = pipeline.current_slot(0);

    unsafe { hal.local_irq_disable_hw() };
    let handled = dispatcher.dispatch_event(0, SYSCALL, 0);
    unsafe { hal.local_irq_enable_hw() };

    assert!(handled);
    assert_eq!(HEAD_EVENT_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(
        ROOT_EVENT_CALLS.load(Ordering::SeqCst),
        0,
        "a handled event never reaches a lower-priority domain"
    );
    assert_eq!(
        pipeline.current_slot(0),
        slot_before,
        "dispatch_event restores the current slot once the handler returns"
    );
}
