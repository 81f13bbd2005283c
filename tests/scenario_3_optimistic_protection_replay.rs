//! Scenario 3: interrupts raised while ROOT is stalled queue in the
//! pending log and replay, in ascending vector order, once ROOT unstalls.

mod support;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use interrupt_pipeline::{Dispatcher, HandlerSpec, Hal, IrqControl, IrqNumber, Pipeline, ROOT_SLOT};
use support::TestHal;

static ORDER: AtomicUsize = AtomicUsize::new(0);
static SEEN_11: AtomicU32 = AtomicU32::new(0);
static SEEN_12: AtomicU32 = AtomicU32::new(0);

fn handler_11(_irq: IrqNumber, _cookie: usize) {
    let pos = ORDER.fetch_add(1, Ordering::SeqCst);
    assert_eq!(pos, 0, "the lower-numbered vector replays first");
    SEEN_11.fetch_add(1, Ordering::SeqCst);
}

fn handler_12(_irq: IrqNumber, _cookie: usize) {
    let pos = ORDER.fetch_add(1, Ordering::SeqCst);
    assert_eq!(pos, 1, "the higher-numbered vector replays after");
    SEEN_12.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn stalled_root_queues_then_replays_in_ascending_order() {
    ORDER.store(0, Ordering::SeqCst);
    SEEN_11.store(0, Ordering::SeqCst);
    SEEN_12.store(0, Ordering::SeqCst);

    let hal: Arc<dyn Hal> = Arc::new(TestHal::new(1));
    let pipeline = Pipeline::<4>::new(hal.clone(), 64, 8, 32, support::root_attr());
    let dispatcher = Dispatcher::new(pipeline.clone());

    dispatcher
        .virtualize_irq(ROOT_SLOT, ROOT_SLOT, 11, HandlerSpec::Set(handler_11), 0, None, IrqControl::HANDLE | IrqControl::PASS)
        .unwrap();
    dispatcher
        .virtualize_irq(ROOT_SLOT, ROOT_SLOT, 12, HandlerSpec::Set(handler_12), 0, None, IrqControl::HANDLE | IrqControl::PASS)
        .unwrap();

    interrupt_pipeline::stall::stall(&pipeline, 0, ROOT_SLOT);

    unsafe { hal.local_irq_disable_hw() };
    dispatcher.trigger_irq(0, 11);
    dispatcher.trigger_irq(0, 12);
    dispatcher.trigger_irq(0, 11);
    unsafe { hal.local_irq_enable_hw() };

    assert_eq!(SEEN_11.load(Ordering::SeqCst), 0, "nothing runs while stalled");
    assert_eq!(pipeline.percpu(0, ROOT_SLOT).irqall(11), 2);
    assert_eq!(pipeline.percpu(0, ROOT_SLOT).irqall(12), 1);

    interrupt_pipeline::stall::unstall(&pipeline, 0, ROOT_SLOT);
    unsafe { hal.local_irq_disable_hw() };
    dispatcher.sync_stage(0, ROOT_SLOT, false);
    unsafe { hal.local_irq_enable_hw() };

    assert_eq!(SEEN_11.load(Ordering::SeqCst), 2);
    assert_eq!(SEEN_12.load(Ordering::SeqCst), 1);
    assert!(!pipeline.percpu(0, ROOT_SLOT).is_stalled());
    assert!(hal.irqs_enabled_hw());
}
