//! Software `Hal` for integration tests, standing in for a real interrupt
//! controller. One `std::thread` per simulated CPU calls `set_current_cpu`
//! once, then drives the pipeline exactly as a real ISR entry point would.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use interrupt_pipeline::{CpuId, Hal, HardwareIrqNumber, HwFlags, IpiTarget, IrqNumber};

thread_local! {
    static CURRENT_CPU: Cell<usize> = Cell::new(0);
}

pub struct TestHal {
    irqs_enabled: Vec<AtomicBool>,
    pub ipi_log: Mutex<Vec<(IrqNumber, IpiTarget)>>,
}

impl TestHal {
    pub fn new(num_cpus: usize) -> Self {
        let mut irqs_enabled = Vec::with_capacity(num_cpus);
        for _ in 0..num_cpus {
            irqs_enabled.push(AtomicBool::new(true));
        }
        Self {
            irqs_enabled,
            ipi_log: Mutex::new(Vec::new()),
        }
    }

    pub fn set_current_cpu(&self, cpu: usize) {
        CURRENT_CPU.with(|c| c.set(cpu));
    }

    fn current_cpu(&self) -> usize {
        CURRENT_CPU.with(|c| c.get())
    }
}

impl Hal for TestHal {
    unsafe fn local_irq_save_hw(&self) -> HwFlags {
        let cpu = self.current_cpu();
        let prev = self.irqs_enabled[cpu].swap(false, Ordering::SeqCst);
        HwFlags(prev as usize)
    }

    unsafe fn local_irq_restore_hw(&self, flags: HwFlags) {
        let cpu = self.current_cpu();
        self.irqs_enabled[cpu].store(flags.0 != 0, Ordering::SeqCst);
    }

    unsafe fn local_irq_enable_hw(&self) {
        let cpu = self.current_cpu();
        self.irqs_enabled[cpu].store(true, Ordering::SeqCst);
    }

    unsafe fn local_irq_disable_hw(&self) {
        let cpu = self.current_cpu();
        self.irqs_enabled[cpu].store(false, Ordering::SeqCst);
    }

    fn irqs_enabled_hw(&self) -> bool {
        let cpu = self.current_cpu();
        self.irqs_enabled[cpu].load(Ordering::SeqCst)
    }

    fn processor_id(&self) -> CpuId {
        CpuId::from(self.current_cpu())
    }

    fn num_cpus(&self) -> usize {
        self.irqs_enabled.len()
    }

    fn send_ipi(&self, vector: IrqNumber, target: IpiTarget) {
        self.ipi_log.lock().unwrap().push((vector, target));
    }

    fn ack_apic(&self, _irq: HardwareIrqNumber) {}
    fn enable_vector(&self, _irq: HardwareIrqNumber) {}
    fn disable_vector(&self, _irq: HardwareIrqNumber) {}
}

pub fn root_attr() -> interrupt_pipeline::DomainAttr {
    interrupt_pipeline::DomainAttr {
        name: "root",
        domid: 0,
        priority: 0,
        sprintk: false,
        entry: None,
    }
}

pub fn head_attr(domid: u32) -> interrupt_pipeline::DomainAttr {
    interrupt_pipeline::DomainAttr {
        name: "head",
        domid,
        priority: interrupt_pipeline::HEAD_PRIORITY,
        sprintk: false,
        entry: None,
    }
}
