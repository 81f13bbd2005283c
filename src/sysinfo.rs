//! `sysinfo`: number of CPUs, cpu frequency, tick-irq, timer frequency
//! (spec.md §6).

use crate::hal::HardwareIrqNumber;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy)]
pub struct SysInfo {
    pub num_cpus: usize,
    pub cpu_frequency_hz: u64,
    pub tick_irq: Option<HardwareIrqNumber>,
    pub timer_frequency_hz: u64,
}

impl SysInfo {
    pub fn gather<const N: usize>(pipeline: &Pipeline<N>) -> Self {
        Self {
            num_cpus: pipeline.num_cpus(),
            cpu_frequency_hz: pipeline.hal.cpu_frequency_hz(),
            tick_irq: pipeline.hal.tick_irq(),
            timer_frequency_hz: pipeline.hal.timer_frequency_hz(),
        }
    }
}
