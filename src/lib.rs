//! A host-agnostic interrupt pipeline core: a priority-ordered chain of
//! "domains" multiplexing hardware IRQs, software events, and virtual IRQs
//! across CPUs, each domain free to stall/unstall its own view of the
//! interrupt stream independently of the others (spec.md §1).
//!
//! This crate owns none of the arch-specific plumbing (vector tables, APIC
//! programming, trap frames): a hosting kernel supplies that through
//! [`hal::Hal`]. What lives here is the dispatch core: [`pipeline::Pipeline`]
//! holds the domain list and per-CPU state, [`dispatch::Dispatcher`] walks it
//! on every IRQ/event, [`critical::CriticalSection`] provides the
//! whole-machine rendezvous primitive.
//!
//! `no_std` except under `#[cfg(test)]`, mirroring the teacher's
//! `kernel/crates/crc` hosting pattern so the same source builds both for a
//! real kernel and for `cargo test` on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod libs;

pub mod critical;
pub mod dispatch;
pub mod domain;
pub mod fixup;
pub mod hal;
pub mod irqlog;
pub mod percpu;
pub mod pipeline;
pub mod ptd;
pub mod stall;
pub mod sysinfo;
pub mod virq;

pub use critical::{CriticalGuard, CriticalSection};
pub use dispatch::Dispatcher;
pub use domain::{
    Domain, DomainAttr, DomainFlags, DomainSnapshot, EventHandlerFn, HandlerSpec, IrqControl,
    IrqHandlerFn, HEAD_PRIORITY, ROOT_SLOT,
};
pub use hal::{CpuId, Hal, HardwareIrqNumber, HwFlags, IpiTarget, IrqNumber};
pub use pipeline::Pipeline;
pub use ptd::{PtdTable, ROOT_NPTDKEYS};
pub use sysinfo::SysInfo;
pub use virq::VirqAllocator;

pub use pipeline_error::PipelineError;
