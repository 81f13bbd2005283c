//! Error type shared by every pipeline crate.
//!
//! Mirrors the shape of the teacher kernel's `system_error` crate: a small,
//! dependency-free, `Copy` error enum that every fallible core operation
//! returns instead of panicking. See spec.md §7.

#![cfg_attr(not(test), no_std)]

use core::fmt;

/// Error kinds returned by the pipeline core.
///
/// These are exactly the kinds enumerated in spec.md §7, plus `Again` for
/// the superlock contention retry the original implementation signals with
/// `-EAGAIN` from `ipipe_virtualize_irq()`-style calls (see SPEC_FULL.md §B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineError {
    /// Bad irq/event/key/priority argument.
    InvalidArgument,
    /// Caller is not ROOT, or attempted a cross-domain enable.
    NotPermitted,
    /// HEAD slot or an exclusive handler is already taken, or `domid` collides.
    Busy,
    /// No free domain slots remain.
    NoSlots,
    /// The referenced virq/handler was never allocated.
    NotFound,
    /// The operation would block on a superlock already held elsewhere; retry.
    Again,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PipelineError::InvalidArgument => "invalid argument",
            PipelineError::NotPermitted => "operation not permitted",
            PipelineError::Busy => "resource busy",
            PipelineError::NoSlots => "no free domain slots",
            PipelineError::NotFound => "not found",
            PipelineError::Again => "try again",
        };
        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_non_empty_for_every_variant() {
        let variants = [
            PipelineError::InvalidArgument,
            PipelineError::NotPermitted,
            PipelineError::Busy,
            PipelineError::NoSlots,
            PipelineError::NotFound,
            PipelineError::Again,
        ];
        for v in variants {
            assert!(!format!("{}", v).is_empty());
        }
    }
}
