//! C2 — hierarchical pending-IRQ bitmap.
//!
//! One `IrqLog` backs a single (cpu, domain) pair's `irqpend_*` and
//! `irqheld_map` from spec.md §3/§4.1. Two levels (`lomap` + `himap`) by
//! default, three (`lomap` + `mdmap` + `himap`) under the
//! `three-level-bitmap` feature, raising the addressable vector count from
//! 4096 (64 × 64) to 262144 (64 × 64 × 64).
//!
//! `IrqLog` itself does not know about domains, control bits, or LOCK —
//! whether a vector goes to `lomap` or `irqheld_map` is the caller's
//! decision (it already has the domain's control bits in hand); see
//! [`crate::percpu::PerCpuDomainState::set_pending`].

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

fn word_count(bits: usize) -> usize {
    (bits + WORD_BITS - 1) / WORD_BITS
}

/// Bits `>= from` set, for masking a summary word down to the range covered
/// by virtual IRQs when `next_pending(dovirt = true)`.
fn low_mask(from: usize) -> u64 {
    if from == 0 {
        !0u64
    } else if from >= WORD_BITS {
        0
    } else {
        !0u64 << from
    }
}

struct Level {
    words: Vec<AtomicU64>,
}

impl Level {
    fn new(bits: usize) -> Self {
        let n = word_count(bits).max(1);
        let mut words = Vec::with_capacity(n);
        for _ in 0..n {
            words.push(AtomicU64::new(0));
        }
        Self { words }
    }

    /// Sets `bit` in `word`; returns the word's previous value so the caller
    /// can detect the 0→nonzero transition and cascade.
    fn set(&self, word: usize, bit: usize) -> u64 {
        self.words[word].fetch_or(1 << bit, Ordering::SeqCst)
    }

    /// Clears `bit` in `word`; returns the word's previous value so the
    /// caller can detect the nonzero→0 transition and cascade.
    fn clear(&self, word: usize, bit: usize) -> u64 {
        self.words[word].fetch_and(!(1 << bit), Ordering::SeqCst)
    }

    fn load(&self, word: usize) -> u64 {
        self.words[word].load(Ordering::SeqCst)
    }
}

/// The hierarchical pending-IRQ bitmap described in spec.md §4.1.
pub struct IrqLog {
    nr_irqs: usize,
    first_virq: usize,
    lomap: Level,
    #[cfg(feature = "three-level-bitmap")]
    mdmap: Level,
    himap: AtomicU64,
    held: Level,
    irqall: Vec<AtomicU64>,
}

impl IrqLog {
    /// `first_virq` is the lowest vector number considered a virtual IRQ;
    /// used to mask `next_pending(dovirt = true)` down to that range.
    pub fn new(nr_irqs: usize, first_virq: usize) -> Self {
        assert!(nr_irqs > 0, "IrqLog needs at least one vector");
        #[cfg(not(feature = "three-level-bitmap"))]
        assert!(
            word_count(nr_irqs) <= WORD_BITS,
            "nr_irqs exceeds the two-level bitmap's addressable range; enable \
             the three-level-bitmap feature"
        );
        #[cfg(feature = "three-level-bitmap")]
        assert!(
            word_count(word_count(nr_irqs)) <= WORD_BITS,
            "nr_irqs exceeds the three-level bitmap's addressable range"
        );
        Self {
            nr_irqs,
            first_virq,
            lomap: Level::new(nr_irqs),
            #[cfg(feature = "three-level-bitmap")]
            mdmap: Level::new(word_count(nr_irqs)),
            himap: AtomicU64::new(0),
            held: Level::new(nr_irqs),
            irqall: (0..nr_irqs).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn nr_irqs(&self) -> usize {
        self.nr_irqs
    }

    fn split(irq: usize) -> (usize, usize) {
        (irq / WORD_BITS, irq % WORD_BITS)
    }

    /// Sets `irq` pending (or held, if `locked`). Always bumps `irqall`.
    /// Returns whether the vector transitioned from not-pending to pending
    /// (false if it went to `held` instead, or was already set).
    pub fn set_pending(&self, irq: usize, locked: bool) -> bool {
        debug_assert!(irq < self.nr_irqs);
        self.irqall[irq].fetch_add(1, Ordering::Relaxed);
        if locked {
            let (word, bit) = Self::split(irq);
            self.held.set(word, bit);
            return false;
        }
        self.raise(irq)
    }

    fn raise(&self, irq: usize) -> bool {
        let (word, bit) = Self::split(irq);
        let prev_lo = self.lomap.set(word, bit);
        if prev_lo & (1 << bit) != 0 {
            return false;
        }
        self.cascade_set(word);
        true
    }

    #[cfg(not(feature = "three-level-bitmap"))]
    fn cascade_set(&self, lo_word: usize) {
        self.himap.fetch_or(1 << lo_word, Ordering::SeqCst);
    }

    #[cfg(feature = "three-level-bitmap")]
    fn cascade_set(&self, lo_word: usize) {
        let (md_word, md_bit) = Self::split(lo_word);
        let prev_md = self.mdmap.set(md_word, md_bit);
        if prev_md & (1 << md_bit) == 0 {
            self.himap.fetch_or(1 << md_word, Ordering::SeqCst);
        }
    }

    fn lower(&self, irq: usize) {
        let (word, bit) = Self::split(irq);
        let prev_lo = self.lomap.clear(word, bit);
        if prev_lo & (1 << bit) != 0 && prev_lo == (1 << bit) {
            self.cascade_clear(word);
        }
    }

    #[cfg(not(feature = "three-level-bitmap"))]
    fn cascade_clear(&self, lo_word: usize) {
        self.himap.fetch_and(!(1 << lo_word), Ordering::SeqCst);
    }

    #[cfg(feature = "three-level-bitmap")]
    fn cascade_clear(&self, lo_word: usize) {
        let (md_word, md_bit) = Self::split(lo_word);
        let prev_md = self.mdmap.clear(md_word, md_bit);
        if prev_md != 0 && prev_md == (1 << md_bit) {
            self.himap.fetch_and(!(1 << md_word), Ordering::SeqCst);
        }
    }

    /// Moves `irq` from pending to held (invariant 4: mutually exclusive).
    /// Returns whether it had in fact been pending.
    pub fn move_to_held(&self, irq: usize) -> bool {
        debug_assert!(irq < self.nr_irqs);
        let (word, bit) = Self::split(irq);
        let was_pending = self.lomap.load(word) & (1 << bit) != 0;
        if was_pending {
            self.lower(irq);
        }
        self.held.set(word, bit);
        was_pending
    }

    /// Moves `irq` from held back to pending, if it was held.
    pub fn restore_from_held(&self, irq: usize) -> bool {
        debug_assert!(irq < self.nr_irqs);
        let (word, bit) = Self::split(irq);
        let prev_held = self.held.clear(word, bit);
        let was_held = prev_held & (1 << bit) != 0;
        if was_held {
            self.raise(irq);
        }
        was_held
    }

    pub fn is_held(&self, irq: usize) -> bool {
        let (word, bit) = Self::split(irq);
        self.held.load(word) & (1 << bit) != 0
    }

    pub fn is_pending(&self, irq: usize) -> bool {
        let (word, bit) = Self::split(irq);
        self.lomap.load(word) & (1 << bit) != 0
    }

    pub fn irqall(&self, irq: usize) -> u64 {
        self.irqall[irq].load(Ordering::Relaxed)
    }

    /// Non-consuming O(1) check: anything at all pending in this log.
    pub fn has_any_pending(&self) -> bool {
        self.himap.load(Ordering::SeqCst) != 0
    }

    fn virt_himap_floor(&self) -> usize {
        #[cfg(feature = "three-level-bitmap")]
        {
            self.first_virq / (WORD_BITS * WORD_BITS)
        }
        #[cfg(not(feature = "three-level-bitmap"))]
        {
            self.first_virq / WORD_BITS
        }
    }

    /// Returns and clears the lowest-numbered pending vector, or `None` if
    /// nothing is pending. Restricted to the virtual-IRQ range when `dovirt`.
    pub fn next_pending(&self, dovirt: bool) -> Option<u32> {
        let hi_mask = if dovirt {
            low_mask(self.virt_himap_floor())
        } else {
            !0u64
        };
        let hi = self.himap.load(Ordering::SeqCst) & hi_mask;
        if hi == 0 {
            return None;
        }
        let hi_idx = hi.trailing_zeros() as usize;

        #[cfg(feature = "three-level-bitmap")]
        let lo_word = {
            let md_mask = if dovirt && hi_idx == self.virt_himap_floor() {
                low_mask((self.first_virq / WORD_BITS) % WORD_BITS)
            } else {
                !0u64
            };
            let md = self.mdmap.load(hi_idx) & md_mask;
            debug_assert!(md != 0, "himap bit set with no mdmap bit behind it");
            hi_idx * WORD_BITS + md.trailing_zeros() as usize
        };
        #[cfg(not(feature = "three-level-bitmap"))]
        let lo_word = hi_idx;

        let lo_mask = if dovirt && lo_word == self.first_virq / WORD_BITS {
            low_mask(self.first_virq % WORD_BITS)
        } else {
            !0u64
        };
        let lo = self.lomap.load(lo_word) & lo_mask;
        debug_assert!(lo != 0, "summary bit set with no lomap bit behind it");
        let bit = lo.trailing_zeros() as usize;
        let irq = lo_word * WORD_BITS + bit;

        self.lower(irq);
        Some(irq as u32)
    }
}
