//! Registry that makes a code-object address captured at time T0 safe
//! (or provably unsafe) to dereference at resolve time T1 > T0 (§4.4).
//!
//! Two capture modes coexist:
//!
//! - **Strong-pin**: used whenever the sampler holds the runtime lock
//!   (the Darwin/Mach path, and any resolver-driven lookup). `add_ref`
//!   retains the object; the registry guarantees it cannot be
//!   collected while a strong reference is outstanding (§I2).
//! - **Best-effort**: signal-handler captures cannot take the runtime
//!   lock and so cannot pin anything; no entry is ever created for
//!   these addresses, and [`CodeRegistry::validate`] falls back to a
//!   type-descriptor check supplied by the caller.

use std::collections::HashMap;
use std::mem::align_of;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Null,
    Freed,
    WrongType,
    StaleGc,
    NotHeld,
}

impl ValidationOutcome {
    pub fn is_valid(self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

struct Entry {
    refcount: u32,
    pinned: bool,
    gc_epoch: u64,
}

#[derive(Default)]
pub struct CodeRegistry {
    table: Mutex<HashMap<usize, Entry>>,
}

fn is_plausible_addr(addr: usize) -> bool {
    addr >= 0x1000 && addr % align_of::<usize>() == 0
}

impl CodeRegistry {
    pub fn new() -> Self {
        CodeRegistry {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Strong-pin capture. Must only be called while the caller holds
    /// the runtime lock and has already verified `addr` points at a
    /// code object of the expected type.
    pub fn add_ref(&self, addr: usize, gc_epoch: u64) {
        let mut table = self.table.lock().unwrap();
        table
            .entry(addr)
            .and_modify(|e| e.refcount += 1)
            .or_insert(Entry {
                refcount: 1,
                pinned: true,
                gc_epoch,
            });
    }

    /// Releases one reference; the entry (and the implied strong
    /// reference) is dropped once the refcount reaches zero.
    pub fn release_ref(&self, addr: usize) {
        let mut table = self.table.lock().unwrap();
        if let Some(entry) = table.get_mut(&addr) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                table.remove(&addr);
            }
        }
    }

    pub fn release_ref_batch(&self, addrs: &[usize]) {
        for &addr in addrs {
            self.release_ref(addr);
        }
    }

    /// Entries currently retaining a strong reference. Exposed for
    /// tests asserting P3 (refcounts balance back to zero).
    pub fn live_entry_count(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    /// Validates `addr` for resolution, per §4.4. `type_matches` is
    /// only invoked when a type-descriptor check is actually needed
    /// (never for a pinned hit), so it can safely dereference `addr`
    /// under the runtime lock.
    pub fn validate(
        &self,
        addr: usize,
        current_gc_epoch: u64,
        safe_mode: bool,
        type_matches: impl FnOnce() -> bool,
    ) -> ValidationOutcome {
        if !is_plausible_addr(addr) {
            return ValidationOutcome::Null;
        }

        let table = self.table.lock().unwrap();
        match table.get(&addr) {
            Some(entry) if entry.pinned && entry.refcount > 0 => ValidationOutcome::Valid,
            Some(entry) if entry.pinned => ValidationOutcome::Freed,
            Some(entry) => {
                if entry.gc_epoch == current_gc_epoch {
                    ValidationOutcome::Valid
                } else if safe_mode {
                    ValidationOutcome::StaleGc
                } else if type_matches() {
                    ValidationOutcome::Valid
                } else {
                    ValidationOutcome::WrongType
                }
            }
            None => {
                if safe_mode {
                    ValidationOutcome::NotHeld
                } else if type_matches() {
                    ValidationOutcome::Valid
                } else {
                    ValidationOutcome::WrongType
                }
            }
        }
    }
}
