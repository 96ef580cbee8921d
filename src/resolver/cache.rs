//! 4-way set-associative pseudo-LRU resolution cache (§4.8, P2).
//!
//! 1024 sets × 4 ways = 4096 resident entries, matching the spec's
//! hard cap on unique keys. Replacement state is a 3-bit tree per set
//! rather than a timestamp or access-order list, so an access or
//! eviction is three branch-free bit flips rather than a scan.

use crate::types::ResolvedFrame;

const SET_COUNT: usize = 1024;
const WAYS: usize = 4;

/// Golden-ratio multiplicative hash (Knuth), mixing the address's high
/// and low 32 bits before masking down to a set index.
fn set_index(key: usize) -> usize {
    let lo = key as u32;
    let hi = (key >> 32) as u32;
    let mixed = lo ^ hi.rotate_left(16);
    let hashed = mixed.wrapping_mul(0x9E37_79B9);
    (hashed as usize) & (SET_COUNT - 1)
}

#[derive(Clone)]
struct Way {
    key: Option<usize>,
    frame: ResolvedFrame,
}

impl Default for Way {
    fn default() -> Self {
        Way {
            key: None,
            frame: ResolvedFrame::native("", "", 0),
        }
    }
}

/// One set: 4 ways plus a 3-bit pseudo-LRU tree.
///
/// Bit layout, matching a standard binary pseudo-LRU tree over 4
/// ways: bit 0 picks the root's direction (0 → ways[0..2], 1 →
/// ways[2..4]); bit 1 picks within ways[0..2]; bit 2 picks within
/// ways[2..4]. On access to way `w`, the bits along the path to `w`
/// are set to point *away* from it.
#[derive(Default)]
struct Set {
    ways: [Way; WAYS],
    plru: u8,
}

impl Set {
    fn find(&self, key: usize) -> Option<usize> {
        self.ways.iter().position(|w| w.key == Some(key))
    }

    fn touch(&mut self, way: usize) {
        match way {
            0 => self.plru |= 0b011,
            1 => {
                self.plru |= 0b001;
                self.plru &= !0b010;
            }
            2 => {
                self.plru &= !0b001;
                self.plru |= 0b100;
            }
            3 => self.plru &= !0b101,
            _ => unreachable!(),
        }
    }

    fn victim(&self) -> usize {
        if self.plru & 0b001 == 0 {
            if self.plru & 0b010 == 0 {
                0
            } else {
                1
            }
        } else if self.plru & 0b100 == 0 {
            2
        } else {
            3
        }
    }

    fn insert(&mut self, key: usize, frame: ResolvedFrame) -> usize {
        if let Some(way) = self.ways.iter().position(|w| w.key.is_none()) {
            self.ways[way] = Way {
                key: Some(key),
                frame,
            };
            return way;
        }
        let way = self.victim();
        self.ways[way] = Way {
            key: Some(key),
            frame,
        };
        way
    }
}

/// Outcome of a cache lookup, distinguishing a hit from a miss so
/// callers can track P2's `cache_hits + cache_misses = total requests`.
pub enum Lookup {
    Hit(ResolvedFrame),
    Miss,
}

pub struct ResolutionCache {
    sets: Vec<Set>,
}

impl Default for ResolutionCache {
    fn default() -> Self {
        ResolutionCache::new()
    }
}

impl ResolutionCache {
    pub fn new() -> Self {
        let mut sets = Vec::with_capacity(SET_COUNT);
        sets.resize_with(SET_COUNT, Set::default);
        ResolutionCache { sets }
    }

    pub fn get(&mut self, key: usize) -> Lookup {
        let set = &mut self.sets[set_index(key)];
        match set.find(key) {
            Some(way) => {
                set.touch(way);
                Lookup::Hit(set.ways[way].frame.clone())
            }
            None => Lookup::Miss,
        }
    }

    /// Inserts or updates `key`; always called after a miss resolves
    /// from the code registry. Evicts the pseudo-LRU way when the set
    /// is full.
    pub fn insert(&mut self, key: usize, frame: ResolvedFrame) {
        let set = &mut self.sets[set_index(key)];
        if let Some(way) = set.find(key) {
            set.ways[way].frame = frame;
            set.touch(way);
            return;
        }
        let way = set.insert(key, frame);
        set.touch(way);
    }

    /// Number of unique keys resident, for asserting the P2 bound.
    pub fn resident_count(&self) -> usize {
        self.sets
            .iter()
            .map(|s| s.ways.iter().filter(|w| w.key.is_some()).count())
            .sum()
    }
}
