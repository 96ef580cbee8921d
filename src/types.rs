//! Wire types that flow through the pipeline: sampler → ring buffer →
//! resolver (§3 data model).

use arrayvec::ArrayString;

/// Upper bound on frames captured per stack, both interpreter and
/// native. Fixed so [`RawSample`] stays a POD, stack-allocatable
/// struct the signal handler can fill without touching the heap.
pub const MAX_DEPTH: usize = 128;

/// A raw, unresolved snapshot of one thread's call stack at one
/// instant. Written once by the sampler, copied into a ring buffer
/// slot by value, read once by the resolver. Never mutated after
/// being filled.
///
/// This type must stay `Copy` and free of any indirection: the POSIX
/// signal-handler variant builds one of these entirely on its own
/// stack and the ring buffer's `write` copies it field-by-field with
/// no heap traffic.
#[derive(Clone, Copy)]
pub struct RawSample {
    /// Monotonic timestamp, nanoseconds.
    pub timestamp_ns: u64,
    /// OS thread id the sample was taken on.
    pub thread_id: u64,

    pub interp_depth: usize,
    /// Code-object addresses, leaf-first, `interp_depth` valid entries.
    pub interp_code_addrs: [usize; MAX_DEPTH],
    /// Per-frame instruction-pointer addresses (or, on the Windows
    /// backend, small integer line numbers — see §4.7), parallel to
    /// `interp_code_addrs`.
    pub interp_instr_addrs: [usize; MAX_DEPTH],

    pub native_depth: usize,
    /// Native return addresses, leaf-first, `native_depth` valid
    /// entries.
    pub native_pcs: [usize; MAX_DEPTH],
}

impl Default for RawSample {
    fn default() -> Self {
        RawSample {
            timestamp_ns: 0,
            thread_id: 0,
            interp_depth: 0,
            interp_code_addrs: [0; MAX_DEPTH],
            interp_instr_addrs: [0; MAX_DEPTH],
            native_depth: 0,
            native_pcs: [0; MAX_DEPTH],
        }
    }
}

/// Threshold above which a value stored in [`RawSample::interp_instr_addrs`]
/// is treated as a real instruction-pointer address rather than a line
/// number stamped in by the Windows backend (§4.7). Any real code
/// address on every platform this crate supports is far above this.
pub const WINDOWS_LINE_NUMBER_MAX: usize = 1 << 20;

pub type ShortString = ArrayString<64>;
pub type ShortPath = ArrayString<128>;

/// One resolved stack frame.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResolvedFrame {
    pub function_name: ShortString,
    pub file_name: ShortPath,
    pub line_number: u32,
    pub is_native: bool,
}

impl ResolvedFrame {
    pub fn native(function_name: &str, file_name: &str, line_number: u32) -> Self {
        ResolvedFrame {
            function_name: ShortString::from(function_name).unwrap_or_default(),
            file_name: ShortPath::from(file_name).unwrap_or_default(),
            line_number,
            is_native: true,
        }
    }

    pub fn interpreter(function_name: &str, file_name: &str, line_number: u32) -> Self {
        ResolvedFrame {
            function_name: ShortString::from(function_name).unwrap_or_default(),
            file_name: ShortPath::from(file_name).unwrap_or_default(),
            line_number,
            is_native: false,
        }
    }
}

/// A fully resolved sample: leaf-first frames with native and
/// interpreter portions merged (§4.8 trim-and-sandwich).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResolvedSample {
    pub timestamp_ns: u64,
    pub thread_id: u64,
    pub frames: Vec<ResolvedFrame>,
}
