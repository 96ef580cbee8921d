//! Core of a sampling profiler for a bytecode-interpreted language
//! runtime.
//!
//! This crate is the engine only: a lock-free ring buffer, an
//! async-signal-safe frame walker, the three platform sampler
//! backends, the code-object registry and the resolver. CLI,
//! configuration-file parsing, and output-file writers for the
//! flame-graph JSON / collapsed-stack formats are external
//! collaborators (§1) built against [`Profiler`] and [`ResolvedSample`].

pub mod code_registry;
pub mod config;
pub mod error;
pub mod facade;
pub mod frame_walker;
pub mod native_unwinder;
pub mod resolver;
pub mod ring_buffer;
pub mod sampler;
pub mod stats;
pub mod types;

pub use code_registry::{CodeRegistry, ValidationOutcome};
pub use config::Config;
pub use error::{Error, Result};
pub use facade::{GcEpochAccessor, ProfileBatch, Profiler};
pub use resolver::RuntimeLibraryRange;
pub use sampler::ThreadStateAccessor;
pub use stats::{Stats, StatisticsCounters};
pub use types::{RawSample, ResolvedFrame, ResolvedSample, MAX_DEPTH};
