//! The single-stage update algorithms.
//!
//! A production runs in three passes: instruction generation (a simultaneous
//! scan of prior key mappings and incoming source updates, §`generate`),
//! instruction execution against the prior version's streams (§`execute`),
//! and delta derivation (§`delta`). `sources` assembles the ordered input of
//! a stage from several upstream feeders.

pub mod delta;
pub mod execute;
pub mod generate;
pub mod sources;

pub use delta::{dedupe_updates, DeltaDedup, DeltaState};
pub use execute::{execute_content_instructions, execute_mapping_instructions, DeltaSink};
pub use generate::{generate_instructions, ProducedRows, SourceValues};
pub use sources::{merge_sources, UpdateSource};
