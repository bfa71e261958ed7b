//! Checkpoint orchestration.
//!
//! Covers the per-unit checkpoint workers, the child registry, the
//! supervisor's session entry point, dataspace translation, the
//! capability mapper, and the pause/checkpoint/resume cycle.

pub mod cap_mapper;
pub mod checkpointer;
pub mod registry;
pub mod supervisor;
pub mod translation;
pub mod worker;
