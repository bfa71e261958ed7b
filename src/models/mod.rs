//! Domain model module declarations.

pub mod capability;
pub mod records;
pub mod report;
pub mod session;
pub mod translation;

pub use capability::{Badge, Kcap};
pub use records::Stored;
