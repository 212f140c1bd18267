//! coursegate-core: access control, attempt lifecycle, scoring and ranking.
//!
//! This crate defines the course data model, the entity store contract and
//! the assessment engine that the coursegate CLI and host systems build on.

pub mod access;
pub mod archive;
pub mod config;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod parser;
pub mod rank;
pub mod scoring;
pub mod traits;

pub use access::{Decision, Denial, DenialCode, Entity};
pub use engine::AssessmentEngine;
pub use error::{EngineError, StoreError};
