//! Shared data layout and frame pipeline for a GPU slime mold simulation.
//!
//! The host records in [`layout`] are the single source of truth for what the
//! shaders see. Their WGSL declarations are generated from the Rust types and
//! checked against the shader compiler's own layout before any GPU work starts.

pub mod agents;
pub mod config;
pub mod constants;
pub mod error;
pub mod field;
pub mod frame;
pub mod layout;
pub mod shader;

pub use config::{SessionConfig, Toggle};
pub use error::{Error, Result};
pub use field::TrailField;
pub use frame::{AgentStep, FramePlan, Simulation};
pub use layout::{Agent, AgentData, Float2, ShaderOptions, Vertex, SCHEMA_REVISION};
