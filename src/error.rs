use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("trail field is {allocated_width}x{allocated_height} but agent data expects {width}x{height}")]
    FieldSizeMismatch {
        allocated_width: u32,
        allocated_height: u32,
        width: i32,
        height: i32,
    },

    #[error("agent buffer holds {actual} agents, expected {expected}")]
    AgentCountMismatch { expected: usize, actual: usize },

    #[error("agent in slot {slot} carries index {index}")]
    AgentIndexMismatch { slot: usize, index: i32 },

    #[error("layout of {record} differs between host and shader: {detail}")]
    LayoutMismatch { record: &'static str, detail: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("shader {name} is invalid: {message}")]
    Shader { name: &'static str, message: String },

    #[error("no compatible GPU adapter found")]
    NoAdapter,

    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    #[error("buffer map failed: {0}")]
    BufferMap(#[from] wgpu::BufferAsyncError),

    #[error("buffer map callback was dropped")]
    MapCancelled,
}
