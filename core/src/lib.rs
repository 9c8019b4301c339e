//! Core types shared by the HEGN crates
//!
//! - equivariant feature tensors (`[B, C, 3, ...]` ndarrays) and their helpers
//! - point clouds, point batches and index-aligned X/Y pairs
//! - similarity transforms, rotations and the chamfer distance
//! - dataset and augmentation contracts
//! - shape tracing and thread-pool runtime

pub mod dataset;
pub mod geometry;
pub mod paired;
pub mod point_cloud;
pub mod runtime;
pub mod tensor;
pub mod trace;
pub mod transforms;

pub use dataset::{InMemoryDataset, RegistrationBatch, RegistrationDataset, RegistrationSample};
pub use geometry::{chamfer_distance, rotation_about_axis, PointIndex, Similarity};
pub use paired::{PairedBatch, PairedFeatures};
pub use point_cloud::{PointBatch, PointCloud};
pub use runtime::{init_global_thread_pool, Device};
pub use tensor::{FeatureShape, EPS, VECTOR_AXIS};
pub use trace::{NoopTracer, RecordingTracer, ShapeTracer, TracingTracer};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Numerical error: {0}")]
    NumericalError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
