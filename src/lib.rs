//! Per-voxel uncertainty sampling and aggregation for neural radiance fields.
//!
//! A trained MLP predicts color, density and uncertainty in one forward pass.
//! This crate queries it along camera rays (hierarchical sampling plus volume
//! rendering) and over regular grids, and aggregates the voxels into
//! transfer-function statistics.

pub mod camera;
pub mod config;
pub mod encoding;
pub mod error;
pub mod export;
pub mod field;
pub mod grid;
pub mod integrator;
pub mod network;
pub mod render;
pub mod sampler;
pub mod stats;
pub mod vec3;
pub mod weights;

pub use camera::{Camera, CameraView, Ray};
pub use config::{GridConfig, HeatmapConfig, ModelConfig, NerfConfig, SamplingConfig, ValueAxis};
pub use error::{NerfError, Result};
pub use field::{ConstantField, FieldEvaluator, FieldOutput, NeuralField, RadianceField};
pub use grid::{GridSpec, Voxel, VoxelVolume};
pub use integrator::{Compositor, RayAccumulation};
pub use render::{RayRender, Renderer, ValidationImage, VoxelSweep};
pub use sampler::Sampler;
pub use stats::{BinRow, RunningStat, TransferFunctionTable};
pub use vec3::Vec3;
