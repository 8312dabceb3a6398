//! Multi threaded quadric error mesh decimation.
//!
//! Edge collapses run concurrently on worker threads that share one
//! mesh, each worker draining its own cost ordered queue under a cost
//! ceiling raised in sync steps.
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod barrier;
mod binsort;
mod build;
mod collapse;
mod edge_hash;
mod lock;
mod normals;
mod op;
mod penalty;
mod topology;
mod worker;

pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod mesh;
pub mod quadric;
pub mod status;

pub use config::{strength_to_max_cost, DecimationConfig, Flags};
pub use engine::{
    decimate, DecimationReport, IndexBuffer, NormalBuffer, Operation, TriangleData,
    VertexAttributes, VertexBuffer,
};
pub use error::{DecimateError, DecimateResult};
pub use format::{BufferRole, ScalarFormat};
pub use mesh::Trimesh;
pub use status::{Stage, Status};
pub use worker::EdgeWeightFn;
