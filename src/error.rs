//! Error types for decimation requests.

use thiserror::Error;

use crate::format::{BufferRole, ScalarFormat};

/// Reasons a decimation request is rejected before any work is done.
#[derive(Debug, Error)]
pub enum DecimateError {
    /// Fewer triangles than a collapse needs.
    #[error("Mesh needs at least 2 triangles, got {0}")]
    TooFewTriangles(usize),

    /// Format not accepted for a buffer.
    #[error("Format {format:?} is not supported for {role} buffers")]
    UnsupportedFormat {
        role: BufferRole,
        format: ScalarFormat,
    },

    /// Stride shorter than one element.
    #[error("Stride {stride} is too small for {role} elements of {element} bytes")]
    InvalidStride {
        role: BufferRole,
        stride: usize,
        element: usize,
    },

    /// Buffer does not hold every element it claims to.
    #[error("{role} buffer holds {actual} bytes but {needed} are required")]
    BufferTooSmall {
        role: BufferRole,
        needed: usize,
        actual: usize,
    },

    /// Triangle refers past the vertex count.
    #[error("Triangle {triangle} references vertex {index} of {vertex_count}")]
    IndexOutOfRange {
        triangle: usize,
        index: i64,
        vertex_count: usize,
    },

    /// More elements than 32 bit mesh indices can address.
    #[error("Mesh with {vertex_count} vertices and {triangle_count} triangles is too large")]
    MeshTooLarge {
        vertex_count: usize,
        triangle_count: usize,
    },

    /// Edge index cannot fit the memory ceiling at any usable size.
    #[error("Edge index needs {required} bytes, budget is {budget}")]
    MemoryBudget { required: usize, budget: usize },
}

/// Result type for decimation operations.
pub type DecimateResult<T> = std::result::Result<T, DecimateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecimateError::TooFewTriangles(1);
        assert_eq!(format!("{err}"), "Mesh needs at least 2 triangles, got 1");

        let err = DecimateError::UnsupportedFormat {
            role: BufferRole::Vertex,
            format: ScalarFormat::U8,
        };
        assert!(format!("{err}").contains("vertex"));

        let err = DecimateError::MemoryBudget {
            required: 4096,
            budget: 1024,
        };
        assert!(format!("{err}").contains("4096"));
    }
}
