//! Progress reporting for long running decimations.

/// Stages of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Stage {
    Init = 0,
    BuildVertices,
    BuildTriangles,
    BuildTrirefs,
    BuildQueue,
    Decimation,
    Store,
    Done,
}

const STAGES: [Stage; 8] = [
    Stage::Init,
    Stage::BuildVertices,
    Stage::BuildTriangles,
    Stage::BuildTrirefs,
    Stage::BuildQueue,
    Stage::Decimation,
    Stage::Store,
    Stage::Done,
];

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Init => "Initializing",
            Stage::BuildVertices => "Building Vertices",
            Stage::BuildTriangles => "Building Triangles",
            Stage::BuildTrirefs => "Building Trirefs",
            Stage::BuildQueue => "Building Queues",
            Stage::Decimation => "Decimating Mesh",
            Stage::Store => "Storing Geometry",
            Stage::Done => "Done",
        }
    }

    /// Share of the total progress, all weights add up to 100.
    pub fn weight(&self) -> f64 {
        match self {
            Stage::Init | Stage::Done => 0.0,
            Stage::BuildVertices => 2.0,
            Stage::BuildTriangles | Stage::BuildTrirefs => 6.0,
            Stage::BuildQueue => 8.0,
            Stage::Decimation => 75.0,
            Stage::Store => 3.0,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Stage {
        STAGES
            .get(value as usize)
            .copied()
            .unwrap_or(Stage::Done)
    }
}

/// Snapshot handed to the status callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub stage: Stage,
    pub stage_name: &'static str,
    /// Overall progress in percent.
    pub progress: f64,
    /// Triangles left in the mesh.
    pub triangle_count: usize,
}

/// Turns stage and stage progress into a monotonic overall progress.
#[derive(Debug, Default)]
pub(crate) struct StatusTracker {
    progress: f64,
}

impl StatusTracker {
    pub fn status(&mut self, stage: Stage, sub_progress: f64, triangle_count: usize) -> Status {
        let before: f64 = STAGES
            .iter()
            .take_while(|s| **s < stage)
            .map(Stage::weight)
            .sum();
        let sub = if sub_progress.is_finite() {
            sub_progress.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.progress = self.progress.max(before + sub * stage.weight());
        Status {
            stage,
            stage_name: stage.name(),
            progress: self.progress,
            triangle_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_weights_total() {
        let total: f64 = STAGES.iter().map(Stage::weight).sum();
        assert_relative_eq!(total, 100.0);
        assert_eq!(Stage::from_u8(5), Stage::Decimation);
        assert_eq!(Stage::from_u8(200), Stage::Done);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut tracker = StatusTracker::default();
        let status = tracker.status(Stage::BuildTriangles, 0.5, 10);
        assert_relative_eq!(status.progress, 5.0);
        assert_eq!(status.stage_name, "Building Triangles");

        let status = tracker.status(Stage::Decimation, 0.5, 6);
        assert_relative_eq!(status.progress, 22.0 + 37.5);

        // a smaller sample never moves progress backwards
        let status = tracker.status(Stage::Decimation, 0.1, 6);
        assert_relative_eq!(status.progress, 59.5);

        let status = tracker.status(Stage::Done, 0.0, 4);
        assert_relative_eq!(status.progress, 100.0);
    }
}
