//! Tunables for a decimation run.

use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

/// Option bits of a decimation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(u32);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Recompute invalidated candidates on every iteration instead of only
    /// at sync points.
    pub const CONTINUOUS_UPDATE: Flags = Flags(0x1);
    /// Keep unused vertex slots in the output instead of packing.
    pub const NO_VERTEX_PACKING: Flags = Flags(0x2);
    /// Split vertices whose fan normals diverge when rebuilding normals.
    pub const NORMAL_VERTEX_SPLITTING: Flags = Flags(0x4);
    pub const TRIANGLE_WINDING_CW: Flags = Flags(0x8);
    pub const TRIANGLE_WINDING_CCW: Flags = Flags(0x10);
    /// Only rebuild normals and pack.
    pub const NO_DECIMATION: Flags = Flags(0x20);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Flags {
        Flags(bits)
    }

    pub const fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

const MAX_SYNC_STEPS: usize = 1024;
const MAX_THREADS: usize = 64;
/// Triangles per worker thread before another thread is worth spawning.
const TRIANGLES_PER_THREAD: usize = 1024;
const MIN_STATUS_INTERVAL: Duration = Duration::from_millis(10);
const MAX_NORMAL_SEARCH_COS: f64 = 0.9;

/// Map a user facing strength in `[0, 1]` to the collapse cost ceiling.
pub fn strength_to_max_cost(strength: f64) -> f64 {
    (strength * 0.25).powi(6)
}

/// Advanced decimation settings.
#[derive(Debug, Clone)]
pub struct DecimationConfig {
    /// Compactness below which a collapse starts paying a penalty.
    /// Default: 0.25
    pub compactness_target: f64,

    /// Weight of the compactness penalty. Default: 0.00125
    pub compactness_penalty: f64,

    /// Quadric weight of open boundary edges. Default: 5.0
    pub boundary_weight: f64,

    /// Number of cost ceiling rounds. Default: 32
    pub sync_step_count: usize,

    /// Angle in degrees beyond which fan normals are split. Default: 45
    pub normal_search_angle: f64,

    /// Memory ceiling for the edge index plus mesh arrays, `None` for no
    /// limit.
    pub max_memory: Option<usize>,

    /// Worker threads, `None` for one per available core.
    pub thread_count: Option<usize>,

    /// How often the status callback fires. Default: 100ms
    pub status_interval: Duration,

    pub flags: Flags,
}

impl Default for DecimationConfig {
    fn default() -> Self {
        Self {
            compactness_target: 0.25,
            compactness_penalty: 0.00125,
            boundary_weight: 5.0,
            sync_step_count: 32,
            normal_search_angle: 45.0,
            max_memory: None,
            thread_count: None,
            status_interval: Duration::from_millis(100),
            flags: Flags::NONE,
        }
    }
}

impl DecimationConfig {
    #[must_use]
    pub const fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub const fn with_thread_count(mut self, threads: usize) -> Self {
        self.thread_count = Some(threads);
        self
    }

    #[must_use]
    pub const fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    #[must_use]
    pub const fn with_boundary_weight(mut self, weight: f64) -> Self {
        self.boundary_weight = weight;
        self
    }

    #[must_use]
    pub const fn with_sync_step_count(mut self, steps: usize) -> Self {
        self.sync_step_count = steps;
        self
    }

    #[must_use]
    pub const fn with_compactness(mut self, target: f64, penalty: f64) -> Self {
        self.compactness_target = target;
        self.compactness_penalty = penalty;
        self
    }

    #[must_use]
    pub const fn with_normal_search_angle(mut self, degrees: f64) -> Self {
        self.normal_search_angle = degrees;
        self
    }

    #[must_use]
    pub const fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Worker count for a mesh of `triangle_count` triangles.
    pub fn resolve_threads(&self, triangle_count: usize) -> usize {
        let requested = match self.thread_count {
            Some(n) if n > 0 => n,
            _ => rayon::current_num_threads().max(1),
        };
        let cap = (triangle_count / TRIANGLES_PER_THREAD).clamp(1, MAX_THREADS);
        requested.min(cap)
    }

    /// Values clamped into their working ranges.
    pub(crate) fn settings(&self, max_cost: f64) -> Settings {
        Settings {
            max_cost,
            compactness_target: self.compactness_target,
            compactness_penalty: self.compactness_penalty,
            boundary_weight: self.boundary_weight,
            sync_steps: self.sync_step_count.clamp(1, MAX_SYNC_STEPS),
            normal_search_cos: self
                .normal_search_angle
                .to_radians()
                .cos()
                .min(MAX_NORMAL_SEARCH_COS),
            status_interval: self.status_interval.max(MIN_STATUS_INTERVAL),
            flags: self.flags,
        }
    }
}

/// Configuration as the engine consumes it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings {
    pub max_cost: f64,
    pub compactness_target: f64,
    pub compactness_penalty: f64,
    pub boundary_weight: f64,
    pub sync_steps: usize,
    pub normal_search_cos: f64,
    pub status_interval: Duration,
    pub flags: Flags,
}

impl Settings {
    pub fn decimate(&self) -> bool {
        !self.flags.contains(Flags::NO_DECIMATION)
    }

    pub fn continuous(&self) -> bool {
        self.flags.contains(Flags::CONTINUOUS_UPDATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_config() {
        let config = DecimationConfig::default();
        assert_relative_eq!(config.compactness_target, 0.25);
        assert_relative_eq!(config.boundary_weight, 5.0);
        assert_eq!(config.sync_step_count, 32);
        assert_eq!(config.flags, Flags::NONE);
    }

    #[test]
    fn test_strength_mapping() {
        assert_relative_eq!(strength_to_max_cost(0.0), 0.0);
        assert_relative_eq!(strength_to_max_cost(1.0), 0.25f64.powi(6));
        assert!(strength_to_max_cost(0.5) < strength_to_max_cost(0.6));
    }

    #[test]
    fn test_flags() {
        let flags = Flags::CONTINUOUS_UPDATE | Flags::NO_DECIMATION;
        assert!(flags.contains(Flags::NO_DECIMATION));
        assert!(!flags.contains(Flags::NO_VERTEX_PACKING));
        assert_eq!(flags.bits(), 0x21);
    }

    #[test]
    fn test_thread_resolution() {
        let config = DecimationConfig::default().with_thread_count(16);
        assert_eq!(config.resolve_threads(10), 1);
        assert_eq!(config.resolve_threads(4096), 4);
        assert_eq!(config.resolve_threads(10_000_000), 16);
        let config = DecimationConfig::default().with_thread_count(200);
        assert_eq!(config.resolve_threads(10_000_000), 64);
    }

    #[test]
    fn test_settings_clamp() {
        let settings = DecimationConfig::default()
            .with_sync_step_count(0)
            .with_normal_search_angle(10.0)
            .with_status_interval(Duration::ZERO)
            .settings(1.0);
        assert_eq!(settings.sync_steps, 1);
        assert_relative_eq!(settings.normal_search_cos, 0.9);
        assert_eq!(settings.status_interval, Duration::from_millis(10));
        assert!(settings.decimate());
    }
}
