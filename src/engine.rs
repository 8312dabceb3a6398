//! Request type and entry point of the decimation engine.

use std::sync::atomic::AtomicU8;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, error, info};

use crate::barrier::Barrier;
use crate::build::assign_triref_bases;
use crate::config::{strength_to_max_cost, DecimationConfig, Flags, Settings};
use crate::edge_hash::{EdgeHash, HashLayout};
use crate::error::{DecimateError, DecimateResult};
use crate::format::{BufferRole, IndexCodec, NormalCodec, ScalarFormat, VertexCodec};
use crate::normals::NormalBuilder;
use crate::op::{Op, UpdateBuffers};
use crate::status::{Stage, Status, StatusTracker};
use crate::topology::{Mesh, Snapshot, CANONICAL};
use crate::worker::{EdgeWeightFn, Input, Shared, ThreadProgress, Worker, WorkerTotals};

/// Per vertex data the caller keeps outside the engine, such as texture
/// coordinates or colors.
///
/// `merge` runs on worker threads while both vertices are locked, `copy`
/// runs on the calling thread while the output is written.
pub trait VertexAttributes: Sync {
    /// Blend `src` into `dst`, the weights add up to one.
    fn merge(&self, dst: usize, src: usize, dst_weight: f64, src_weight: f64);

    /// Overwrite `dst` with `src`.
    fn copy(&self, dst: usize, src: usize);
}

/// Vertex positions, read on input and rewritten in place on output.
pub struct VertexBuffer<'a> {
    pub data: &'a mut [u8],
    pub format: ScalarFormat,
    pub stride: usize,
    pub count: usize,
    /// Rows available for output, at least `count`. Extra rows receive
    /// vertices cloned while splitting normals.
    pub alloc: usize,
}

impl<'a> VertexBuffer<'a> {
    pub fn new(data: &'a mut [u8], format: ScalarFormat, stride: usize, count: usize) -> Self {
        VertexBuffer {
            data,
            format,
            stride,
            count,
            alloc: count,
        }
    }

    #[must_use]
    pub fn with_alloc(mut self, alloc: usize) -> Self {
        self.alloc = alloc.max(self.count);
        self
    }
}

/// Triangle vertex indices, rewritten in place on output.
pub struct IndexBuffer<'a> {
    pub data: &'a mut [u8],
    pub format: ScalarFormat,
    pub stride: usize,
    pub count: usize,
}

impl<'a> IndexBuffer<'a> {
    pub fn new(data: &'a mut [u8], format: ScalarFormat, stride: usize, count: usize) -> Self {
        IndexBuffer {
            data,
            format,
            stride,
            count,
        }
    }
}

/// Destination for rebuilt vertex normals, one row per output vertex.
pub struct NormalBuffer<'a> {
    pub data: &'a mut [u8],
    pub format: ScalarFormat,
    pub stride: usize,
}

impl<'a> NormalBuffer<'a> {
    pub fn new(data: &'a mut [u8], format: ScalarFormat, stride: usize) -> Self {
        NormalBuffer {
            data,
            format,
            stride,
        }
    }
}

/// Opaque bytes attached to every triangle, `size` bytes each.
pub struct TriangleData<'a> {
    pub data: &'a mut [u8],
    pub size: usize,
}

impl<'a> TriangleData<'a> {
    pub fn new(data: &'a mut [u8], size: usize) -> Self {
        TriangleData { data, size }
    }

    fn payload(&self, tri: usize) -> std::ops::Range<usize> {
        tri * self.size..(tri + 1) * self.size
    }
}

/// One decimation request.
pub struct Operation<'a> {
    pub vertices: VertexBuffer<'a>,
    pub indices: IndexBuffer<'a>,
    pub normals: Option<NormalBuffer<'a>>,
    pub triangle_data: Option<TriangleData<'a>>,
    pub edge_weight: Option<EdgeWeightFn<'a>>,
    pub attributes: Option<&'a dyn VertexAttributes>,
    pub status: Option<&'a mut dyn FnMut(&Status)>,
    /// Collapses costing more than this are never performed.
    pub max_cost: f64,
    pub config: DecimationConfig,
}

impl<'a> Operation<'a> {
    pub fn new(vertices: VertexBuffer<'a>, indices: IndexBuffer<'a>) -> Self {
        Operation {
            vertices,
            indices,
            normals: None,
            triangle_data: None,
            edge_weight: None,
            attributes: None,
            status: None,
            max_cost: 0.0,
            config: DecimationConfig::default(),
        }
    }

    /// Set the cost ceiling from a strength in `[0, 1]`.
    #[must_use]
    pub fn with_strength(mut self, strength: f64) -> Self {
        self.max_cost = strength_to_max_cost(strength);
        self
    }

    #[must_use]
    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = max_cost;
        self
    }

    #[must_use]
    pub fn with_normals(mut self, normals: NormalBuffer<'a>) -> Self {
        self.normals = Some(normals);
        self
    }

    #[must_use]
    pub fn with_triangle_data(mut self, data: TriangleData<'a>) -> Self {
        self.triangle_data = Some(data);
        self
    }

    #[must_use]
    pub fn with_edge_weight(mut self, callback: EdgeWeightFn<'a>) -> Self {
        self.edge_weight = Some(callback);
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: &'a dyn VertexAttributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    #[must_use]
    pub fn with_status(mut self, callback: &'a mut dyn FnMut(&Status)) -> Self {
        self.status = Some(callback);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: DecimationConfig) -> Self {
        self.config = config;
        self
    }
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DecimationReport {
    /// Vertices written to the vertex buffer.
    pub vertex_count: usize,
    /// Triangles written to the index buffer.
    pub triangle_count: usize,
    pub decimation_count: usize,
    /// Directed edges found more than once in the input.
    pub collision_count: usize,
    pub elapsed: Duration,
}

/// Feeds the caller's status callback from the coordinator thread.
struct Reporter<'c> {
    callback: Option<&'c mut dyn FnMut(&Status)>,
    tracker: StatusTracker,
    vertex_count: usize,
    triangle_count: usize,
}

impl Reporter<'_> {
    fn enabled(&self) -> bool {
        self.callback.is_some()
    }

    fn emit(&mut self, stage: Stage, sub_progress: f64, triangle_count: usize) {
        if let Some(callback) = self.callback.as_mut() {
            let status = self.tracker.status(stage, sub_progress, triangle_count);
            callback(&status);
        }
    }

    /// Report whatever stage the workers are in.
    fn sample(&mut self, shared: &Shared<'_>) {
        let stage = shared.stage();
        let tris = self.triangle_count.max(1) as f64;
        let left = self
            .triangle_count
            .saturating_sub(shared.total(|p| &p.deleted));
        let sub = match stage {
            Stage::BuildVertices => {
                shared.total(|p| &p.vertices) as f64 / self.vertex_count.max(1) as f64
            }
            Stage::BuildTriangles => shared.total(|p| &p.triangles) as f64 / tris,
            Stage::BuildTrirefs => shared.total(|p| &p.trirefs) as f64 / tris,
            Stage::BuildQueue => shared.total(|p| &p.populated) as f64 / tris,
            Stage::Decimation => 1.0 - left as f64 / tris,
            _ => 0.0,
        };
        self.emit(stage, sub, left);
    }
}

/// Reject anything the workers could trip over.
fn validate(op: &Operation<'_>) -> DecimateResult<(VertexCodec, IndexCodec, Option<NormalCodec>)> {
    let vertex_codec = VertexCodec::new(op.vertices.format, op.vertices.stride)?;
    let index_codec = IndexCodec::new(op.indices.format, op.indices.stride)?;
    let normal_codec = op
        .normals
        .as_ref()
        .map(|n| NormalCodec::new(n.format, n.stride))
        .transpose()?;

    let triangle_count = op.indices.count;
    if triangle_count < 2 {
        return Err(DecimateError::TooFewTriangles(triangle_count));
    }
    let vertex_alloc = op.vertices.alloc.max(op.vertices.count);
    if vertex_alloc > i32::MAX as usize || triangle_count > i32::MAX as usize {
        return Err(DecimateError::MeshTooLarge {
            vertex_count: vertex_alloc,
            triangle_count,
        });
    }

    vertex_codec.check(op.vertices.data, vertex_alloc)?;
    index_codec.check(op.indices.data, triangle_count)?;
    if let (Some(codec), Some(normals)) = (&normal_codec, &op.normals) {
        codec.check(normals.data, vertex_alloc)?;
    }
    if let Some(payload) = &op.triangle_data {
        let needed = payload.size * triangle_count;
        if payload.data.len() < needed {
            return Err(DecimateError::BufferTooSmall {
                role: BufferRole::TriangleData,
                needed,
                actual: payload.data.len(),
            });
        }
    }

    let vertex_count = op.vertices.count;
    let data: &[u8] = op.indices.data;
    let bad = (0..triangle_count).into_par_iter().find_map_first(|tri| {
        index_codec
            .read(data, tri)
            .into_iter()
            .find(|&i| i < 0 || i as u64 >= vertex_count as u64)
            .map(|index| (tri, index))
    });
    if let Some((triangle, index)) = bad {
        return Err(DecimateError::IndexOutOfRange {
            triangle,
            index,
            vertex_count,
        });
    }
    Ok((vertex_codec, index_codec, normal_codec))
}

/// Wait for the workers at the global barrier, reporting status while
/// they are busy.
fn poll_barrier(shared: &Shared<'_>, reporter: &mut Reporter<'_>) {
    if !reporter.enabled() {
        shared.global_barrier.wait();
        return;
    }
    while !shared
        .global_barrier
        .wait_timeout(shared.settings.status_interval)
    {
        reporter.sample(shared);
    }
}

/// Spawn the workers and coordinate them from the calling thread.
fn run_workers(shared: &Shared<'_>, reporter: &mut Reporter<'_>) -> WorkerTotals {
    thread::scope(|scope| {
        let handles: Vec<_> = (0..shared.threads)
            .map(|id| scope.spawn(move || Worker::new(id, shared).run()))
            .collect();

        if reporter.enabled() {
            shared.global_barrier.wait();
        }
        poll_barrier(shared, reporter);
        assign_triref_bases(&shared.mesh);
        shared.global_barrier.wait();
        poll_barrier(shared, reporter);

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
            })
            .fold(WorkerTotals::default(), |acc, t| WorkerTotals {
                decimations: acc.decimations + t.decimations,
                collisions: acc.collisions + t.collisions,
            })
    })
}

/// Allocate the mesh arenas and the edge index for `op`.
fn prepare_shared<'o>(
    op: &'o Operation<'_>,
    codecs: (VertexCodec, IndexCodec),
    settings: Settings,
    report_status: bool,
) -> DecimateResult<Shared<'o>> {
    let triangle_count = op.indices.count;
    let vertex_alloc = op.vertices.alloc.max(op.vertices.count);
    let threads = op.config.resolve_threads(triangle_count);

    let hash = if settings.decimate() {
        let layout = HashLayout::for_mesh::<Arc<Op>>(
            triangle_count,
            Mesh::estimate_bytes(vertex_alloc, triangle_count),
            op.config.max_memory,
        )?;
        Some(EdgeHash::new(layout))
    } else {
        None
    };
    debug!(threads, triangle_count, vertex_alloc, "starting workers");

    Ok(Shared {
        mesh: Mesh::new(op.vertices.count, vertex_alloc, triangle_count),
        hash,
        settings,
        threads,
        input: Input {
            vertices: &*op.vertices.data,
            vertex_codec: codecs.0,
            indices: &*op.indices.data,
            index_codec: codecs.1,
            triangle_data: op.triangle_data.as_ref().map(|t| (&*t.data, t.size)),
        },
        edge_weight: op.edge_weight,
        attributes: op.attributes,
        updates: UpdateBuffers::new(threads),
        work_barrier: Barrier::new(threads),
        global_barrier: Barrier::new(threads + 1),
        global_lock: Mutex::new(()),
        progress: (0..threads).map(|_| ThreadProgress::default()).collect(),
        stage: AtomicU8::new(Stage::Init as u8),
        report_status,
        queue_enabled: settings.decimate() && settings.max_cost > 0.0,
    })
}

/// Build the shared mesh on worker threads and collapse edges until no
/// candidate is left under the cost ceiling.
fn run_decimation(
    op: &Operation<'_>,
    codecs: (VertexCodec, IndexCodec),
    settings: Settings,
    reporter: &mut Reporter<'_>,
) -> DecimateResult<(Snapshot, WorkerTotals)> {
    let shared = prepare_shared(op, codecs, settings, reporter.enabled())?;
    let totals = run_workers(&shared, reporter);
    if let Some(hash) = &shared.hash {
        debug!(edges = hash.len(), "edge index after decimation");
    }
    Ok((shared.mesh.into_snapshot(), totals))
}

/// Decimate a mesh in place.
///
/// Parameters
/// ------------
/// op
///   Buffers, callbacks and tunables of the request. Vertices, indices,
///   normals and triangle payloads are rewritten in place.
///
/// Returns
/// ------------
/// report
///   Output element counts and run statistics. Nothing is written when
///   the request is rejected.
pub fn decimate(mut op: Operation<'_>) -> DecimateResult<DecimationReport> {
    let start = Instant::now();
    let (vertex_codec, index_codec, normal_codec) = validate(&op)?;

    let max_cost = if op.max_cost.is_finite() {
        op.max_cost.max(0.0)
    } else {
        0.0
    };
    let settings = op.config.settings(max_cost);
    let triangle_count = op.indices.count;

    let mut reporter = Reporter {
        callback: op.status.take(),
        tracker: StatusTracker::default(),
        vertex_count: op.vertices.count,
        triangle_count,
    };
    reporter.emit(Stage::Init, 0.0, triangle_count);

    let (mut snapshot, totals) =
        run_decimation(&op, (vertex_codec, index_codec), settings, &mut reporter)?;
    let live = snapshot.triangles.iter().flatten().count();
    reporter.emit(Stage::Store, 0.0, live);

    let flags = settings.flags;
    let vertex_normals = match (&op.normals, &normal_codec) {
        (Some(_), Some(_)) => {
            let mut builder = NormalBuilder::new(
                &mut snapshot,
                flags.contains(Flags::TRIANGLE_WINDING_CCW),
                settings.normal_search_cos,
                flags.contains(Flags::NORMAL_VERTEX_SPLITTING),
                op.attributes,
            );
            builder.build_all();
            Some(std::mem::take(&mut builder.normals))
        }
        _ => None,
    };

    let pack = !flags.contains(Flags::NO_VERTEX_PACKING);
    let mut remap = vec![-1i32; snapshot.vertices.len()];
    let mut vertex_count = 0;
    for (index, vertex) in snapshot.vertices[..snapshot.vertex_count].iter().enumerate() {
        if pack
            && (vertex.redirect != CANONICAL
                || vertex.triref_count == 0
                || (vertex_normals.is_none()
                    && vertex.triref_count != -1
                    && !snapshot.in_use(index)))
        {
            continue;
        }
        vertex_codec.write(op.vertices.data, vertex_count, &vertex.point);
        if let (Some(normals), Some(buffer), Some(codec)) =
            (&vertex_normals, op.normals.as_mut(), &normal_codec)
        {
            codec.write(buffer.data, vertex_count, &normals[index]);
        }
        if vertex_count != index {
            if let Some(attributes) = op.attributes {
                attributes.copy(vertex_count, index);
            }
        }
        remap[index] = vertex_count as i32;
        vertex_count += 1;
    }

    let mut written = 0;
    for (tri, v) in snapshot.triangles.iter().enumerate() {
        let Some(v) = v else {
            continue;
        };
        let mapped = v.map(|x| remap[x as usize]);
        if mapped.iter().any(|&x| x < 0) {
            error!(tri, ?v, "live triangle references a dropped vertex");
            continue;
        }
        index_codec.write(op.indices.data, written, mapped.map(|x| x as u32));
        if let Some(payload) = op.triangle_data.as_mut() {
            if written != tri {
                let range = payload.payload(tri);
                let dst = payload.payload(written).start;
                payload.data.copy_within(range, dst);
            }
        }
        written += 1;
    }
    reporter.emit(Stage::Done, 1.0, written);

    let report = DecimationReport {
        vertex_count,
        triangle_count: written,
        decimation_count: totals.decimations,
        collision_count: totals.collisions,
        elapsed: start.elapsed(),
    };
    info!(
        vertices = report.vertex_count,
        triangles = report.triangle_count,
        decimations = report.decimation_count,
        collisions = report.collision_count,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "decimation finished"
    );
    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> (Vec<f32>, Vec<u32>) {
        let vertices = vec![
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, //
            1.0, 1.0, 0.0, //
            0.0, 1.0, 0.0,
        ];
        (vertices, vec![0, 1, 2, 0, 2, 3])
    }

    #[test]
    fn test_rejects_bad_requests() {
        let (mut vertices, mut indices) = quad();
        let op = Operation::new(
            VertexBuffer::new(bytemuck::cast_slice_mut(&mut vertices), ScalarFormat::F32, 12, 4),
            IndexBuffer::new(bytemuck::cast_slice_mut(&mut indices), ScalarFormat::U32, 12, 1),
        );
        assert!(matches!(decimate(op), Err(DecimateError::TooFewTriangles(1))));

        indices[4] = 9;
        let op = Operation::new(
            VertexBuffer::new(bytemuck::cast_slice_mut(&mut vertices), ScalarFormat::F32, 12, 4),
            IndexBuffer::new(bytemuck::cast_slice_mut(&mut indices), ScalarFormat::U32, 12, 2),
        );
        assert!(matches!(
            decimate(op),
            Err(DecimateError::IndexOutOfRange {
                triangle: 1,
                index: 9,
                vertex_count: 4
            })
        ));
        // rejected requests leave the buffers alone
        assert_eq!(indices, vec![0, 1, 2, 0, 9, 3]);

        let op = Operation::new(
            VertexBuffer::new(bytemuck::cast_slice_mut(&mut vertices), ScalarFormat::F32, 12, 5),
            IndexBuffer::new(bytemuck::cast_slice_mut(&mut indices), ScalarFormat::U32, 12, 2),
        );
        assert!(matches!(
            decimate(op),
            Err(DecimateError::BufferTooSmall {
                role: BufferRole::Vertex,
                ..
            })
        ));
    }

    #[test]
    fn test_payload_buffer_checked() {
        let (mut vertices, mut indices) = quad();
        let mut payload = vec![0u8; 7];
        let op = Operation::new(
            VertexBuffer::new(bytemuck::cast_slice_mut(&mut vertices), ScalarFormat::F32, 12, 4),
            IndexBuffer::new(bytemuck::cast_slice_mut(&mut indices), ScalarFormat::U32, 12, 2),
        )
        .with_triangle_data(TriangleData::new(&mut payload, 4));
        assert!(matches!(
            decimate(op),
            Err(DecimateError::BufferTooSmall {
                role: BufferRole::TriangleData,
                needed: 8,
                actual: 7
            })
        ));
    }

    #[test]
    fn test_zero_strength_keeps_mesh() {
        let (mut vertices, mut indices) = quad();
        let op = Operation::new(
            VertexBuffer::new(bytemuck::cast_slice_mut(&mut vertices), ScalarFormat::F32, 12, 4),
            IndexBuffer::new(bytemuck::cast_slice_mut(&mut indices), ScalarFormat::U32, 12, 2),
        );
        let report = decimate(op).unwrap();
        assert_eq!(report.vertex_count, 4);
        assert_eq!(report.triangle_count, 2);
        assert_eq!(report.decimation_count, 0);
        assert_eq!(indices, vec![0, 1, 2, 0, 2, 3]);
    }
}
