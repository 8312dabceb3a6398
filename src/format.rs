//! Strided byte buffer access for vertices, indices and normals.

use std::fmt;

use bytemuck::Pod;
use nalgebra::{Point3, Vector3};

use crate::error::{DecimateError, DecimateResult};

/// Scalar layout of the elements in a caller buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFormat {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    /// Three signed 10 bit components packed into one `u32`.
    Packed2_10_10_10,
}

impl ScalarFormat {
    /// Bytes taken by three components.
    pub fn triple_size(&self) -> usize {
        match self {
            ScalarFormat::I8 | ScalarFormat::U8 => 3,
            ScalarFormat::I16 | ScalarFormat::U16 => 6,
            ScalarFormat::F32 | ScalarFormat::I32 | ScalarFormat::U32 => 12,
            ScalarFormat::F64 | ScalarFormat::I64 | ScalarFormat::U64 => 24,
            ScalarFormat::Packed2_10_10_10 => 4,
        }
    }
}

/// Which buffer of a request a format describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    Vertex,
    Index,
    Normal,
    TriangleData,
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferRole::Vertex => "vertex",
            BufferRole::Index => "index",
            BufferRole::Normal => "normal",
            BufferRole::TriangleData => "triangle data",
        };
        f.write_str(name)
    }
}

fn read3<T: Pod>(bytes: &[u8]) -> [T; 3] {
    bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<[T; 3]>()])
}

fn write3<T: Pod>(bytes: &mut [u8], value: [T; 3]) {
    bytes[..std::mem::size_of::<[T; 3]>()].copy_from_slice(bytemuck::bytes_of(&value));
}

/// Bytes needed to hold `count` elements of `element` bytes at `stride`.
pub(crate) fn required_len(count: usize, stride: usize, element: usize) -> usize {
    match count {
        0 => 0,
        n => (n - 1) * stride + element,
    }
}

/// Shared validation of a strided buffer layout.
#[derive(Debug, Clone, Copy)]
struct Layout {
    role: BufferRole,
    format: ScalarFormat,
    stride: usize,
}

impl Layout {
    fn new(role: BufferRole, format: ScalarFormat, stride: usize) -> DecimateResult<Self> {
        let element = format.triple_size();
        if stride < element {
            return Err(DecimateError::InvalidStride {
                role,
                stride,
                element,
            });
        }
        Ok(Layout {
            role,
            format,
            stride,
        })
    }

    fn check(&self, len: usize, count: usize) -> DecimateResult<()> {
        let needed = required_len(count, self.stride, self.format.triple_size());
        if len < needed {
            return Err(DecimateError::BufferTooSmall {
                role: self.role,
                needed,
                actual: len,
            });
        }
        Ok(())
    }

    fn element<'b>(&self, data: &'b [u8], index: usize) -> &'b [u8] {
        let start = index * self.stride;
        &data[start..start + self.format.triple_size()]
    }

    fn element_mut<'b>(&self, data: &'b mut [u8], index: usize) -> &'b mut [u8] {
        let start = index * self.stride;
        &mut data[start..start + self.format.triple_size()]
    }
}

fn unsupported(role: BufferRole, format: ScalarFormat) -> DecimateError {
    DecimateError::UnsupportedFormat { role, format }
}

/// Reads and writes vertex positions.
#[derive(Debug, Clone, Copy)]
pub struct VertexCodec {
    layout: Layout,
}

impl VertexCodec {
    pub fn new(format: ScalarFormat, stride: usize) -> DecimateResult<Self> {
        match format {
            ScalarFormat::F32 | ScalarFormat::F64 | ScalarFormat::I16 | ScalarFormat::I32 => {}
            other => return Err(unsupported(BufferRole::Vertex, other)),
        }
        Ok(VertexCodec {
            layout: Layout::new(BufferRole::Vertex, format, stride)?,
        })
    }

    pub fn check(&self, data: &[u8], count: usize) -> DecimateResult<()> {
        self.layout.check(data.len(), count)
    }

    pub fn read(&self, data: &[u8], index: usize) -> Point3<f64> {
        let bytes = self.layout.element(data, index);
        let [x, y, z] = match self.layout.format {
            ScalarFormat::F32 => read3::<f32>(bytes).map(f64::from),
            ScalarFormat::I16 => read3::<i16>(bytes).map(f64::from),
            ScalarFormat::I32 => read3::<i32>(bytes).map(f64::from),
            _ => read3::<f64>(bytes),
        };
        Point3::new(x, y, z)
    }

    pub fn write(&self, data: &mut [u8], index: usize, point: &Point3<f64>) {
        let bytes = self.layout.element_mut(data, index);
        let p = [point.x, point.y, point.z];
        match self.layout.format {
            ScalarFormat::F32 => write3(bytes, p.map(|v| v as f32)),
            ScalarFormat::I16 => write3(bytes, p.map(|v| v as i16)),
            ScalarFormat::I32 => write3(bytes, p.map(|v| v as i32)),
            _ => write3(bytes, p),
        }
    }
}

/// Reads and writes triangle vertex indices.
#[derive(Debug, Clone, Copy)]
pub struct IndexCodec {
    layout: Layout,
}

impl IndexCodec {
    pub fn new(format: ScalarFormat, stride: usize) -> DecimateResult<Self> {
        match format {
            ScalarFormat::F32 | ScalarFormat::F64 | ScalarFormat::Packed2_10_10_10 => {
                return Err(unsupported(BufferRole::Index, format))
            }
            _ => {}
        }
        Ok(IndexCodec {
            layout: Layout::new(BufferRole::Index, format, stride)?,
        })
    }

    pub fn check(&self, data: &[u8], count: usize) -> DecimateResult<()> {
        self.layout.check(data.len(), count)
    }

    pub fn read(&self, data: &[u8], triangle: usize) -> [i64; 3] {
        let bytes = self.layout.element(data, triangle);
        match self.layout.format {
            ScalarFormat::I8 => read3::<i8>(bytes).map(i64::from),
            ScalarFormat::U8 => read3::<u8>(bytes).map(i64::from),
            ScalarFormat::I16 => read3::<i16>(bytes).map(i64::from),
            ScalarFormat::U16 => read3::<u16>(bytes).map(i64::from),
            ScalarFormat::I32 => read3::<i32>(bytes).map(i64::from),
            ScalarFormat::U32 => read3::<u32>(bytes).map(i64::from),
            // out of range values are caught by the index validation
            ScalarFormat::U64 => read3::<u64>(bytes).map(|v| i64::try_from(v).unwrap_or(-1)),
            _ => read3::<i64>(bytes),
        }
    }

    pub fn write(&self, data: &mut [u8], triangle: usize, indices: [u32; 3]) {
        let bytes = self.layout.element_mut(data, triangle);
        match self.layout.format {
            ScalarFormat::I8 => write3(bytes, indices.map(|v| v as i8)),
            ScalarFormat::U8 => write3(bytes, indices.map(|v| v as u8)),
            ScalarFormat::I16 => write3(bytes, indices.map(|v| v as i16)),
            ScalarFormat::U16 => write3(bytes, indices.map(|v| v as u16)),
            ScalarFormat::I32 => write3(bytes, indices.map(|v| v as i32)),
            ScalarFormat::U32 => write3(bytes, indices),
            ScalarFormat::U64 => write3(bytes, indices.map(u64::from)),
            _ => write3(bytes, indices.map(i64::from)),
        }
    }
}

/// Signed normalized quantization, `pos` scales positive and `neg`
/// negative components.
fn quantize(v: f64, pos: f64, neg: f64) -> f64 {
    if v > 0.0 {
        v * pos + 0.5
    } else {
        v * neg - 0.5
    }
}

/// Writes unit normals.
#[derive(Debug, Clone, Copy)]
pub struct NormalCodec {
    layout: Layout,
}

impl NormalCodec {
    pub fn new(format: ScalarFormat, stride: usize) -> DecimateResult<Self> {
        match format {
            ScalarFormat::F32
            | ScalarFormat::F64
            | ScalarFormat::I8
            | ScalarFormat::I16
            | ScalarFormat::Packed2_10_10_10 => {}
            other => return Err(unsupported(BufferRole::Normal, other)),
        }
        Ok(NormalCodec {
            layout: Layout::new(BufferRole::Normal, format, stride)?,
        })
    }

    pub fn check(&self, data: &[u8], count: usize) -> DecimateResult<()> {
        self.layout.check(data.len(), count)
    }

    pub fn write(&self, data: &mut [u8], index: usize, normal: &Vector3<f64>) {
        let bytes = self.layout.element_mut(data, index);
        let n = [normal.x, normal.y, normal.z];
        match self.layout.format {
            ScalarFormat::F32 => write3(bytes, n.map(|v| v as f32)),
            ScalarFormat::I8 => write3(bytes, n.map(|v| quantize(v, 127.0, 128.0) as i8)),
            ScalarFormat::I16 => write3(bytes, n.map(|v| quantize(v, 32767.0, 32768.0) as i16)),
            ScalarFormat::Packed2_10_10_10 => {
                let [x, y, z] = n.map(|v| (quantize(v, 511.0, 512.0) as i32 & 1023) as u32);
                bytes.copy_from_slice(&(x | (y << 10) | (z << 20)).to_ne_bytes());
            }
            _ => write3(bytes, n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_codec_strided() {
        let codec = VertexCodec::new(ScalarFormat::F32, 16).unwrap();
        let mut data = vec![0u8; 32];
        codec.check(&data, 2).unwrap();
        assert!(codec.check(&data, 3).is_err());

        codec.write(&mut data, 1, &Point3::new(1.5, -2.0, 3.25));
        assert_eq!(codec.read(&data, 1), Point3::new(1.5, -2.0, 3.25));
        assert_eq!(codec.read(&data, 0), Point3::origin());
        // padding after the element is left alone
        assert_eq!(&data[28..32], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_vertex_codec_integer() {
        let codec = VertexCodec::new(ScalarFormat::I16, 6).unwrap();
        let mut data = vec![0u8; 6];
        codec.write(&mut data, 0, &Point3::new(-7.0, 300.0, 12.9));
        assert_eq!(codec.read(&data, 0), Point3::new(-7.0, 300.0, 12.0));
    }

    #[test]
    fn test_rejected_formats() {
        assert!(matches!(
            VertexCodec::new(ScalarFormat::U8, 3),
            Err(DecimateError::UnsupportedFormat {
                role: BufferRole::Vertex,
                ..
            })
        ));
        assert!(IndexCodec::new(ScalarFormat::F32, 12).is_err());
        assert!(NormalCodec::new(ScalarFormat::U16, 6).is_err());
        assert!(matches!(
            VertexCodec::new(ScalarFormat::F64, 12),
            Err(DecimateError::InvalidStride { .. })
        ));
    }

    #[test]
    fn test_index_codec() {
        let codec = IndexCodec::new(ScalarFormat::U16, 6).unwrap();
        let mut data = vec![0u8; 12];
        codec.write(&mut data, 1, [4, 65535, 9]);
        assert_eq!(codec.read(&data, 1), [4, 65535, 9]);

        let signed = IndexCodec::new(ScalarFormat::I8, 3).unwrap();
        let data = [1u8, 0xff, 2];
        assert_eq!(signed.read(&data, 0), [1, -1, 2]);
    }

    #[test]
    fn test_normal_quantize() {
        let mut data = vec![0u8; 3];
        let codec = NormalCodec::new(ScalarFormat::I8, 3).unwrap();
        codec.write(&mut data, 0, &Vector3::new(1.0, -1.0, 0.0));
        assert_eq!(data, vec![127u8, 0x80, 0]);

        let codec = NormalCodec::new(ScalarFormat::I16, 6).unwrap();
        let mut data = vec![0u8; 6];
        codec.write(&mut data, 0, &Vector3::new(0.0, 1.0, -1.0));
        let values: [i16; 3] = bytemuck::pod_read_unaligned(&data);
        assert_eq!(values, [0, 32767, -32768]);
    }

    #[test]
    fn test_normal_packed() {
        let codec = NormalCodec::new(ScalarFormat::Packed2_10_10_10, 4).unwrap();
        let mut data = vec![0u8; 4];
        codec.write(&mut data, 0, &Vector3::new(1.0, 0.0, -1.0));
        let word = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
        assert_eq!(word & 1023, 511);
        assert_eq!((word >> 10) & 1023, 0);
        // -512 in ten bit two's complement
        assert_eq!((word >> 20) & 1023, 512);
    }
}
