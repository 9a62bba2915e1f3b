//! Decoded cells and the N5 block format
//!
//! A stored block is a big-endian header (`u16` mode, `u16` rank, one `u32`
//! per dimension) followed by the compressed element payload, also
//! big-endian. Only the default mode is supported.

use crate::compression::get_compressor;
use crate::error::{Result, VolumeError};
use crate::label::LabelMultiset;
use crate::metadata::DatasetAttributes;
use crate::types::{DataType, Label};
use crate::utils::{read_u16_be, read_u32_be, read_u64_be};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use num_traits::{AsPrimitive, NumCast};
use std::collections::HashMap;

const MODE_DEFAULT: u16 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub mode: u16,
    /// Block size per dimension, dimension 0 first
    pub size: Vec<u32>,
}

impl BlockHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mode = read_u16_be(bytes, 0)?;
        let rank = read_u16_be(bytes, 2)? as usize;
        let size = (0..rank)
            .map(|d| read_u32_be(bytes, 4 + 4 * d))
            .collect::<Result<Vec<_>>>()?;
        if mode != MODE_DEFAULT {
            return Err(VolumeError::InvalidBlock(format!(
                "unsupported block mode {mode}"
            )));
        }
        Ok(Self { mode, size })
    }

    pub fn data_offset(&self) -> usize {
        2 + 2 + 4 * self.size.len()
    }

    pub fn num_elements(&self) -> usize {
        self.size.iter().map(|&s| s as usize).product()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mode.to_be_bytes());
        out.extend_from_slice(&(self.size.len() as u16).to_be_bytes());
        for s in &self.size {
            out.extend_from_slice(&s.to_be_bytes());
        }
    }
}

/// Typed voxel buffer of one cell, widened into the working numeric type.
///
/// Arrays are laid out column-major (dimension 0 fastest) and indexed by
/// local voxel position.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkData {
    /// `uint8..uint64`
    Unsigned(ArrayD<u64>),
    /// `int8..int64`
    Signed(ArrayD<i64>),
    /// `float32`, `float64`
    Float(ArrayD<f64>),
    /// Voxels reference shared multiset lists by index
    Multiset {
        lists: Vec<LabelMultiset>,
        index: ArrayD<u32>,
    },
}

impl ChunkData {
    pub fn kind(&self) -> &'static str {
        match self {
            ChunkData::Unsigned(_) => "unsigned integers",
            ChunkData::Signed(_) => "signed integers",
            ChunkData::Float(_) => "floats",
            ChunkData::Multiset { .. } => "label multisets",
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            ChunkData::Unsigned(a) => a.shape(),
            ChunkData::Signed(a) => a.shape(),
            ChunkData::Float(a) => a.shape(),
            ChunkData::Multiset { index, .. } => index.shape(),
        }
    }

    /// Approximate resident size used for cache accounting
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ChunkData::Unsigned(a) => a.len() * 8,
            ChunkData::Signed(a) => a.len() * 8,
            ChunkData::Float(a) => a.len() * 8,
            ChunkData::Multiset { lists, index } => {
                index.len() * 4 + lists.iter().map(|l| 8 + l.len() * 12).sum::<usize>()
            }
        }
    }

    /// Integer label at a local position, widening signed ids bitwise
    pub fn label_at(&self, position: &[usize]) -> Option<u64> {
        match self {
            ChunkData::Unsigned(a) => a.get(IxDyn(position)).copied(),
            ChunkData::Signed(a) => a.get(IxDyn(position)).map(|&v| v as u64),
            ChunkData::Float(_) => None,
            ChunkData::Multiset { lists, index } => index
                .get(IxDyn(position))
                .and_then(|&i| lists.get(i as usize))
                .and_then(LabelMultiset::argmax),
        }
    }

    /// Multiset at a local position
    pub fn multiset_at(&self, position: &[usize]) -> Option<&LabelMultiset> {
        match self {
            ChunkData::Multiset { lists, index } => index
                .get(IxDyn(position))
                .and_then(|&i| lists.get(i as usize)),
            _ => None,
        }
    }
}

/// Decoded content of one grid cell
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    position: Vec<u64>,
    data: ChunkData,
}

impl Chunk {
    pub fn new(position: Vec<u64>, data: ChunkData) -> Self {
        Self { position, data }
    }

    /// Cell that is not stored: background labels, zero intensities.
    pub fn empty(position: Vec<u64>, size: &[u64], voxel_type: DataType) -> Self {
        let shape = fortran_shape(size);
        let data = match voxel_type {
            DataType::LabelMultiset => ChunkData::Multiset {
                lists: vec![LabelMultiset::singleton(Label::BACKGROUND)],
                index: ArrayD::zeros(shape),
            },
            t if t.is_float() => ChunkData::Float(ArrayD::zeros(shape)),
            t if t.is_signed() => ChunkData::Signed(ArrayD::zeros(shape)),
            _ => ChunkData::Unsigned(ArrayD::from_elem(shape, Label::BACKGROUND)),
        };
        Self { position, data }
    }

    /// Grid position of the cell
    pub fn position(&self) -> &[u64] {
        &self.position
    }

    /// Effective (clipped) size of the cell
    pub fn size(&self) -> Vec<u64> {
        self.data.shape().iter().map(|&s| s as u64).collect()
    }

    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.size_in_bytes() + self.position.len() * 8
    }
}

fn fortran_shape(size: &[u64]) -> ndarray::Shape<IxDyn> {
    let dims: Vec<usize> = size.iter().map(|&s| s as usize).collect();
    IxDyn(&dims).f()
}

fn from_n5_order<T>(size: &[u64], values: Vec<T>) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(fortran_shape(size), values)
        .map_err(|e| VolumeError::InvalidBlock(e.to_string()))
}

/// Elements in N5 order (dimension 0 fastest)
fn n5_order<T: Clone>(array: &ArrayD<T>) -> impl Iterator<Item = T> + '_ {
    array.t().into_iter().cloned()
}

fn decode_elements<const N: usize, T, W>(bytes: &[u8], read: fn([u8; N]) -> T) -> Vec<W>
where
    T: AsPrimitive<W>,
    W: Copy + 'static,
{
    bytes
        .chunks_exact(N)
        .map(|c| {
            let mut raw = [0u8; N];
            raw.copy_from_slice(c);
            read(raw).as_()
        })
        .collect()
}

/// Decode a stored block into a chunk of the declared type.
///
/// `bytes == None` means the block is absent and yields [`Chunk::empty`].
pub fn decode_block(
    attributes: &DatasetAttributes,
    position: &[u64],
    expected_size: &[u64],
    bytes: Option<&[u8]>,
) -> Result<Chunk> {
    let voxel_type = attributes.voxel_type();
    let Some(bytes) = bytes else {
        return Ok(Chunk::empty(position.to_vec(), expected_size, voxel_type));
    };

    let header = BlockHeader::parse(bytes)?;
    let header_size: Vec<u64> = header.size.iter().map(|&s| s as u64).collect();
    if voxel_type != DataType::LabelMultiset && header_size != expected_size {
        return Err(VolumeError::InvalidBlock(format!(
            "block header has size {:?}, expected {:?}",
            header_size, expected_size
        )));
    }

    let num_elements: usize = expected_size.iter().map(|&s| s as usize).product();
    let compressor = get_compressor(attributes.compression);
    let payload = compressor.decompress(
        &bytes[header.data_offset()..],
        Some(num_elements * voxel_type.size_in_bytes()),
    )?;

    let data = match voxel_type {
        DataType::LabelMultiset => decode_multisets(&payload, expected_size)?,
        t => {
            let element_size = t.size_in_bytes();
            if payload.len() != num_elements * element_size {
                return Err(VolumeError::TypeMismatch {
                    expected: format!("{} bytes of {t}", num_elements * element_size),
                    found: format!("{} bytes", payload.len()),
                });
            }
            match t {
                DataType::Uint8 => ChunkData::Unsigned(from_n5_order(
                    expected_size,
                    decode_elements::<1, u8, u64>(&payload, u8::from_be_bytes),
                )?),
                DataType::Uint16 => ChunkData::Unsigned(from_n5_order(
                    expected_size,
                    decode_elements::<2, u16, u64>(&payload, u16::from_be_bytes),
                )?),
                DataType::Uint32 => ChunkData::Unsigned(from_n5_order(
                    expected_size,
                    decode_elements::<4, u32, u64>(&payload, u32::from_be_bytes),
                )?),
                DataType::Uint64 => ChunkData::Unsigned(from_n5_order(
                    expected_size,
                    decode_elements::<8, u64, u64>(&payload, u64::from_be_bytes),
                )?),
                DataType::Int8 => ChunkData::Signed(from_n5_order(
                    expected_size,
                    decode_elements::<1, i8, i64>(&payload, i8::from_be_bytes),
                )?),
                DataType::Int16 => ChunkData::Signed(from_n5_order(
                    expected_size,
                    decode_elements::<2, i16, i64>(&payload, i16::from_be_bytes),
                )?),
                DataType::Int32 => ChunkData::Signed(from_n5_order(
                    expected_size,
                    decode_elements::<4, i32, i64>(&payload, i32::from_be_bytes),
                )?),
                DataType::Int64 => ChunkData::Signed(from_n5_order(
                    expected_size,
                    decode_elements::<8, i64, i64>(&payload, i64::from_be_bytes),
                )?),
                DataType::Float32 => ChunkData::Float(from_n5_order(
                    expected_size,
                    decode_elements::<4, f32, f64>(&payload, f32::from_be_bytes),
                )?),
                DataType::Float64 => ChunkData::Float(from_n5_order(
                    expected_size,
                    decode_elements::<8, f64, f64>(&payload, f64::from_be_bytes),
                )?),
                DataType::LabelMultiset => unreachable!("handled above"),
            }
        }
    };
    Ok(Chunk::new(position.to_vec(), data))
}

fn decode_multisets(payload: &[u8], expected_size: &[u64]) -> Result<ChunkData> {
    let n = read_u32_be(payload, 0)? as usize;
    let expected: usize = expected_size.iter().map(|&s| s as usize).product();
    if n != expected {
        return Err(VolumeError::TypeMismatch {
            expected: format!("{expected} multiset voxels"),
            found: format!("{n} voxels"),
        });
    }
    let offsets_start = 4 + 8 * n;
    let lists_start = offsets_start + 4 * n;
    if payload.len() < lists_start {
        return Err(VolumeError::InvalidBlock(format!(
            "multiset block of {n} voxels truncated to {} bytes",
            payload.len()
        )));
    }

    let mut lists = Vec::new();
    let mut list_of_offset: HashMap<u32, u32> = HashMap::new();
    let mut index = Vec::with_capacity(n);
    for voxel in 0..n {
        let offset = read_u32_be(payload, offsets_start + 4 * voxel)?;
        let list = match list_of_offset.get(&offset) {
            Some(&list) => list,
            None => {
                let mut cursor = lists_start + offset as usize;
                let entries = read_u32_be(payload, cursor)? as usize;
                cursor += 4;
                if entries > (payload.len() - cursor) / 12 {
                    return Err(VolumeError::InvalidBlock(format!(
                        "multiset list at offset {offset} claims {entries} entries past end of block"
                    )));
                }
                let mut pairs = Vec::with_capacity(entries);
                for _ in 0..entries {
                    let id = read_u64_be(payload, cursor)?;
                    let count = read_u32_be(payload, cursor + 8)?;
                    pairs.push((id, count));
                    cursor += 12;
                }
                lists.push(LabelMultiset::new(pairs));
                let list = (lists.len() - 1) as u32;
                list_of_offset.insert(offset, list);
                list
            }
        };
        index.push(list);
    }
    Ok(ChunkData::Multiset {
        lists,
        index: from_n5_order(expected_size, index)?,
    })
}

fn narrow<S, T>(value: S, data_type: DataType) -> Result<T>
where
    S: NumCast + Copy + std::fmt::Display,
    T: NumCast,
{
    <T as NumCast>::from(value).ok_or_else(|| VolumeError::TypeMismatch {
        expected: data_type.to_string(),
        found: format!("value {value}"),
    })
}

/// Encode a chunk as a stored block for the given dataset.
pub fn encode_block(attributes: &DatasetAttributes, chunk: &Chunk) -> Result<Vec<u8>> {
    let voxel_type = attributes.voxel_type();
    let mut payload = Vec::new();
    match (voxel_type, chunk.data()) {
        (DataType::LabelMultiset, ChunkData::Multiset { lists, index }) => {
            encode_multisets(lists, index, &mut payload)
        }
        (t, ChunkData::Unsigned(values)) if t.is_unsigned() => {
            for v in n5_order(values) {
                match t {
                    DataType::Uint8 => payload.push(narrow::<u64, u8>(v, t)?),
                    DataType::Uint16 => {
                        payload.extend_from_slice(&narrow::<u64, u16>(v, t)?.to_be_bytes())
                    }
                    DataType::Uint32 => {
                        payload.extend_from_slice(&narrow::<u64, u32>(v, t)?.to_be_bytes())
                    }
                    _ => payload.extend_from_slice(&v.to_be_bytes()),
                }
            }
        }
        (t, ChunkData::Signed(values)) if t.is_signed() => {
            for v in n5_order(values) {
                match t {
                    DataType::Int8 => payload.extend_from_slice(&narrow::<i64, i8>(v, t)?.to_be_bytes()),
                    DataType::Int16 => {
                        payload.extend_from_slice(&narrow::<i64, i16>(v, t)?.to_be_bytes())
                    }
                    DataType::Int32 => {
                        payload.extend_from_slice(&narrow::<i64, i32>(v, t)?.to_be_bytes())
                    }
                    _ => payload.extend_from_slice(&v.to_be_bytes()),
                }
            }
        }
        (t, ChunkData::Float(values)) if t.is_float() => {
            for v in n5_order(values) {
                match t {
                    DataType::Float32 => payload.extend_from_slice(&(v as f32).to_be_bytes()),
                    _ => payload.extend_from_slice(&v.to_be_bytes()),
                }
            }
        }
        (t, data) => {
            return Err(VolumeError::TypeMismatch {
                expected: t.to_string(),
                found: data.kind().to_string(),
            })
        }
    }

    let header = BlockHeader {
        mode: MODE_DEFAULT,
        size: chunk.size().iter().map(|&s| s as u32).collect(),
    };
    let mut block = Vec::with_capacity(header.data_offset() + payload.len());
    header.write(&mut block);
    block.extend(get_compressor(attributes.compression).compress(&payload)?);
    Ok(block)
}

fn encode_multisets(lists: &[LabelMultiset], index: &ArrayD<u32>, out: &mut Vec<u8>) {
    let mut list_offsets = Vec::with_capacity(lists.len());
    let mut list_data = Vec::new();
    for list in lists {
        list_offsets.push(list_data.len() as u32);
        list_data.extend_from_slice(&(list.len() as u32).to_be_bytes());
        for &(id, count) in list.entries() {
            list_data.extend_from_slice(&id.to_be_bytes());
            list_data.extend_from_slice(&count.to_be_bytes());
        }
    }

    out.extend_from_slice(&(index.len() as u32).to_be_bytes());
    for i in n5_order(index) {
        let argmax = lists
            .get(i as usize)
            .and_then(LabelMultiset::argmax)
            .unwrap_or(Label::INVALID);
        out.extend_from_slice(&argmax.to_be_bytes());
    }
    for i in n5_order(index) {
        out.extend_from_slice(&list_offsets[i as usize].to_be_bytes());
    }
    out.extend(list_data);
}
