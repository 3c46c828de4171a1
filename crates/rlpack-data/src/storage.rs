//! Disk-backed packed tensors.
//!
//! Each channel is persisted as one flat, fixed-size buffer named
//! `<channel>.pt` inside a directory, holding `num_sequences * sequence_length`
//! elements in row-major order and native byte order. Buffers are written and
//! read through memory maps, so a training process can map the same files
//! without copying:
//!
//! ```text
//! tensors/
//! ├── descriptor.json     {dir, num_sequences, sequence_length}
//! ├── tokens.pt           i64
//! ├── group_ids.pt        i64
//! ├── parent_ids.pt       i64
//! ├── input_pos.pt        i64
//! ├── assistant_mask.pt   u8 (0 or 1)
//! ├── logprobs.pt         f32
//! ├── advantages.pt       f32
//! ├── weights.pt          f32
//! └── deferred.pt         u8 (0 or 1)
//! ```
//!
//! Concurrent writers to one directory are not coordinated.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut};
use ndarray::Array2;
use rlpack_core::{Channel, Dtype, Result, RlPackError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::PackedTensors;

/// Location and shape of packed tensors on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskPackedTensors {
    /// Directory holding one buffer per channel.
    pub dir: PathBuf,
    /// Number of rows.
    pub num_sequences: usize,
    /// Row width.
    pub sequence_length: usize,
}

impl DiskPackedTensors {
    /// Name of the descriptor file written next to the buffers.
    pub const DESCRIPTOR_FILE: &'static str = "descriptor.json";

    /// Describe tensors of the given shape in `dir`.
    pub fn new(dir: impl Into<PathBuf>, num_sequences: usize, sequence_length: usize) -> Self {
        Self {
            dir: dir.into(),
            num_sequences,
            sequence_length,
        }
    }

    /// Path of one channel's buffer.
    pub fn channel_path(&self, channel: Channel) -> PathBuf {
        self.dir.join(channel.file_name())
    }

    /// Exact byte size a channel's buffer must have.
    ///
    /// Fails with [`RlPackError::Format`] when the declared shape does not fit
    /// in the address space.
    pub fn channel_bytes(&self, channel: Channel) -> Result<u64> {
        self.num_sequences
            .checked_mul(self.sequence_length)
            .and_then(|cells| cells.checked_mul(channel.dtype().size_bytes()))
            .and_then(|bytes| u64::try_from(bytes).ok())
            .ok_or_else(|| {
                RlPackError::Format(format!(
                    "{channel}: shape {}x{} overflows the addressable size",
                    self.num_sequences, self.sequence_length
                ))
            })
    }

    /// Write the descriptor into the directory.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(self.dir.join(Self::DESCRIPTOR_FILE), json)?;
        Ok(())
    }

    /// Read the descriptor of a directory written by [`packed_tensors_to_dir`].
    ///
    /// The returned `dir` is the path given here, so a moved directory still
    /// opens.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(Self::DESCRIPTOR_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            RlPackError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read descriptor {}: {}", path.display(), e),
            ))
        })?;
        let mut descriptor: Self = serde_json::from_str(&content)?;
        descriptor.dir = dir.as_ref().to_path_buf();
        Ok(descriptor)
    }
}

/// Write packed tensors into `dir`, creating it if absent.
///
/// Existing buffers are resized to the new shape and overwritten in place.
pub fn packed_tensors_to_dir<P: AsRef<Path>>(
    tensors: &PackedTensors,
    dir: P,
) -> Result<DiskPackedTensors> {
    tensors.validate()?;
    fs::create_dir_all(dir.as_ref())?;

    let (num_sequences, sequence_length) = tensors.shape();
    let disk = DiskPackedTensors::new(dir.as_ref(), num_sequences, sequence_length);

    for channel in Channel::ALL {
        let mut mmap = map_channel_mut(&disk, channel)?;
        match channel {
            Channel::Tokens => copy_elements(&mut mmap, &tensors.tokens),
            Channel::GroupIds => copy_elements(&mut mmap, &tensors.group_ids),
            Channel::ParentIds => copy_elements(&mut mmap, &tensors.parent_ids),
            Channel::InputPos => copy_elements(&mut mmap, &tensors.input_pos),
            Channel::AssistantMask => copy_flags(&mut mmap, &tensors.assistant_mask),
            Channel::Logprobs => copy_elements(&mut mmap, &tensors.logprobs),
            Channel::Advantages => copy_elements(&mut mmap, &tensors.advantages),
            Channel::Weights => copy_elements(&mut mmap, &tensors.weights),
            Channel::Deferred => copy_flags(&mut mmap, &tensors.deferred),
        }
        mmap.flush()?;
        debug!(%channel, bytes = mmap.len(), "Wrote channel buffer");
    }

    disk.save()?;
    info!(
        "Wrote {}x{} packed tensors to {:?}",
        num_sequences, sequence_length, disk.dir
    );
    Ok(disk)
}

/// Open the buffers described by `disk` read-only.
pub fn packed_tensors_from_dir(disk: &DiskPackedTensors) -> Result<MappedPackedTensors> {
    MappedPackedTensors::open(disk)
}

fn map_channel_mut(disk: &DiskPackedTensors, channel: Channel) -> Result<MmapMut> {
    let path = disk.channel_path(channel);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    file.set_len(disk.channel_bytes(channel)?)?;
    // SAFETY: the file was just sized to the mapping length and is only
    // written through this map for the duration of the copy.
    #[allow(unsafe_code)]
    let mmap = unsafe { MmapMut::map_mut(&file)? };
    Ok(mmap)
}

fn copy_elements<T: bytemuck::Pod>(dst: &mut [u8], src: &Array2<T>) {
    let size = std::mem::size_of::<T>();
    for (chunk, value) in dst.chunks_exact_mut(size).zip(src.iter()) {
        chunk.copy_from_slice(bytemuck::bytes_of(value));
    }
}

fn copy_flags(dst: &mut [u8], src: &Array2<bool>) {
    for (byte, &flag) in dst.iter_mut().zip(src.iter()) {
        *byte = u8::from(flag);
    }
}

/// Read-only memory maps over a packed tensor directory.
#[derive(Debug)]
pub struct MappedPackedTensors {
    disk: DiskPackedTensors,
    buffers: Vec<Mmap>,
}

impl MappedPackedTensors {
    /// Map every channel, checking each buffer has exactly the declared size.
    pub fn open(disk: &DiskPackedTensors) -> Result<Self> {
        let mut buffers = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let expected = disk.channel_bytes(channel)?;
            let path = disk.channel_path(channel);
            let file = File::open(&path).map_err(|e| {
                RlPackError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to open {}: {}", path.display(), e),
                ))
            })?;
            let actual = file.metadata()?.len();
            if actual != expected {
                return Err(RlPackError::SizeMismatch {
                    path: path.display().to_string(),
                    expected,
                    actual,
                });
            }
            // SAFETY: the file is opened read-only and the map lives as long
            // as this struct. Writers to the same directory must be serialized
            // by the caller.
            #[allow(unsafe_code)]
            let mmap = unsafe { Mmap::map(&file)? };
            buffers.push(mmap);
        }

        info!(
            "Mapped {}x{} packed tensors from {:?}",
            disk.num_sequences, disk.sequence_length, disk.dir
        );
        Ok(Self {
            disk: disk.clone(),
            buffers,
        })
    }

    /// Open a directory through its descriptor file.
    pub fn open_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open(&DiskPackedTensors::load(dir)?)
    }

    /// Descriptor the buffers were opened with.
    pub fn descriptor(&self) -> &DiskPackedTensors {
        &self.disk
    }

    /// Number of rows.
    pub fn num_sequences(&self) -> usize {
        self.disk.num_sequences
    }

    /// Row width.
    pub fn sequence_length(&self) -> usize {
        self.disk.sequence_length
    }

    /// Raw bytes of one channel.
    pub fn bytes(&self, channel: Channel) -> &[u8] {
        let index = Channel::ALL
            .iter()
            .position(|&c| c == channel)
            .unwrap_or_default();
        &self.buffers[index]
    }

    /// An `i64` channel as a flat slice.
    pub fn int64(&self, channel: Channel) -> Result<&[i64]> {
        self.typed(channel, Dtype::Int64)
    }

    /// An `f32` channel as a flat slice.
    pub fn float32(&self, channel: Channel) -> Result<&[f32]> {
        self.typed(channel, Dtype::Float32)
    }

    /// A boolean channel as a flat slice of 0/1 bytes.
    pub fn flags(&self, channel: Channel) -> Result<&[u8]> {
        expect_dtype(channel, Dtype::Bool)?;
        Ok(self.bytes(channel))
    }

    fn typed<T: bytemuck::Pod>(&self, channel: Channel, dtype: Dtype) -> Result<&[T]> {
        expect_dtype(channel, dtype)?;
        bytemuck::try_cast_slice(self.bytes(channel))
            .map_err(|e| RlPackError::Format(format!("{channel}: {e}")))
    }

    /// Copy every channel back into memory.
    pub fn to_packed_tensors(&self) -> Result<PackedTensors> {
        let shape = (self.num_sequences(), self.sequence_length());
        let int64 = |channel: Channel| -> Result<Array2<i64>> {
            to_array(shape, self.int64(channel)?.to_vec())
        };
        let float32 = |channel: Channel| -> Result<Array2<f32>> {
            to_array(shape, self.float32(channel)?.to_vec())
        };
        let flags = |channel: Channel| -> Result<Array2<bool>> {
            let values = self
                .flags(channel)?
                .iter()
                .map(|&b| match b {
                    0 => Ok(false),
                    1 => Ok(true),
                    other => Err(RlPackError::Format(format!(
                        "{channel}: expected 0 or 1, found {other}"
                    ))),
                })
                .collect::<Result<Vec<bool>>>()?;
            to_array(shape, values)
        };

        let tensors = PackedTensors {
            tokens: int64(Channel::Tokens)?,
            group_ids: int64(Channel::GroupIds)?,
            parent_ids: int64(Channel::ParentIds)?,
            input_pos: int64(Channel::InputPos)?,
            assistant_mask: flags(Channel::AssistantMask)?,
            logprobs: float32(Channel::Logprobs)?,
            advantages: float32(Channel::Advantages)?,
            weights: float32(Channel::Weights)?,
            deferred: flags(Channel::Deferred)?,
        };
        Ok(tensors)
    }
}

fn expect_dtype(channel: Channel, dtype: Dtype) -> Result<()> {
    if channel.dtype() != dtype {
        return Err(RlPackError::InvalidArgument(format!(
            "channel {channel} holds {:?}, not {:?}",
            channel.dtype(),
            dtype
        )));
    }
    Ok(())
}

fn to_array<T>(shape: (usize, usize), values: Vec<T>) -> Result<Array2<T>> {
    let actual = values.len();
    Array2::from_shape_vec(shape, values).map_err(|_| RlPackError::ShapeMismatch {
        expected: vec![shape.0, shape.1],
        actual: vec![actual],
    })
}
