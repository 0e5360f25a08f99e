//! Tensor values exchanged with the inference session
//!
//! A [`Tensor`] couples a raw byte buffer with a dtype, a shape, and a device
//! tag. Device-resident tensors wrap runtime-owned memory that must be
//! released exactly once; the release state is tracked explicitly instead of
//! relying on `Drop`, so that every hand-off between the feed, the decode
//! loop, and the output map stays a visible ownership transfer. Dropping an
//! unreleased device tensor is reported to the [`ReleaseLedger`] as a leak.

mod dtype;
mod ledger;

pub use dtype::DType;
pub use ledger::ReleaseLedger;

use crate::{Error, Result};
use std::sync::Arc;
use tracing::warn;

/// Where a tensor's backing buffer lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Ordinary host memory
    Host,
    /// Runtime-owned device memory requiring explicit release
    Gpu,
}

/// Explicit ownership state of the backing buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Owned,
    Released,
}

/// A tensor with a single owner at all times.
///
/// Deliberately not `Clone`: duplicating a handle to a buffer that must be
/// released exactly once would defeat the ownership tracking. Transfer is a
/// Rust move; termination is [`Tensor::release`].
#[derive(Debug)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    device: Device,
    data: Vec<u8>,
    state: BufferState,
    ledger: Option<Arc<ReleaseLedger>>,
}

impl Tensor {
    /// Create a host tensor from raw bytes
    pub fn from_bytes(data: Vec<u8>, dtype: DType, shape: Vec<usize>) -> Result<Self> {
        let expected_bytes = shape.iter().product::<usize>() * dtype.size_of();
        if data.len() != expected_bytes {
            return Err(Error::ShapeMismatch {
                expected: vec![expected_bytes],
                got: vec![data.len()],
            });
        }

        Ok(Self {
            dtype,
            shape,
            device: Device::Host,
            data,
            state: BufferState::Owned,
            ledger: None,
        })
    }

    /// Create a host tensor holding 64-bit token ids, mask bits, or positions
    pub fn from_i64(values: &[i64], shape: Vec<usize>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if values.len() != numel {
            return Err(Error::ShapeMismatch {
                expected: vec![numel],
                got: vec![values.len()],
            });
        }
        let data = bytemuck::cast_slice::<i64, u8>(values).to_vec();
        Self::from_bytes(data, DType::I64, shape)
    }

    /// Create an all-ones i64 tensor (attention masks)
    pub fn ones_i64(shape: Vec<usize>) -> Self {
        let numel: usize = shape.iter().product();
        let values = vec![1i64; numel];
        // Shape and length agree by construction.
        Self::from_i64(&values, shape).expect("ones tensor shape")
    }

    /// Create a zero-element placeholder (empty KV cache slots)
    pub fn empty(dtype: DType, shape: Vec<usize>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), 0);
        Self {
            dtype,
            shape,
            device: Device::Host,
            data: Vec::new(),
            state: BufferState::Owned,
            ledger: None,
        }
    }

    /// Create a host tensor from f32 values, converting to the target dtype
    pub fn from_f32(values: &[f32], dtype: DType, shape: Vec<usize>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if values.len() != numel {
            return Err(Error::ShapeMismatch {
                expected: vec![numel],
                got: vec![values.len()],
            });
        }

        let bytes = match dtype {
            DType::F32 => bytemuck::cast_slice::<f32, u8>(values).to_vec(),
            DType::F16 => values
                .iter()
                .flat_map(|&f| half::f16::from_f32(f).to_le_bytes())
                .collect(),
            DType::I64 => return Err(Error::UnsupportedDType(dtype.to_string())),
        };

        Self::from_bytes(bytes, dtype, shape)
    }

    /// Wrap a runtime-owned device buffer. Registers the allocation with the
    /// ledger; the buffer must be released exactly once.
    pub fn device_resident(
        data: Vec<u8>,
        dtype: DType,
        shape: Vec<usize>,
        ledger: Arc<ReleaseLedger>,
    ) -> Self {
        ledger.note_alloc();
        Self {
            dtype,
            shape,
            device: Device::Gpu,
            data,
            state: BufferState::Owned,
            ledger: Some(ledger),
        }
    }

    /// Get dtype
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get device tag
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Raw bytes of the backing buffer (empty once released)
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Whether the backing buffer has been released
    pub fn is_released(&self) -> bool {
        self.state == BufferState::Released
    }

    /// Release the backing buffer. Exactly one call per tensor; a second call
    /// is counted on the ledger and logged instead of corrupting state.
    pub fn release(&mut self) {
        match self.state {
            BufferState::Owned => {
                self.state = BufferState::Released;
                self.data = Vec::new();
                if self.device == Device::Gpu {
                    if let Some(ledger) = &self.ledger {
                        ledger.note_release();
                    }
                }
            }
            BufferState::Released => {
                if let Some(ledger) = &self.ledger {
                    ledger.note_double_release();
                }
                warn!("double release of {} tensor {:?}", self.dtype, self.shape);
            }
        }
    }

    /// Decode the i64 values of an integer tensor
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        if self.dtype != DType::I64 {
            return Err(Error::UnsupportedDType(self.dtype.to_string()));
        }
        Ok(self
            .data
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect())
    }

    /// Decode a contiguous element range of a float tensor to f32
    pub fn f32_range(&self, start: usize, len: usize) -> Result<Vec<f32>> {
        if start + len > self.numel() {
            return Err(Error::ShapeMismatch {
                expected: vec![self.numel()],
                got: vec![start + len],
            });
        }

        let elem = self.dtype.size_of();
        let bytes = &self.data[start * elem..(start + len) * elem];

        match self.dtype {
            DType::F32 => Ok(bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()),
            DType::F16 => Ok(bytes
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect()),
            DType::I64 => Err(Error::UnsupportedDType(self.dtype.to_string())),
        }
    }

    /// Decode the whole tensor to f32 (float tensors only)
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.f32_range(0, self.numel())
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        if self.device == Device::Gpu && self.state == BufferState::Owned {
            if let Some(ledger) = &self.ledger {
                ledger.note_leak();
            }
            warn!(
                "device tensor {:?} dropped without release ({} bytes)",
                self.shape,
                self.data.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_i64_roundtrip() {
        let t = Tensor::from_i64(&[5, 6, 7], vec![1, 3]).unwrap();
        assert_eq!(t.dtype(), DType::I64);
        assert_eq!(t.shape(), &[1, 3]);
        assert_eq!(t.to_i64_vec().unwrap(), vec![5, 6, 7]);
    }

    #[test]
    fn test_ones_mask() {
        let t = Tensor::ones_i64(vec![1, 4]);
        assert_eq!(t.to_i64_vec().unwrap(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_shape_mismatch() {
        assert!(Tensor::from_i64(&[1, 2], vec![1, 3]).is_err());
    }

    #[test]
    fn test_f16_roundtrip() {
        let t = Tensor::from_f32(&[1.0, -2.5, 0.0], DType::F16, vec![3]).unwrap();
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, -2.5, 0.0]);
    }

    #[test]
    fn test_f32_range() {
        let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], DType::F32, vec![2, 2]).unwrap();
        assert_eq!(t.f32_range(2, 2).unwrap(), vec![3.0, 4.0]);
        assert!(t.f32_range(3, 2).is_err());
    }

    #[test]
    fn test_release_clears_buffer() {
        let mut t = Tensor::from_i64(&[1], vec![1, 1]).unwrap();
        assert!(!t.is_released());
        t.release();
        assert!(t.is_released());
        assert!(t.as_bytes().is_empty());
    }

    #[test]
    fn test_device_release_once() {
        let ledger = Arc::new(ReleaseLedger::new());
        let mut t =
            Tensor::device_resident(vec![0u8; 8], DType::F32, vec![2], Arc::clone(&ledger));
        assert_eq!(ledger.allocated(), 1);
        assert_eq!(ledger.live(), 1);

        t.release();
        assert_eq!(ledger.released(), 1);
        assert_eq!(ledger.live(), 0);

        // A second release is counted, not UB.
        t.release();
        assert_eq!(ledger.double_released(), 1);
        assert_eq!(ledger.released(), 1);
    }

    #[test]
    fn test_device_drop_without_release_is_a_leak() {
        let ledger = Arc::new(ReleaseLedger::new());
        {
            let _t =
                Tensor::device_resident(vec![0u8; 4], DType::F16, vec![2], Arc::clone(&ledger));
        }
        assert_eq!(ledger.leaked(), 1);
        assert_eq!(ledger.live(), 0);
    }
}
