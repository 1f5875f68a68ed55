//! Host-backed tensor handle passed to kernels and saved by gradient functions.

use std::fmt;
use std::sync::Arc;

use super::storage::{Element, TensorData};
use super::{DType, Shape, TensorDesc};
use crate::device::DeviceType;
use crate::error::{OpError, Result};

/// Reference-counted tensor handle.
///
/// Cloning shares the underlying buffer; the first write through a shared handle copies it
/// (`Arc::make_mut`), so a tensor kept alive in a saved-tensor slot never observes writes
/// made through another handle.
#[derive(Clone)]
pub struct Tensor {
    desc: TensorDesc,
    data: Arc<TensorData>,
    device: DeviceType,
    requires_grad: bool,
}

impl Tensor {
    /// Builds a tensor from raw values, validating the length against the shape.
    pub fn from_vec<T: Element>(shape: impl Into<Shape>, values: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        if values.len() != shape.num_elements() {
            return Err(OpError::shape_mismatch(format!(
                "tensor data length ({}) does not match shape {:?}",
                values.len(),
                shape
            )));
        }
        Ok(Tensor {
            desc: TensorDesc::new(shape, T::DTYPE),
            data: Arc::new(T::into_data(values)),
            device: DeviceType::Cpu,
            requires_grad: false,
        })
    }

    /// Returns a zero-initialized tensor matching `desc`.
    pub fn zeros(desc: TensorDesc) -> Self {
        let data = TensorData::zeros(desc.dtype(), desc.num_elements());
        Tensor {
            desc,
            data: Arc::new(data),
            device: DeviceType::Cpu,
            requires_grad: false,
        }
    }

    pub fn zeros_like(other: &Tensor) -> Self {
        Tensor::zeros(other.desc.clone()).on_device(other.device)
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        Tensor {
            desc: TensorDesc::new(Shape::scalar(), T::DTYPE),
            data: Arc::new(T::into_data(vec![value])),
            device: DeviceType::Cpu,
            requires_grad: false,
        }
    }

    /// Toggles gradient tracking.
    pub fn requires_grad(mut self, flag: bool) -> Self {
        self.requires_grad = flag;
        self
    }

    /// Returns the current gradient tracking flag.
    pub fn requires_grad_flag(&self) -> bool {
        self.requires_grad
    }

    pub fn set_requires_grad(&mut self, flag: bool) {
        self.requires_grad = flag;
    }

    pub fn on_device(mut self, device: DeviceType) -> Self {
        self.device = device;
        self
    }

    pub fn device(&self) -> DeviceType {
        self.device
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn shape(&self) -> &Shape {
        self.desc.shape()
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype()
    }

    pub fn len(&self) -> usize {
        self.desc.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the buffer as `T`, failing if the dtype differs.
    pub fn data<T: Element>(&self) -> Result<&[T]> {
        T::slice(&self.data).ok_or(OpError::DTypeMismatch {
            expected: T::DTYPE,
            actual: self.dtype(),
        })
    }

    /// Mutably borrows the buffer as `T`, detaching it from other handles first.
    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        let actual = self.dtype();
        T::slice_mut(Arc::make_mut(&mut self.data)).ok_or(OpError::DTypeMismatch {
            expected: T::DTYPE,
            actual,
        })
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.data::<T>()?.to_vec())
    }

    pub fn storage(&self) -> &TensorData {
        &self.data
    }

    /// Number of live handles sharing this buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", self.shape())
            .field("dtype", &self.dtype())
            .field("device", &self.device)
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Tensor::from_vec(Shape::new([2, 2]), vec![1.0f32; 3]).unwrap_err();
        assert!(matches!(err, OpError::ShapeMismatch(_)));
    }

    #[test]
    fn writes_detach_shared_buffers() {
        let original = Tensor::from_vec(Shape::new([2]), vec![1.0f32, 2.0]).unwrap();
        let mut alias = original.clone();
        assert!(alias.shares_storage(&original));
        assert_eq!(original.handle_count(), 2);

        alias.data_mut::<f32>().unwrap()[0] = 9.0;
        assert!(!alias.shares_storage(&original));
        assert_eq!(original.data::<f32>().unwrap(), &[1.0, 2.0]);
        assert_eq!(alias.data::<f32>().unwrap(), &[9.0, 2.0]);
    }

    #[test]
    fn typed_access_checks_dtype() {
        let tensor = Tensor::from_vec(Shape::new([1]), vec![3i32]).unwrap();
        let err = tensor.data::<f32>().unwrap_err();
        assert_eq!(
            err,
            OpError::DTypeMismatch {
                expected: DType::F32,
                actual: DType::I32
            }
        );
    }
}
