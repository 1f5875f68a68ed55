//! Per-invocation capture state recorded during forward and consumed during backward.

use std::any::Any;

use crate::error::{OpError, Result};
use crate::tensor::Tensor;

/// Ordered saved-tensor slots. Slot indices follow save order.
#[derive(Debug, Default)]
pub struct SavedTensors {
    slots: Vec<Tensor>,
    released: bool,
}

impl SavedTensors {
    /// Retains `tensor` and returns its slot index.
    pub fn save(&mut self, tensor: Tensor) -> usize {
        self.slots.push(tensor);
        self.slots.len() - 1
    }

    pub fn get(&self, index: usize) -> Result<&Tensor> {
        if self.released {
            return Err(OpError::InvalidCaptureState(
                "saved tensors were released".into(),
            ));
        }
        self.slots.get(index).ok_or_else(|| {
            OpError::InvalidCaptureState(format!(
                "saved tensor index {index} out of range ({} saved)",
                self.slots.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.slots.iter()
    }

    /// Drops every retained tensor handle.
    pub fn release(&mut self) {
        self.slots = Vec::new();
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

/// Record a gradient function fills in `capture` and reads back in `apply`.
pub trait CaptureState: Default + Send + 'static {
    fn requires_grad(&self) -> bool;
    fn saved_tensors(&self) -> &SavedTensors;
    fn saved_tensors_mut(&mut self) -> &mut SavedTensors;
}

/// Object-safe view of a [`CaptureState`].
pub trait ErasedCaptureState: Send {
    fn requires_grad(&self) -> bool;
    fn saved_tensors(&self) -> &SavedTensors;
    fn saved_tensors_mut(&mut self) -> &mut SavedTensors;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<S: CaptureState> ErasedCaptureState for S {
    fn requires_grad(&self) -> bool {
        CaptureState::requires_grad(self)
    }

    fn saved_tensors(&self) -> &SavedTensors {
        CaptureState::saved_tensors(self)
    }

    fn saved_tensors_mut(&mut self) -> &mut SavedTensors {
        CaptureState::saved_tensors_mut(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
