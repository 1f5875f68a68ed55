//! Static tensor metadata produced by shape/dtype inference.

use serde::{Deserialize, Serialize};

use super::{DType, Shape};

/// Shape, element type and dynamic-shape flag of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    shape: Shape,
    dtype: DType,
    is_dynamic: bool,
}

impl TensorDesc {
    pub fn new(shape: impl Into<Shape>, dtype: DType) -> Self {
        TensorDesc {
            shape: shape.into(),
            dtype,
            is_dynamic: false,
        }
    }

    pub fn with_dynamic(mut self, is_dynamic: bool) -> Self {
        self.is_dynamic = is_dynamic;
        self
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn mut_shape(&mut self) -> &mut Shape {
        &mut self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn set_dtype(&mut self, dtype: DType) {
        self.dtype = dtype;
    }

    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic
    }

    pub fn set_dynamic(&mut self, is_dynamic: bool) {
        self.is_dynamic = is_dynamic;
    }

    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }
}
