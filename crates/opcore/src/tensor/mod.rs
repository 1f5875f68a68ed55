//! Core tensor abstractions shared by kernels and gradient functions.
//!
//! The tensor module defines shapes, dtypes, static descriptors and the reference-counted
//! host tensor handle. Tensor tuples are small vectors since most operators take one to
//! three arguments.

mod desc;
pub mod dtype;
mod host_tensor;
pub mod shape;
pub mod storage;

use smallvec::SmallVec;

pub use desc::TensorDesc;
pub use dtype::DType;
pub use host_tensor::Tensor;
pub use shape::Shape;
pub use storage::{Element, FloatElement, TensorData};

/// Ordered tensors passed to or produced by one operator invocation.
pub type TensorTuple = SmallVec<[Tensor; 4]>;

/// Input gradients indexed by input position; `None` marks an absent gradient.
pub type GradTuple = SmallVec<[Option<Tensor>; 4]>;
