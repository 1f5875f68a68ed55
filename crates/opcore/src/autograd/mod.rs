//! Gradient functions: capture forward state, apply it to upstream gradients.

pub mod capture;
mod closure;
mod engine;
pub mod grad_fn;

pub use capture::{CaptureState, ErasedCaptureState, SavedTensors};
pub use closure::{CapturedGrad, GradStage};
pub use engine::{forward, forward_with, ForwardResult};
pub use grad_fn::{bind_user_op, downcast_grad_fn, erase_grad_fn, ErasedGradFunction, OpExprGradFunction};
