//! Gradient functions for the reference operators.

mod diag;
mod fused_scale_mask_softmax;

pub use diag::{DiagCaptureState, DiagGrad};
pub use fused_scale_mask_softmax::{FusedScaleMaskSoftmaxCaptureState, FusedScaleMaskSoftmaxGrad};
