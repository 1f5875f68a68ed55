//! Typed entry points over [`opcore::functional::call`].
//!
//! Each wrapper resolves through the calling thread's current registry, so the reference
//! operators must be registered there (see [`crate::init`] and [`crate::registry`]).

use opcore::autograd::ForwardResult;
use opcore::{AttrMap, OpError, Result, Tensor, TensorTuple};

use crate::diag::{DIAG, DIAG_GRAD};
use crate::softmax::{FUSED_SCALE_MASK_SOFTMAX, FUSED_SCALE_MASK_SOFTMAX_GRAD};

fn single(op_type: &str, outputs: TensorTuple) -> Result<Tensor> {
    let arity = outputs.len();
    let mut outputs = outputs.into_iter();
    match (outputs.next(), arity) {
        (Some(out), 1) => Ok(out),
        _ => Err(OpError::ArityViolation {
            op_type: op_type.to_string(),
            what: "outputs",
            expected: 1,
            actual: arity,
        }),
    }
}

fn diag_attrs(diagonal: i32) -> AttrMap {
    AttrMap::builder().set("diagonal", diagonal).build()
}

fn softmax_attrs(scale_value: f32, mask_fill_value: f32) -> AttrMap {
    AttrMap::builder()
        .set("scale_value", scale_value)
        .set("mask_fill_value", mask_fill_value)
        .build()
}

pub fn diag(x: &Tensor, diagonal: i32) -> Result<Tensor> {
    let outputs = opcore::functional::call(DIAG, &[x.clone()], &diag_attrs(diagonal))?;
    single(DIAG, outputs)
}

/// `diag` with gradient capture when `x` requires grad.
pub fn diag_with_grad(x: &Tensor, diagonal: i32) -> Result<ForwardResult> {
    opcore::functional::call_with_grad(DIAG, &[x.clone()], &diag_attrs(diagonal))
}

pub fn diag_grad(dy: &Tensor, x: &Tensor, diagonal: i32) -> Result<Tensor> {
    let outputs =
        opcore::functional::call(DIAG_GRAD, &[dy.clone(), x.clone()], &diag_attrs(diagonal))?;
    single(DIAG_GRAD, outputs)
}

pub fn fused_scale_mask_softmax(
    x: &Tensor,
    mask: &Tensor,
    scale_value: f32,
    mask_fill_value: f32,
) -> Result<Tensor> {
    let outputs = opcore::functional::call(
        FUSED_SCALE_MASK_SOFTMAX,
        &[x.clone(), mask.clone()],
        &softmax_attrs(scale_value, mask_fill_value),
    )?;
    single(FUSED_SCALE_MASK_SOFTMAX, outputs)
}

pub fn fused_scale_mask_softmax_with_grad(
    x: &Tensor,
    mask: &Tensor,
    scale_value: f32,
    mask_fill_value: f32,
) -> Result<ForwardResult> {
    opcore::functional::call_with_grad(
        FUSED_SCALE_MASK_SOFTMAX,
        &[x.clone(), mask.clone()],
        &softmax_attrs(scale_value, mask_fill_value),
    )
}

pub fn fused_scale_mask_softmax_grad(
    y: &Tensor,
    dy: &Tensor,
    mask: &Tensor,
    scale_value: f32,
) -> Result<Tensor> {
    let attrs = AttrMap::builder().set("scale_value", scale_value).build();
    let outputs = opcore::functional::call(
        FUSED_SCALE_MASK_SOFTMAX_GRAD,
        &[y.clone(), dy.clone(), mask.clone()],
        &attrs,
    )?;
    single(FUSED_SCALE_MASK_SOFTMAX_GRAD, outputs)
}
