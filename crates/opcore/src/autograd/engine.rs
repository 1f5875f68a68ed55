use tracing::debug;

use super::closure::CapturedGrad;
use crate::attr::AttrMap;
use crate::error::Result;
use crate::op::UserOpExpr;
use crate::registry::{current_registry, OpRegistry};
use crate::tensor::{Tensor, TensorTuple};

/// Outputs of one differentiable forward call.
#[derive(Debug)]
pub struct ForwardResult {
    pub outputs: TensorTuple,
    /// Present when at least one differentiable input required grad.
    pub grad: Option<CapturedGrad>,
}

/// Runs `expr` against the current registry and captures its gradient state when needed.
pub fn forward(expr: &UserOpExpr, inputs: &[Tensor], attrs: &AttrMap) -> Result<ForwardResult> {
    let registry = current_registry()?;
    forward_with(&registry, expr, inputs, attrs)
}

pub fn forward_with(
    registry: &OpRegistry,
    expr: &UserOpExpr,
    inputs: &[Tensor],
    attrs: &AttrMap,
) -> Result<ForwardResult> {
    let instance = expr.kernel_instance(registry)?;
    let mut outputs = instance.run(inputs, attrs)?;

    let differentiable = expr.schema().differentiable_inputs();
    let needs_grad = inputs
        .iter()
        .zip(&differentiable)
        .any(|(input, differentiable)| *differentiable && input.requires_grad_flag());
    if !needs_grad {
        return Ok(ForwardResult {
            outputs,
            grad: None,
        });
    }

    let mut grad = CapturedGrad::new(expr.grad_fn(registry)?);
    grad.capture(inputs, &outputs, attrs)?;
    for output in outputs.iter_mut() {
        output.set_requires_grad(true);
    }
    debug!(
        op_type = expr.schema().op_type(),
        saved = grad.saved_tensors().len(),
        "recorded gradient closure"
    );
    Ok(ForwardResult {
        outputs,
        grad: Some(grad),
    })
}
