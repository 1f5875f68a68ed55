//! Gradient-function contract and its type-erased wrapper.

use std::any::Any;

use smallvec::smallvec;

use super::capture::{CaptureState, ErasedCaptureState};
use crate::attr::AttrMap;
use crate::error::{ensure_arity, OpError, Result};
use crate::op::{OpExpr, UserOpExpr};
use crate::tensor::{GradTuple, Tensor};

/// Differentiation rule for one operator type.
///
/// `init` runs once per operator template. `capture` runs during forward with a fresh
/// [`Self::State`], and `apply` runs during backward on the same state. The wrapper returned
/// by [`erase_grad_fn`] checks arities, presizes `in_grads` to the input arity and skips
/// `apply` entirely when the state does not require grad.
pub trait OpExprGradFunction: Send + Sync + 'static {
    type State: CaptureState;

    fn init(&mut self, op: &dyn OpExpr) -> Result<()>;

    fn capture(
        &self,
        state: &mut Self::State,
        inputs: &[Tensor],
        outputs: &[Tensor],
        attrs: &AttrMap,
    ) -> Result<()>;

    /// Writes gradients into the positions of `in_grads` matching differentiable inputs.
    fn apply(
        &self,
        state: &Self::State,
        out_grads: &[Tensor],
        in_grads: &mut GradTuple,
    ) -> Result<()>;
}

/// Downcasts a template to [`UserOpExpr`], failing with [`OpError::ClassMismatch`].
pub fn bind_user_op(op: &dyn OpExpr) -> Result<&UserOpExpr> {
    op.as_any()
        .downcast_ref::<UserOpExpr>()
        .ok_or(OpError::ClassMismatch {
            expected: UserOpExpr::KIND,
            actual: op.kind(),
        })
}

/// Type-erased gradient function as stored in registries and expressions.
pub trait ErasedGradFunction: Send + Sync {
    fn op_type_name(&self) -> &str;

    fn is_initialized(&self) -> bool;

    fn init(&mut self, op: &dyn OpExpr) -> Result<()>;

    /// Fresh, empty capture state for one invocation.
    fn new_state(&self) -> Box<dyn ErasedCaptureState>;

    fn capture(
        &self,
        state: &mut dyn ErasedCaptureState,
        inputs: &[Tensor],
        outputs: &[Tensor],
        attrs: &AttrMap,
    ) -> Result<()>;

    fn apply(&self, state: &dyn ErasedCaptureState, out_grads: &[Tensor]) -> Result<GradTuple>;

    fn as_any(&self) -> &dyn Any;
}

struct Signature {
    op_type: String,
    input_arity: usize,
    output_arity: usize,
    differentiable: Vec<bool>,
}

struct GradFunctionWrapper<G: OpExprGradFunction> {
    inner: G,
    registered_as: String,
    signature: Option<Signature>,
}

/// Wraps a concrete gradient function registered under `name`.
pub fn erase_grad_fn<G: OpExprGradFunction>(
    name: impl Into<String>,
    grad_fn: G,
) -> Box<dyn ErasedGradFunction> {
    Box::new(GradFunctionWrapper {
        inner: grad_fn,
        registered_as: name.into(),
        signature: None,
    })
}

/// Borrows the concrete gradient function behind an erased handle.
pub fn downcast_grad_fn<G: OpExprGradFunction>(grad_fn: &dyn ErasedGradFunction) -> Option<&G> {
    grad_fn
        .as_any()
        .downcast_ref::<GradFunctionWrapper<G>>()
        .map(|wrapper| &wrapper.inner)
}

impl<G: OpExprGradFunction> GradFunctionWrapper<G> {
    fn signature(&self) -> Result<&Signature> {
        self.signature.as_ref().ok_or_else(|| {
            OpError::InvalidCaptureState(format!(
                "gradient function '{}' used before init",
                self.registered_as
            ))
        })
    }

    fn typed_state<'s>(&self, state: &'s dyn ErasedCaptureState) -> Result<&'s G::State> {
        state.as_any().downcast_ref::<G::State>().ok_or_else(|| {
            OpError::InvalidCaptureState(format!(
                "capture state type mismatch for '{}'",
                self.registered_as
            ))
        })
    }
}

impl<G: OpExprGradFunction> ErasedGradFunction for GradFunctionWrapper<G> {
    fn op_type_name(&self) -> &str {
        self.signature
            .as_ref()
            .map_or(self.registered_as.as_str(), |sig| sig.op_type.as_str())
    }

    fn is_initialized(&self) -> bool {
        self.signature.is_some()
    }

    fn init(&mut self, op: &dyn OpExpr) -> Result<()> {
        self.inner.init(op)?;
        let differentiable = match op.as_any().downcast_ref::<UserOpExpr>() {
            Some(user_op) => user_op.schema().differentiable_inputs(),
            None => vec![true; op.input_arity()],
        };
        self.signature = Some(Signature {
            op_type: op.op_type_name().to_string(),
            input_arity: op.input_arity(),
            output_arity: op.output_arity(),
            differentiable,
        });
        Ok(())
    }

    fn new_state(&self) -> Box<dyn ErasedCaptureState> {
        Box::<G::State>::default()
    }

    fn capture(
        &self,
        state: &mut dyn ErasedCaptureState,
        inputs: &[Tensor],
        outputs: &[Tensor],
        attrs: &AttrMap,
    ) -> Result<()> {
        let sig = self.signature()?;
        ensure_arity(&sig.op_type, "inputs", sig.input_arity, inputs.len())?;
        ensure_arity(&sig.op_type, "outputs", sig.output_arity, outputs.len())?;
        let slot = state
            .as_any_mut()
            .downcast_mut::<G::State>()
            .ok_or_else(|| {
                OpError::InvalidCaptureState(format!(
                    "capture state type mismatch for '{}'",
                    sig.op_type
                ))
            })?;
        // Capture into a scratch record so a failure leaves `state` untouched.
        let mut fresh = G::State::default();
        self.inner.capture(&mut fresh, inputs, outputs, attrs)?;
        *slot = fresh;
        Ok(())
    }

    fn apply(&self, state: &dyn ErasedCaptureState, out_grads: &[Tensor]) -> Result<GradTuple> {
        let sig = self.signature()?;
        ensure_arity(&sig.op_type, "output gradients", sig.output_arity, out_grads.len())?;
        let typed = self.typed_state(state)?;
        let mut in_grads: GradTuple = smallvec![None; sig.input_arity];
        if !CaptureState::requires_grad(typed) {
            return Ok(in_grads);
        }
        if CaptureState::saved_tensors(typed).is_released() {
            return Err(OpError::SavedTensorsReleased {
                op_type: sig.op_type.clone(),
            });
        }
        self.inner.apply(typed, out_grads, &mut in_grads)?;
        ensure_arity(&sig.op_type, "input gradients", sig.input_arity, in_grads.len())?;
        for (grad, differentiable) in in_grads.iter_mut().zip(&sig.differentiable) {
            if !differentiable {
                *grad = None;
            }
        }
        Ok(in_grads)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
