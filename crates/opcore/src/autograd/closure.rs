use std::fmt;
use std::sync::Arc;

use tracing::trace;

use super::capture::{CaptureState, ErasedCaptureState, SavedTensors};
use super::grad_fn::ErasedGradFunction;
use crate::attr::AttrMap;
use crate::error::{OpError, Result};
use crate::tensor::{GradTuple, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradStage {
    /// Created, nothing captured yet.
    Pending,
    Captured,
    /// Applied once; saved tensors have been released.
    Released,
}

/// One forward invocation's capture state bound to its gradient function.
///
/// Enforces a single capture followed by a single apply. Saved tensors are released as soon
/// as apply succeeds; a failed capture or apply leaves the closure unchanged.
pub struct CapturedGrad {
    grad_fn: Arc<dyn ErasedGradFunction>,
    state: Box<dyn ErasedCaptureState>,
    stage: GradStage,
}

impl CapturedGrad {
    pub fn new(grad_fn: Arc<dyn ErasedGradFunction>) -> Self {
        let state = grad_fn.new_state();
        CapturedGrad {
            grad_fn,
            state,
            stage: GradStage::Pending,
        }
    }

    pub fn op_type_name(&self) -> &str {
        self.grad_fn.op_type_name()
    }

    pub fn stage(&self) -> GradStage {
        self.stage
    }

    pub fn requires_grad(&self) -> bool {
        self.state.requires_grad()
    }

    pub fn saved_tensors(&self) -> &SavedTensors {
        self.state.saved_tensors()
    }

    /// Concrete capture state, when `S` is the gradient function's state type.
    pub fn state<S: CaptureState>(&self) -> Option<&S> {
        self.state.as_any().downcast_ref::<S>()
    }

    pub fn capture(&mut self, inputs: &[Tensor], outputs: &[Tensor], attrs: &AttrMap) -> Result<()> {
        if self.stage != GradStage::Pending {
            return Err(OpError::InvalidCaptureState(format!(
                "'{}' was already captured for this invocation",
                self.op_type_name()
            )));
        }
        self.grad_fn
            .capture(self.state.as_mut(), inputs, outputs, attrs)?;
        self.stage = GradStage::Captured;
        trace!(
            op_type = self.op_type_name(),
            requires_grad = self.requires_grad(),
            saved = self.saved_tensors().len(),
            "captured forward state"
        );
        Ok(())
    }

    /// Produces one gradient entry per operator input.
    pub fn apply(&mut self, out_grads: &[Tensor]) -> Result<GradTuple> {
        match self.stage {
            GradStage::Pending => {
                return Err(OpError::InvalidCaptureState(format!(
                    "'{}' applied before capture",
                    self.op_type_name()
                )))
            }
            GradStage::Released => {
                return Err(OpError::SavedTensorsReleased {
                    op_type: self.op_type_name().to_string(),
                })
            }
            GradStage::Captured => {}
        }
        let in_grads = self.grad_fn.apply(self.state.as_ref(), out_grads)?;
        self.state.saved_tensors_mut().release();
        self.stage = GradStage::Released;
        trace!(op_type = self.op_type_name(), "applied gradient function");
        Ok(in_grads)
    }
}

impl fmt::Debug for CapturedGrad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedGrad")
            .field("op_type", &self.op_type_name())
            .field("stage", &self.stage)
            .field("requires_grad", &self.requires_grad())
            .finish()
    }
}
