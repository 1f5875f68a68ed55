use opcore::autograd::{bind_user_op, CaptureState, OpExprGradFunction, SavedTensors};
use opcore::op::OpExpr;
use opcore::{AttrMap, ComposedAttrMap, GradTuple, Result, Tensor};

use crate::functional;

#[derive(Debug, Default)]
pub struct DiagCaptureState {
    requires_grad: bool,
    diagonal: i32,
    saved: SavedTensors,
}

impl DiagCaptureState {
    pub fn diagonal(&self) -> i32 {
        self.diagonal
    }
}

impl CaptureState for DiagCaptureState {
    fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    fn saved_tensors(&self) -> &SavedTensors {
        &self.saved
    }

    fn saved_tensors_mut(&mut self) -> &mut SavedTensors {
        &mut self.saved
    }
}

/// Routes `dy` of `diag` through the `diag_grad` operator.
#[derive(Debug, Default)]
pub struct DiagGrad {
    base_attrs: AttrMap,
}

impl OpExprGradFunction for DiagGrad {
    type State = DiagCaptureState;

    fn init(&mut self, op: &dyn OpExpr) -> Result<()> {
        self.base_attrs = bind_user_op(op)?.base_attrs();
        Ok(())
    }

    fn capture(
        &self,
        state: &mut DiagCaptureState,
        inputs: &[Tensor],
        _outputs: &[Tensor],
        attrs: &AttrMap,
    ) -> Result<()> {
        state.requires_grad = inputs[0].requires_grad_flag();
        if !state.requires_grad {
            return Ok(());
        }
        state.diagonal = ComposedAttrMap::new(attrs, &self.base_attrs).get_attr("diagonal")?;
        state.saved.save(inputs[0].clone());
        Ok(())
    }

    fn apply(
        &self,
        state: &DiagCaptureState,
        out_grads: &[Tensor],
        in_grads: &mut GradTuple,
    ) -> Result<()> {
        let x = state.saved.get(0)?;
        in_grads[0] = Some(functional::diag_grad(&out_grads[0], x, state.diagonal)?);
        Ok(())
    }
}
