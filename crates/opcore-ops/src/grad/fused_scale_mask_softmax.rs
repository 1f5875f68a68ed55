use opcore::autograd::{bind_user_op, CaptureState, OpExprGradFunction, SavedTensors};
use opcore::op::OpExpr;
use opcore::{AttrMap, ComposedAttrMap, GradTuple, Result, Tensor};

use crate::functional;

/// Saved slots: `0` is the forward output `y`, `1` is the mask.
#[derive(Debug, Default)]
pub struct FusedScaleMaskSoftmaxCaptureState {
    requires_grad: bool,
    scale_value: f32,
    saved: SavedTensors,
}

impl FusedScaleMaskSoftmaxCaptureState {
    pub fn scale_value(&self) -> f32 {
        self.scale_value
    }
}

impl CaptureState for FusedScaleMaskSoftmaxCaptureState {
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

#[derive(Debug, Default)]
pub struct FusedScaleMaskSoftmaxGrad {
    base_attrs: AttrMap,
}

impl OpExprGradFunction for FusedScaleMaskSoftmaxGrad {
    type State = FusedScaleMaskSoftmaxCaptureState;

    fn init(&mut self, op: &dyn OpExpr) -> Result<()> {
        self.base_attrs = bind_user_op(op)?.base_attrs();
        Ok(())
    }

    fn capture(
        &self,
        state: &mut FusedScaleMaskSoftmaxCaptureState,
        inputs: &[Tensor],
        outputs: &[Tensor],
        attrs: &AttrMap,
    ) -> Result<()> {
        state.requires_grad = inputs[0].requires_grad_flag();
        if !state.requires_grad {
            return Ok(());
        }
        state.scale_value =
            ComposedAttrMap::new(attrs, &self.base_attrs).get_attr("scale_value")?;
        state.saved.save(outputs[0].clone());
        state.saved.save(inputs[1].clone());
        Ok(())
    }

    fn apply(
        &self,
        state: &FusedScaleMaskSoftmaxCaptureState,
        out_grads: &[Tensor],
        in_grads: &mut GradTuple,
    ) -> Result<()> {
        let y = state.saved.get(0)?;
        let mask = state.saved.get(1)?;
        in_grads[0] = Some(functional::fused_scale_mask_softmax_grad(
            y,
            &out_grads[0],
            mask,
            state.scale_value,
        )?);
        Ok(())
    }
}
