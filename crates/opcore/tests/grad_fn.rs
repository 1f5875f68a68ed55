use std::sync::Arc;

use anyhow::Result;
use opcore::autograd::{
    bind_user_op, forward_with, CaptureState, CapturedGrad, ErasedGradFunction, GradStage,
    OpExprGradFunction, SavedTensors,
};
use opcore::device::Placement;
use opcore::kernel::{KernelComputeContext, KernelInferContext, OpKernel};
use opcore::op::{FunctionOpExpr, OpExpr, OpSchema, UserOpExpr};
use opcore::registry::{OpRegistry, Registrar};
use opcore::{AttrMap, ComposedAttrMap, ErrorKind, GradTuple, OpError, Shape, Tensor};
use proptest::prelude::*;

/// `y = x * factor` where `mask` positions equal to zero are dropped.
fn masked_scale_schema() -> OpSchema {
    OpSchema::new("masked_scale")
        .input("x")
        .non_differentiable_input("mask")
        .output("y")
        .attr("factor", 2.0f32)
}

struct MaskedScaleKernel;

impl OpKernel for MaskedScaleKernel {
    fn infer_shape(&self, ctx: &mut KernelInferContext<'_>) -> opcore::Result<()> {
        let desc = ctx.tensor_desc("x", 0)?.clone();
        *ctx.mut_tensor_desc("y", 0)? = desc;
        Ok(())
    }

    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> opcore::Result<()> {
        use opcore::kernel::OpInfo;
        let factor = ctx.attr::<f32>("factor")?;
        let x = ctx.tensor("x", 0)?.to_vec::<f32>()?;
        let mask = ctx.tensor("mask", 0)?.to_vec::<i8>()?;
        let y = ctx.tensor_mut("y", 0)?.data_mut::<f32>()?;
        for ((out, value), keep) in y.iter_mut().zip(&x).zip(&mask) {
            *out = if *keep != 0 { value * factor } else { 0.0 };
        }
        Ok(())
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct MaskedScaleState {
    requires_grad: bool,
    factor: f32,
    saved: SavedTensors,
}

impl CaptureState for MaskedScaleState {
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

#[derive(Default)]
struct MaskedScaleGrad {
    base_attrs: AttrMap,
}

impl OpExprGradFunction for MaskedScaleGrad {
    type State = MaskedScaleState;

    fn init(&mut self, op: &dyn OpExpr) -> opcore::Result<()> {
        self.base_attrs = bind_user_op(op)?.base_attrs();
        Ok(())
    }

    fn capture(
        &self,
        state: &mut MaskedScaleState,
        inputs: &[Tensor],
        _outputs: &[Tensor],
        attrs: &AttrMap,
    ) -> opcore::Result<()> {
        state.requires_grad = inputs[0].requires_grad_flag();
        if !state.requires_grad {
            return Ok(());
        }
        state.factor = ComposedAttrMap::new(attrs, &self.base_attrs).get_attr("factor")?;
        state.saved.save(inputs[1].clone());
        Ok(())
    }

    fn apply(
        &self,
        state: &MaskedScaleState,
        out_grads: &[Tensor],
        in_grads: &mut GradTuple,
    ) -> opcore::Result<()> {
        let mask = state.saved.get(0)?.to_vec::<i8>()?;
        let dy = out_grads[0].to_vec::<f32>()?;
        let dx = dy
            .iter()
            .zip(&mask)
            .map(|(g, keep)| if *keep != 0 { g * state.factor } else { 0.0 })
            .collect();
        in_grads[0] = Some(Tensor::from_vec(out_grads[0].shape().clone(), dx)?);
        // Deliberately also fills the mask slot; the runtime must discard it.
        in_grads[1] = Some(out_grads[0].clone());
        Ok(())
    }
}

fn registry() -> Result<Arc<OpRegistry>> {
    let mut registrar = Registrar::new();
    registrar.register_schema(masked_scale_schema())?;
    registrar.register_kernel("masked_scale", || MaskedScaleKernel)?;
    registrar.register_grad_fn("masked_scale", MaskedScaleGrad::default)?;
    Ok(Arc::new(registrar.freeze()))
}

fn expr(attrs: AttrMap) -> Result<UserOpExpr> {
    Ok(UserOpExpr::from_schema(
        Arc::new(masked_scale_schema()),
        "masked_scale0",
        attrs,
        Placement::default(),
    )?)
}

fn inputs(x_requires_grad: bool) -> Result<Vec<Tensor>> {
    let x = Tensor::from_vec(Shape::new([4]), vec![1.0f32, 2.0, 3.0, 4.0])?
        .requires_grad(x_requires_grad);
    let mask = Tensor::from_vec(Shape::new([4]), vec![1i8, 0, 1, 1])?;
    Ok(vec![x, mask])
}

fn ones(len: usize) -> Tensor {
    Tensor::from_vec(Shape::new([len]), vec![1.0f32; len]).expect("valid shape")
}

fn captured(registry: &OpRegistry, expr: &UserOpExpr) -> Result<CapturedGrad> {
    Ok(CapturedGrad::new(expr.grad_fn(registry)?))
}

#[test]
fn init_rejects_non_user_expressions() -> Result<()> {
    let registry = registry()?;
    let mut grad_fn = registry.create_grad_fn("masked_scale")?;
    let function = FunctionOpExpr::new("host_identity", 2, 1, |inputs| {
        Ok(inputs[..1].iter().cloned().collect())
    });
    let err = grad_fn.init(&function).unwrap_err();
    assert_eq!(
        err,
        OpError::ClassMismatch {
            expected: "UserOpExpr",
            actual: "FunctionOpExpr"
        }
    );
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!grad_fn.is_initialized());
    Ok(())
}

#[test]
fn capture_then_apply_reproduces_gradient() -> Result<()> {
    let registry = registry()?;
    let expr = expr(AttrMap::builder().set("factor", 3.0f32).build())?;
    let mut grad = captured(&registry, &expr)?;
    let inputs = inputs(true)?;
    let outputs = [ones(4)];

    grad.capture(&inputs, &outputs, &AttrMap::new())?;
    assert!(grad.requires_grad());
    assert_eq!(grad.state::<MaskedScaleState>().map(|s| s.factor), Some(3.0));
    assert!(grad.saved_tensors().get(0)?.shares_storage(&inputs[1]));

    let in_grads = grad.apply(&[ones(4)])?;
    assert_eq!(in_grads.len(), 2);
    let dx = in_grads[0].as_ref().expect("x receives a gradient");
    assert_eq!(dx.to_vec::<f32>()?, vec![3.0, 0.0, 3.0, 3.0]);
    assert!(in_grads[1].is_none(), "mask is not differentiable");

    assert_eq!(grad.stage(), GradStage::Released);
    assert!(grad.saved_tensors().is_released());
    assert_eq!(inputs[1].handle_count(), 1);
    assert_eq!(
        grad.apply(&[ones(4)]).unwrap_err(),
        OpError::SavedTensorsReleased {
            op_type: "masked_scale".into()
        }
    );
    Ok(())
}

#[test]
fn call_site_attrs_shadow_bound_defaults() -> Result<()> {
    let registry = registry()?;
    let expr = expr(AttrMap::new())?;
    let mut grad = captured(&registry, &expr)?;
    let overrides = AttrMap::builder().set("factor", 0.5f32).build();
    grad.capture(&inputs(true)?, &[ones(4)], &overrides)?;
    let in_grads = grad.apply(&[ones(4)])?;
    let dx = in_grads[0].as_ref().expect("x receives a gradient");
    assert_eq!(dx.to_vec::<f32>()?, vec![0.5, 0.0, 0.5, 0.5]);
    Ok(())
}

#[test]
fn state_machine_rejects_out_of_order_calls() -> Result<()> {
    let registry = registry()?;
    let expr = expr(AttrMap::new())?;
    let mut grad = captured(&registry, &expr)?;

    let err = grad.apply(&[ones(4)]).unwrap_err();
    assert!(matches!(err, OpError::InvalidCaptureState(_)));

    grad.capture(&inputs(true)?, &[ones(4)], &AttrMap::new())?;
    let err = grad
        .capture(&inputs(true)?, &[ones(4)], &AttrMap::new())
        .unwrap_err();
    assert!(matches!(err, OpError::InvalidCaptureState(_)));
    assert_eq!(grad.stage(), GradStage::Captured);
    Ok(())
}

#[test]
fn arity_violations_leave_the_closure_usable() -> Result<()> {
    let registry = registry()?;
    let expr = expr(AttrMap::new())?;
    let mut grad = captured(&registry, &expr)?;

    let err = grad
        .capture(&inputs(true)?, &[ones(4), ones(4)], &AttrMap::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArityViolation);
    assert_eq!(grad.stage(), GradStage::Pending);

    grad.capture(&inputs(true)?, &[ones(4)], &AttrMap::new())?;
    let err = grad.apply(&[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArityViolation);
    assert_eq!(grad.stage(), GradStage::Captured);
    assert!(!grad.saved_tensors().is_released());

    assert!(grad.apply(&[ones(4)])?[0].is_some());
    Ok(())
}

#[test]
fn failed_capture_changes_nothing() -> Result<()> {
    let registry = registry()?;
    let expr = expr(AttrMap::new())?;
    let mut grad = captured(&registry, &expr)?;
    let wrong_type = AttrMap::builder().set("factor", 3i32).build();

    let err = grad
        .capture(&inputs(true)?, &[ones(4)], &wrong_type)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Attribute);
    assert_eq!(grad.stage(), GradStage::Pending);
    assert!(grad.saved_tensors().is_empty());
    assert!(!grad.requires_grad());

    grad.capture(&inputs(true)?, &[ones(4)], &AttrMap::new())?;
    assert_eq!(grad.saved_tensors().len(), 1);
    Ok(())
}

#[test]
fn forward_records_closure_only_when_needed() -> Result<()> {
    let registry = registry()?;
    let expr = expr(AttrMap::new())?;

    let plain = forward_with(&registry, &expr, &inputs(false)?, &AttrMap::new())?;
    assert!(plain.grad.is_none());
    assert!(!plain.outputs[0].requires_grad_flag());
    assert_eq!(plain.outputs[0].to_vec::<f32>()?, vec![2.0, 0.0, 6.0, 8.0]);

    let mut mask_only = inputs(false)?;
    mask_only[1].set_requires_grad(true);
    assert!(forward_with(&registry, &expr, &mask_only, &AttrMap::new())?
        .grad
        .is_none());

    let tracked = forward_with(&registry, &expr, &inputs(true)?, &AttrMap::new())?;
    assert!(tracked.outputs[0].requires_grad_flag());
    let mut grad = tracked.grad.expect("closure recorded");
    assert_eq!(grad.stage(), GradStage::Captured);
    let in_grads = grad.apply(&[ones(4)])?;
    let dx = in_grads[0].as_ref().expect("x receives a gradient");
    assert_eq!(dx.to_vec::<f32>()?, vec![2.0, 0.0, 2.0, 2.0]);

    let first = expr.grad_fn(&registry)?;
    let second = expr.grad_fn(&registry)?;
    assert!(Arc::ptr_eq(&first, &second), "gradient function is memoized");
    assert!(Arc::ptr_eq(
        &expr.kernel_instance(&registry)?,
        &expr.kernel_instance(&registry)?
    ));
    assert_eq!(expr.kernel_instance(&registry)?.stats().computes, 3);
    Ok(())
}

proptest! {
    #[test]
    fn disabled_grad_yields_all_absent(values in prop::collection::vec(-10.0f32..10.0, 1..16)) {
        let registry = registry().expect("registry builds");
        let expr = expr(AttrMap::new()).expect("expression builds");
        let mut grad = captured(&registry, &expr).expect("grad fn initializes");
        let len = values.len();
        let x = Tensor::from_vec(Shape::new([len]), values.clone()).expect("x");
        let mask = Tensor::from_vec(Shape::new([len]), vec![1i8; len]).expect("mask");
        grad.capture(&[x, mask], &[ones(len)], &AttrMap::new()).expect("capture");
        prop_assert!(!grad.requires_grad());
        prop_assert!(grad.saved_tensors().is_empty());

        let dy = Tensor::from_vec(Shape::new([len]), values).expect("dy");
        let in_grads = grad.apply(&[dy]).expect("apply");
        prop_assert_eq!(in_grads.len(), 2);
        prop_assert!(in_grads.iter().all(Option::is_none));
    }
}
