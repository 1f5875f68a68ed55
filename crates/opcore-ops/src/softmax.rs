//! Fused scale + mask + softmax over the last axis, and its backward.
//!
//! `y = softmax(mask ? x * scale_value : mask_fill_value)` row by row, where a non-zero `i8`
//! mask entry keeps the scaled logit. Both kernels cache the row layout derived from the
//! input shape, so a shape change rebuilds it.

use opcore::kernel::{
    downcast_cache, KernelCacheContext, KernelComputeContext, KernelInferContext, OpInfo,
    OpKernel, OpKernelCache, OpKernelState,
};
use opcore::tensor::FloatElement;
use opcore::{DType, OpError, OpSchema, Result, Tensor, TensorDesc};

pub const FUSED_SCALE_MASK_SOFTMAX: &str = "fused_scale_mask_softmax";
pub const FUSED_SCALE_MASK_SOFTMAX_GRAD: &str = "fused_scale_mask_softmax_grad";

pub fn fused_scale_mask_softmax_schema() -> OpSchema {
    OpSchema::new(FUSED_SCALE_MASK_SOFTMAX)
        .input("x")
        .non_differentiable_input("mask")
        .output("y")
        .attr("scale_value", 1.0f32)
        .attr("mask_fill_value", -10000.0f32)
}

pub fn fused_scale_mask_softmax_grad_schema() -> OpSchema {
    OpSchema::new(FUSED_SCALE_MASK_SOFTMAX_GRAD)
        .input("y")
        .input("dy")
        .non_differentiable_input("mask")
        .output("dx")
        .attr("scale_value", 1.0f32)
}

/// Rows x columns view of a tensor, softmax running along columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLayout {
    pub rows: usize,
    pub cols: usize,
}

impl RowLayout {
    pub fn of(desc: &TensorDesc) -> Self {
        let shape = desc.shape();
        RowLayout {
            rows: shape.leading_elements(),
            cols: shape.dims().last().copied().unwrap_or(1),
        }
    }

    fn rows_of<'a, T>(&self, values: &'a [T]) -> impl Iterator<Item = &'a [T]> {
        values.chunks(self.cols.max(1)).take(self.rows)
    }
}

fn check_mask(x: &TensorDesc, mask: &TensorDesc) -> Result<()> {
    if mask.dtype() != DType::I8 {
        return Err(OpError::DTypeMismatch {
            expected: DType::I8,
            actual: mask.dtype(),
        });
    }
    if mask.shape() != x.shape() {
        return Err(OpError::shape_mismatch(format!(
            "mask shape {:?} must match x shape {:?}",
            mask.shape(),
            x.shape()
        )));
    }
    Ok(())
}

fn check_float(op_type: &str, desc: &TensorDesc) -> Result<()> {
    if desc.dtype().is_floating_point() {
        Ok(())
    } else {
        Err(OpError::invalid_argument(format!(
            "{op_type} expects a floating-point input, got {}",
            desc.dtype().name()
        )))
    }
}

fn cached_layout(cache: Option<&dyn OpKernelCache>, op_type: &str) -> Result<RowLayout> {
    downcast_cache::<RowLayout>(cache)
        .copied()
        .ok_or_else(|| OpError::execution(format!("{op_type}: row layout cache missing")))
}

fn softmax_rows<T: FloatElement>(
    x: &Tensor,
    mask: &[i8],
    y: &mut Tensor,
    layout: RowLayout,
    scale: f32,
    fill: f32,
) -> Result<()> {
    let x = x.data::<T>()?;
    let y = y.data_mut::<T>()?;
    let scale = T::from_f32(scale);
    let fill = T::from_f32(fill);
    let cols = layout.cols.max(1);
    for ((x_row, mask_row), y_row) in layout
        .rows_of(x)
        .zip(layout.rows_of(mask))
        .zip(y.chunks_mut(cols))
    {
        for ((out, &value), &keep) in y_row.iter_mut().zip(x_row).zip(mask_row) {
            *out = if keep != 0 { value * scale } else { fill };
        }
        let max = y_row
            .iter()
            .copied()
            .fold(None, |acc: Option<T>, v| match acc {
                Some(m) if m >= v => Some(m),
                _ => Some(v),
            })
            .unwrap_or_else(T::zero);
        let mut sum = T::zero();
        for out in y_row.iter_mut() {
            *out = (*out - max).exp();
            sum = sum + *out;
        }
        for out in y_row.iter_mut() {
            *out = *out / sum;
        }
    }
    Ok(())
}

/// Forward kernel of `fused_scale_mask_softmax`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FusedScaleMaskSoftmaxKernel;

impl OpKernel for FusedScaleMaskSoftmaxKernel {
    fn create_cache(&self, ctx: &KernelCacheContext<'_>) -> Result<Option<Box<dyn OpKernelCache>>> {
        Ok(Some(Box::new(RowLayout::of(ctx.tensor_desc("x", 0)?))))
    }

    fn infer_shape(&self, ctx: &mut KernelInferContext<'_>) -> Result<()> {
        let x = ctx.tensor_desc("x", 0)?.clone();
        check_float(FUSED_SCALE_MASK_SOFTMAX, &x)?;
        check_mask(&x, ctx.tensor_desc("mask", 0)?)?;
        *ctx.mut_tensor_desc("y", 0)? = x;
        Ok(())
    }

    fn compute_with_state(
        &self,
        ctx: &mut KernelComputeContext<'_>,
        _state: Option<&mut (dyn OpKernelState + 'static)>,
        cache: Option<&dyn OpKernelCache>,
    ) -> Result<()> {
        let layout = cached_layout(cache, FUSED_SCALE_MASK_SOFTMAX)?;
        let scale = ctx.attr::<f32>("scale_value")?;
        let fill = ctx.attr::<f32>("mask_fill_value")?;
        let x = ctx.tensor("x", 0)?.clone();
        let mask = ctx.tensor("mask", 0)?.clone();
        check_mask(x.desc(), mask.desc())?;
        let mask = mask.data::<i8>()?;
        let y = ctx.tensor_mut("y", 0)?;
        match x.dtype() {
            DType::F32 => softmax_rows::<f32>(&x, mask, y, layout, scale, fill),
            DType::F64 => softmax_rows::<f64>(&x, mask, y, layout, scale, fill),
            other => Err(OpError::invalid_argument(format!(
                "{FUSED_SCALE_MASK_SOFTMAX} does not support dtype {}",
                other.name()
            ))),
        }
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

fn softmax_grad_rows<T: FloatElement>(
    y: &Tensor,
    dy: &Tensor,
    mask: &[i8],
    dx: &mut Tensor,
    layout: RowLayout,
    scale: f32,
) -> Result<()> {
    let y = y.data::<T>()?;
    let dy = dy.data::<T>()?;
    let dx = dx.data_mut::<T>()?;
    let scale = T::from_f32(scale);
    let cols = layout.cols.max(1);
    for (((y_row, dy_row), mask_row), dx_row) in layout
        .rows_of(y)
        .zip(layout.rows_of(dy))
        .zip(layout.rows_of(mask))
        .zip(dx.chunks_mut(cols))
    {
        let dot = y_row
            .iter()
            .zip(dy_row)
            .fold(T::zero(), |acc, (&y, &g)| acc + y * g);
        for (((out, &y), &g), &keep) in dx_row.iter_mut().zip(y_row).zip(dy_row).zip(mask_row) {
            *out = if keep != 0 {
                scale * y * (g - dot)
            } else {
                T::zero()
            };
        }
    }
    Ok(())
}

/// Backward kernel: `dx = scale * y * (dy - sum(dy * y))` on kept positions, zero elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct FusedScaleMaskSoftmaxGradKernel;

impl OpKernel for FusedScaleMaskSoftmaxGradKernel {
    fn create_cache(&self, ctx: &KernelCacheContext<'_>) -> Result<Option<Box<dyn OpKernelCache>>> {
        Ok(Some(Box::new(RowLayout::of(ctx.tensor_desc("y", 0)?))))
    }

    fn infer_shape(&self, ctx: &mut KernelInferContext<'_>) -> Result<()> {
        let y = ctx.tensor_desc("y", 0)?.clone();
        let dy = ctx.tensor_desc("dy", 0)?.clone();
        check_float(FUSED_SCALE_MASK_SOFTMAX_GRAD, &y)?;
        if dy != y {
            return Err(OpError::shape_mismatch(format!(
                "dy {:?}/{} must match y {:?}/{}",
                dy.shape(),
                dy.dtype().name(),
                y.shape(),
                y.dtype().name()
            )));
        }
        check_mask(&y, ctx.tensor_desc("mask", 0)?)?;
        *ctx.mut_tensor_desc("dx", 0)? = dy;
        Ok(())
    }

    fn compute_with_state(
        &self,
        ctx: &mut KernelComputeContext<'_>,
        _state: Option<&mut (dyn OpKernelState + 'static)>,
        cache: Option<&dyn OpKernelCache>,
    ) -> Result<()> {
        let layout = cached_layout(cache, FUSED_SCALE_MASK_SOFTMAX_GRAD)?;
        let scale = ctx.attr::<f32>("scale_value")?;
        let y = ctx.tensor("y", 0)?.clone();
        let dy = ctx.tensor("dy", 0)?.clone();
        let mask = ctx.tensor("mask", 0)?.clone();
        check_mask(y.desc(), mask.desc())?;
        let mask = mask.data::<i8>()?;
        let dx = ctx.tensor_mut("dx", 0)?;
        match y.dtype() {
            DType::F32 => softmax_grad_rows::<f32>(&y, &dy, mask, dx, layout, scale),
            DType::F64 => softmax_grad_rows::<f64>(&y, &dy, mask, dx, layout, scale),
            other => Err(OpError::invalid_argument(format!(
                "{FUSED_SCALE_MASK_SOFTMAX_GRAD} does not support dtype {}",
                other.name()
            ))),
        }
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_layout_splits_last_axis() {
        assert_eq!(
            RowLayout::of(&TensorDesc::new([2, 3, 5], DType::F32)),
            RowLayout { rows: 6, cols: 5 }
        );
        assert_eq!(
            RowLayout::of(&TensorDesc::new(opcore::Shape::scalar(), DType::F32)),
            RowLayout { rows: 1, cols: 1 }
        );
    }
}
