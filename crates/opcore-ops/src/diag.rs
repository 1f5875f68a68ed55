//! `diag` and `diag_grad` host kernels.
//!
//! A 1-D input of length `n` becomes a square matrix of side `n + |diagonal|` holding the input
//! on the requested diagonal. A 2-D input yields the vector of its requested diagonal, which is
//! empty when the diagonal lies outside the matrix.

use opcore::kernel::{KernelComputeContext, KernelInferContext, OpInfo, OpKernel};
use opcore::tensor::Element;
use opcore::{DType, OpError, OpSchema, Result, Shape, Tensor};

pub const DIAG: &str = "diag";
pub const DIAG_GRAD: &str = "diag_grad";

pub fn diag_schema() -> OpSchema {
    OpSchema::new(DIAG)
        .input("in")
        .output("out")
        .attr("diagonal", 0i32)
}

pub fn diag_grad_schema() -> OpSchema {
    OpSchema::new(DIAG_GRAD)
        .input("dy")
        .input("in")
        .output("dx")
        .attr("diagonal", 0i32)
}

/// Row-major flat offsets of diagonal `diagonal` inside a `rows x cols` matrix.
fn diagonal_offsets(rows: usize, cols: usize, diagonal: i32) -> impl Iterator<Item = usize> {
    let shift = diagonal.unsigned_abs() as usize;
    let (row0, col0) = if diagonal >= 0 { (0, shift) } else { (shift, 0) };
    let len = rows.saturating_sub(row0).min(cols.saturating_sub(col0));
    (0..len).map(move |k| (row0 + k) * cols + col0 + k)
}

/// Output shape of `diag` for an input of shape `input`.
pub fn diag_output_shape(input: &Shape, diagonal: i32) -> Result<Shape> {
    match input.dims() {
        [n] => {
            let side = n + diagonal.unsigned_abs() as usize;
            Ok(Shape::new([side, side]))
        }
        &[rows, cols] => Ok(Shape::new([diagonal_offsets(rows, cols, diagonal).count()])),
        dims => Err(OpError::invalid_argument(format!(
            "diag expects a 1-D or 2-D input, got rank {}",
            dims.len()
        ))),
    }
}

fn check_numeric(op_type: &str, dtype: DType) -> Result<()> {
    match dtype {
        DType::F32 | DType::F64 | DType::I32 | DType::I64 => Ok(()),
        other => Err(OpError::invalid_argument(format!(
            "{op_type} does not support dtype {}",
            other.name()
        ))),
    }
}

macro_rules! dispatch_numeric {
    ($dtype:expr, $func:ident($($arg:expr),*)) => {
        match $dtype {
            DType::F32 => $func::<f32>($($arg),*),
            DType::F64 => $func::<f64>($($arg),*),
            DType::I32 => $func::<i32>($($arg),*),
            DType::I64 => $func::<i64>($($arg),*),
            other => Err(OpError::invalid_argument(format!(
                "unsupported dtype {}",
                other.name()
            ))),
        }
    };
}

fn expect_shape(what: &str, actual: &Shape, expected: &Shape) -> Result<()> {
    if actual != expected {
        return Err(OpError::shape_mismatch(format!(
            "{what}: expected {expected:?}, got {actual:?}"
        )));
    }
    Ok(())
}

fn diag_into<T: Element>(input: &Tensor, out: &mut Tensor, diagonal: i32) -> Result<()> {
    let values = input.data::<T>()?;
    let out_dims = out.shape().dims().to_vec();
    let out_values = out.data_mut::<T>()?;
    out_values.fill(T::default());
    match (input.shape().dims(), out_dims.as_slice()) {
        ([_], &[side, _]) => {
            for (offset, value) in diagonal_offsets(side, side, diagonal).zip(values) {
                out_values[offset] = *value;
            }
        }
        (&[rows, cols], _) => {
            for (slot, offset) in out_values
                .iter_mut()
                .zip(diagonal_offsets(rows, cols, diagonal))
            {
                *slot = values[offset];
            }
        }
        (dims, _) => {
            return Err(OpError::invalid_argument(format!(
                "diag expects a 1-D or 2-D input, got rank {}",
                dims.len()
            )))
        }
    }
    Ok(())
}

/// Forward kernel of `diag`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiagKernel;

impl OpKernel for DiagKernel {
    fn infer_shape(&self, ctx: &mut KernelInferContext<'_>) -> Result<()> {
        let diagonal = ctx.attr::<i32>("diagonal")?;
        let input = ctx.tensor_desc("in", 0)?.clone();
        check_numeric(DIAG, input.dtype())?;
        let shape = diag_output_shape(input.shape(), diagonal)?;
        let out = ctx.mut_tensor_desc("out", 0)?;
        *out.mut_shape() = shape;
        out.set_dtype(input.dtype());
        out.set_dynamic(input.is_dynamic());
        Ok(())
    }

    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        let diagonal = ctx.attr::<i32>("diagonal")?;
        let input = ctx.tensor("in", 0)?.clone();
        let expected = diag_output_shape(input.shape(), diagonal)?;
        let out = ctx.tensor_mut("out", 0)?;
        expect_shape("diag output", out.shape(), &expected)?;
        dispatch_numeric!(input.dtype(), diag_into(&input, out, diagonal))
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

fn diag_grad_into<T: Element>(dy: &Tensor, input: &Shape, dx: &mut Tensor, diagonal: i32) -> Result<()> {
    let dy_values = dy.data::<T>()?;
    let dx_values = dx.data_mut::<T>()?;
    dx_values.fill(T::default());
    match (input.dims(), dy.shape().dims()) {
        ([_], &[side, _]) => {
            for (slot, offset) in dx_values
                .iter_mut()
                .zip(diagonal_offsets(side, side, diagonal))
            {
                *slot = dy_values[offset];
            }
        }
        (&[rows, cols], _) => {
            for (offset, grad) in diagonal_offsets(rows, cols, diagonal).zip(dy_values) {
                dx_values[offset] = *grad;
            }
        }
        (dims, _) => {
            return Err(OpError::invalid_argument(format!(
                "diag_grad expects a 1-D or 2-D input, got rank {}",
                dims.len()
            )))
        }
    }
    Ok(())
}

/// Backward kernel of `diag`: gathers the diagonal of `dy` for 1-D inputs, scatters `dy`
/// onto the diagonal of a zero matrix shaped like `in` for 2-D inputs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiagGradKernel;

impl OpKernel for DiagGradKernel {
    fn infer_shape(&self, ctx: &mut KernelInferContext<'_>) -> Result<()> {
        let diagonal = ctx.attr::<i32>("diagonal")?;
        let dy = ctx.tensor_desc("dy", 0)?.clone();
        let input = ctx.tensor_desc("in", 0)?.clone();
        check_numeric(DIAG_GRAD, dy.dtype())?;
        expect_shape(
            "diag_grad dy",
            dy.shape(),
            &diag_output_shape(input.shape(), diagonal)?,
        )?;
        let dx = ctx.mut_tensor_desc("dx", 0)?;
        *dx.mut_shape() = input.shape().clone();
        dx.set_dtype(dy.dtype());
        dx.set_dynamic(input.is_dynamic());
        Ok(())
    }

    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        let diagonal = ctx.attr::<i32>("diagonal")?;
        let dy = ctx.tensor("dy", 0)?.clone();
        let input = ctx.tensor("in", 0)?.shape().clone();
        expect_shape(
            "diag_grad dy",
            dy.shape(),
            &diag_output_shape(&input, diagonal)?,
        )?;
        let dx = ctx.tensor_mut("dx", 0)?;
        expect_shape("diag_grad dx", dx.shape(), &input)?;
        dispatch_numeric!(dy.dtype(), diag_grad_into(&dy, &input, dx, diagonal))
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_cover_requested_diagonal() {
        assert_eq!(diagonal_offsets(3, 3, 0).collect::<Vec<_>>(), vec![0, 4, 8]);
        assert_eq!(diagonal_offsets(3, 4, 1).collect::<Vec<_>>(), vec![1, 6, 11]);
        assert_eq!(diagonal_offsets(3, 2, -1).collect::<Vec<_>>(), vec![2, 5]);
        assert_eq!(diagonal_offsets(2, 2, 5).count(), 0);
    }

    #[test]
    fn output_shapes_follow_rank() {
        assert_eq!(diag_output_shape(&Shape::new([4]), 0).unwrap(), Shape::new([4, 4]));
        assert_eq!(diag_output_shape(&Shape::new([2]), -2).unwrap(), Shape::new([4, 4]));
        assert_eq!(diag_output_shape(&Shape::new([2, 5]), 1).unwrap(), Shape::new([2]));
        assert_eq!(diag_output_shape(&Shape::new([2, 5]), -3).unwrap(), Shape::new([0]));
        assert!(diag_output_shape(&Shape::new([2, 2, 2]), 0).is_err());
    }
}
