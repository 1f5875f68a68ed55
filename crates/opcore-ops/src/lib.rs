//! Reference host operators for the `opcore` runtime.
//!
//! Linking this crate contributes [`register`] to [`opcore::registry::OP_REGISTRARS`], so
//! [`init`] (or [`opcore::registry::initialize`]) installs `diag`, `diag_grad`,
//! `fused_scale_mask_softmax` and `fused_scale_mask_softmax_grad` together with the gradient
//! functions of the two forward operators. Tests that want isolation build a private
//! [`registry`] and scope it with [`opcore::registry::with_registry`].

use std::sync::Arc;

use opcore::registry::{OpRegistry, Registrar, RegistrarFn};
use opcore::Result;
use tracing::debug;

pub mod diag;
pub mod functional;
pub mod grad;
pub mod softmax;

pub use diag::{DiagGradKernel, DiagKernel};
pub use grad::{DiagGrad, FusedScaleMaskSoftmaxGrad};
pub use softmax::{FusedScaleMaskSoftmaxGradKernel, FusedScaleMaskSoftmaxKernel, RowLayout};

/// Adds every reference schema, kernel and gradient function to `registrar`.
pub fn register(registrar: &mut Registrar) -> Result<()> {
    registrar.register_schema(diag::diag_schema())?;
    registrar.register_schema(diag::diag_grad_schema())?;
    registrar.register_schema(softmax::fused_scale_mask_softmax_schema())?;
    registrar.register_schema(softmax::fused_scale_mask_softmax_grad_schema())?;

    registrar.register_kernel(diag::DIAG, || DiagKernel)?;
    registrar.register_kernel(diag::DIAG_GRAD, || DiagGradKernel)?;
    registrar.register_kernel(softmax::FUSED_SCALE_MASK_SOFTMAX, || {
        FusedScaleMaskSoftmaxKernel
    })?;
    registrar.register_kernel(softmax::FUSED_SCALE_MASK_SOFTMAX_GRAD, || {
        FusedScaleMaskSoftmaxGradKernel
    })?;

    registrar.register_grad_fn(diag::DIAG, DiagGrad::default)?;
    registrar.register_grad_fn(
        softmax::FUSED_SCALE_MASK_SOFTMAX,
        FusedScaleMaskSoftmaxGrad::default,
    )?;
    debug!("registered reference host operators");
    Ok(())
}

/// A frozen registry holding only the reference operators.
pub fn registry() -> Result<OpRegistry> {
    let mut registrar = Registrar::new();
    register(&mut registrar)?;
    Ok(registrar.freeze())
}

/// Installs the process-wide registry from every linked registrar.
pub fn init() -> Result<Arc<OpRegistry>> {
    opcore::registry::initialize()
}

#[opcore::linkme::distributed_slice(opcore::registry::OP_REGISTRARS)]
static REGISTER_REFERENCE_OPS: RegistrarFn = register;
