//! Phase-specific views handed to kernels.
//!
//! Every context exposes the shared [`OpInfo`] surface (argument bindings, operator
//! identity, device, attributes). On top of that, Init/Cache contexts expose static tensor
//! descriptors and placement, the Infer context lets the kernel write output descriptors, and
//! the Compute context exposes the tensors themselves.

use crate::attr::{ComposedAttrMap, FromAttrValue};
use crate::device::{DeviceType, NdSbp, ParallelContext, ParallelDesc, Placement, SbpParallel, StreamHandle};
use crate::error::{OpError, Result};
use crate::op::{ArgDirection, UserOpConf};
use crate::tensor::{Shape, Tensor, TensorDesc};

/// Per-invocation operator identity shared by all four contexts.
#[derive(Clone, Copy)]
pub struct KernelMetadata<'a> {
    conf: &'a UserOpConf,
    placement: &'a Placement,
    attrs: ComposedAttrMap<'a>,
    input_sbp: &'a [NdSbp],
    output_sbp: &'a [NdSbp],
}

impl<'a> KernelMetadata<'a> {
    pub(crate) fn new(
        conf: &'a UserOpConf,
        placement: &'a Placement,
        attrs: ComposedAttrMap<'a>,
        input_sbp: &'a [NdSbp],
        output_sbp: &'a [NdSbp],
    ) -> Self {
        KernelMetadata {
            conf,
            placement,
            attrs,
            input_sbp,
            output_sbp,
        }
    }

    pub fn conf(&self) -> &'a UserOpConf {
        self.conf
    }

    pub fn placement(&self) -> &'a Placement {
        self.placement
    }

    pub fn attrs(&self) -> ComposedAttrMap<'a> {
        self.attrs
    }

    fn position(&self, direction: ArgDirection, arg: &str, index: usize) -> Result<usize> {
        self.conf
            .position(direction, arg, index)
            .ok_or_else(|| self.conf.arg_not_found(direction, arg, index))
    }

    fn nd_sbp(&self, direction: ArgDirection, arg: &str, index: usize) -> Result<NdSbp> {
        let position = self.position(direction, arg, index)?;
        let table = match direction {
            ArgDirection::Input => self.input_sbp,
            ArgDirection::Output => self.output_sbp,
        };
        Ok(table.get(position).cloned().unwrap_or_else(NdSbp::broadcast))
    }
}

/// Operator identity and attribute surface common to every kernel context.
pub trait OpInfo {
    fn metadata(&self) -> &KernelMetadata<'_>;

    /// Ordered `(arg_name, index)` pairs of the inputs.
    fn inputs(&self) -> Vec<(String, usize)> {
        self.metadata().conf.arg_list(ArgDirection::Input)
    }

    fn outputs(&self) -> Vec<(String, usize)> {
        self.metadata().conf.arg_list(ArgDirection::Output)
    }

    /// Tensor name bound to input `(arg, index)`.
    fn input(&self, arg: &str, index: usize) -> Result<&str> {
        self.metadata()
            .conf
            .tensor_name(ArgDirection::Input, arg, index)
    }

    fn output(&self, arg: &str, index: usize) -> Result<&str> {
        self.metadata()
            .conf
            .tensor_name(ArgDirection::Output, arg, index)
    }

    fn has_input(&self, arg: &str, index: usize) -> bool {
        self.metadata().conf.has_arg(ArgDirection::Input, arg, index)
    }

    fn has_output(&self, arg: &str, index: usize) -> bool {
        self.metadata().conf.has_arg(ArgDirection::Output, arg, index)
    }

    fn input_size(&self, arg: &str) -> usize {
        self.metadata().conf.arg_size(ArgDirection::Input, arg)
    }

    fn output_size(&self, arg: &str) -> usize {
        self.metadata().conf.arg_size(ArgDirection::Output, arg)
    }

    fn op_name(&self) -> &str {
        self.metadata().conf.op_name()
    }

    fn op_type_name(&self) -> &str {
        self.metadata().conf.op_type_name()
    }

    fn device_tag(&self) -> &str {
        self.metadata().conf.device_tag()
    }

    fn device_type(&self) -> DeviceType {
        self.metadata().placement.device_type()
    }

    fn parallel_ctx(&self) -> &ParallelContext {
        &self.metadata().placement.parallel_ctx
    }

    /// Instance-over-default attribute lookup.
    fn attr<T: FromAttrValue>(&self, name: &str) -> Result<T>
    where
        Self: Sized,
    {
        self.metadata().attrs.get_attr(name)
    }
}

fn lookup<'t, T>(
    meta: &KernelMetadata<'_>,
    slots: &'t [T],
    direction: ArgDirection,
    arg: &str,
    index: usize,
) -> Result<&'t T> {
    let position = meta.position(direction, arg, index)?;
    slots.get(position).ok_or_else(|| {
        OpError::execution(format!(
            "{}: {} slot {position} for '{arg}' was not provided",
            meta.conf.op_type_name(),
            direction.as_str()
        ))
    })
}

fn lookup_mut<'t, T>(
    meta: &KernelMetadata<'_>,
    slots: &'t mut [T],
    direction: ArgDirection,
    arg: &str,
    index: usize,
) -> Result<&'t mut T> {
    let position = meta.position(direction, arg, index)?;
    let op_type = meta.conf.op_type_name();
    slots.get_mut(position).ok_or_else(|| {
        OpError::execution(format!(
            "{op_type}: {} slot {position} for '{arg}' was not provided",
            direction.as_str()
        ))
    })
}

/// Descriptor of `(arg, index)` with each split axis scaled by its hierarchy dimension.
fn logical_desc(
    meta: &KernelMetadata<'_>,
    local: &TensorDesc,
    direction: ArgDirection,
    arg: &str,
    index: usize,
) -> Result<TensorDesc> {
    let mut desc = local.clone();
    let nd_sbp = meta.nd_sbp(direction, arg, index)?;
    let hierarchy = &meta.placement.parallel_desc.hierarchy;
    for (sbp, &ways) in nd_sbp.0.iter().zip(hierarchy) {
        let SbpParallel::Split(axis) = *sbp else {
            continue;
        };
        let dims = desc.mut_shape().dims_mut();
        let dim = dims.get_mut(axis).ok_or_else(|| {
            OpError::shape_mismatch(format!(
                "split axis {axis} out of range for rank {} {arg}",
                local.shape().rank()
            ))
        })?;
        *dim *= ways;
    }
    Ok(desc)
}

macro_rules! static_desc_context {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<'a> {
            meta: KernelMetadata<'a>,
            input_descs: &'a [TensorDesc],
            output_descs: &'a [TensorDesc],
        }

        impl<'a> $name<'a> {
            pub(crate) fn new(
                meta: KernelMetadata<'a>,
                input_descs: &'a [TensorDesc],
                output_descs: &'a [TensorDesc],
            ) -> Self {
                $name {
                    meta,
                    input_descs,
                    output_descs,
                }
            }

            pub fn stream(&self) -> StreamHandle {
                self.meta.placement.stream
            }

            /// Local descriptor of input `(arg, index)`, falling back to outputs.
            pub fn tensor_desc(&self, arg: &str, index: usize) -> Result<&TensorDesc> {
                if self.has_input(arg, index) {
                    lookup(&self.meta, self.input_descs, ArgDirection::Input, arg, index)
                } else {
                    lookup(&self.meta, self.output_descs, ArgDirection::Output, arg, index)
                }
            }

            pub fn logical_tensor_desc(&self, arg: &str, index: usize) -> Result<TensorDesc> {
                let direction = self.direction_of(arg, index);
                let local = self.tensor_desc(arg, index)?;
                logical_desc(&self.meta, local, direction, arg, index)
            }

            pub fn sbp(&self, arg: &str, index: usize) -> Result<SbpParallel> {
                Ok(self.nd_sbp(arg, index)?.first())
            }

            pub fn nd_sbp(&self, arg: &str, index: usize) -> Result<NdSbp> {
                self.meta.nd_sbp(self.direction_of(arg, index), arg, index)
            }

            pub fn parallel_desc(&self) -> &ParallelDesc {
                &self.meta.placement.parallel_desc
            }

            fn direction_of(&self, arg: &str, index: usize) -> ArgDirection {
                if self.has_input(arg, index) {
                    ArgDirection::Input
                } else {
                    ArgDirection::Output
                }
            }
        }

        impl OpInfo for $name<'_> {
            fn metadata(&self) -> &KernelMetadata<'_> {
                &self.meta
            }
        }
    };
}

static_desc_context!(
    /// Context for creating a kernel's long-lived State.
    KernelInitContext
);

static_desc_context!(
    /// Context for (re)building a kernel's Cache. Same surface as [`KernelInitContext`].
    KernelCacheContext
);

/// Context for output shape and dtype inference.
pub struct KernelInferContext<'a> {
    meta: KernelMetadata<'a>,
    input_descs: &'a [TensorDesc],
    output_descs: &'a mut [TensorDesc],
}

impl<'a> KernelInferContext<'a> {
    pub(crate) fn new(
        meta: KernelMetadata<'a>,
        input_descs: &'a [TensorDesc],
        output_descs: &'a mut [TensorDesc],
    ) -> Self {
        KernelInferContext {
            meta,
            input_descs,
            output_descs,
        }
    }

    pub fn stream(&self) -> StreamHandle {
        self.meta.placement.stream
    }

    pub fn shape_view(&self, arg: &str, index: usize) -> Result<&Shape> {
        Ok(self.tensor_desc(arg, index)?.shape())
    }

    /// Descriptor of input `(arg, index)`.
    pub fn tensor_desc(&self, arg: &str, index: usize) -> Result<&TensorDesc> {
        lookup(&self.meta, self.input_descs, ArgDirection::Input, arg, index)
    }

    pub fn mut_shape_view(&mut self, arg: &str, index: usize) -> Result<&mut Shape> {
        Ok(self.mut_tensor_desc(arg, index)?.mut_shape())
    }

    pub fn mut_tensor_desc(&mut self, arg: &str, index: usize) -> Result<&mut TensorDesc> {
        lookup_mut(&self.meta, self.output_descs, ArgDirection::Output, arg, index)
    }
}

impl OpInfo for KernelInferContext<'_> {
    fn metadata(&self) -> &KernelMetadata<'_> {
        &self.meta
    }
}

/// Context for one compute call: read-only inputs, writable outputs.
pub struct KernelComputeContext<'a> {
    meta: KernelMetadata<'a>,
    inputs: &'a [Tensor],
    outputs: &'a mut [Tensor],
}

impl<'a> KernelComputeContext<'a> {
    pub(crate) fn new(
        meta: KernelMetadata<'a>,
        inputs: &'a [Tensor],
        outputs: &'a mut [Tensor],
    ) -> Self {
        KernelComputeContext {
            meta,
            inputs,
            outputs,
        }
    }

    pub fn stream(&self) -> StreamHandle {
        self.meta.placement.stream
    }

    pub fn tensor(&self, arg: &str, index: usize) -> Result<&Tensor> {
        lookup(&self.meta, self.inputs, ArgDirection::Input, arg, index)
    }

    pub fn tensor_mut(&mut self, arg: &str, index: usize) -> Result<&mut Tensor> {
        lookup_mut(&self.meta, self.outputs, ArgDirection::Output, arg, index)
    }

    /// Descriptor of input or output `(arg, index)`.
    pub fn tensor_desc(&self, arg: &str, index: usize) -> Result<&TensorDesc> {
        if self.has_input(arg, index) {
            Ok(self.tensor(arg, index)?.desc())
        } else {
            Ok(lookup(&self.meta, &*self.outputs, ArgDirection::Output, arg, index)?.desc())
        }
    }
}

impl OpInfo for KernelComputeContext<'_> {
    fn metadata(&self) -> &KernelMetadata<'_> {
        &self.meta
    }
}
