//! Operator definitions (schemas) and operator instances (expressions).
//!
//! A schema declares the ordered input/output arguments of an operator type and its default
//! attributes. A [`UserOpConf`] binds one operator instance: its name, device, the tensor
//! names flowing through each argument, and instance attributes. [`UserOpExpr`] pairs the two
//! and owns the per-instance kernel driver and gradient function.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::attr::{AttrMap, AttrValue, ComposedAttrMap};
use crate::autograd::ErasedGradFunction;
use crate::device::{DeviceType, Placement};
use crate::error::{ensure_arity, OpError, Result};
use crate::kernel::KernelInstance;
use crate::registry::OpRegistry;
use crate::tensor::{Tensor, TensorTuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgDirection {
    Input,
    Output,
}

impl ArgDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ArgDirection::Input => "input",
            ArgDirection::Output => "output",
        }
    }
}

/// One declared argument of an operator type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDef {
    pub name: &'static str,
    pub num: usize,
    /// Whether gradients flow into this argument. Always true for outputs.
    pub differentiable: bool,
}

/// Operator definition: argument signature plus default attributes.
#[derive(Debug, Clone)]
pub struct OpSchema {
    op_type: &'static str,
    inputs: Vec<ArgDef>,
    outputs: Vec<ArgDef>,
    default_attrs: AttrMap,
}

impl OpSchema {
    pub fn new(op_type: &'static str) -> Self {
        OpSchema {
            op_type,
            inputs: Vec::new(),
            outputs: Vec::new(),
            default_attrs: AttrMap::new(),
        }
    }

    pub fn input(self, name: &'static str) -> Self {
        self.push_input(name, 1, true)
    }

    /// Declares an input that never receives a gradient (masks, indices).
    pub fn non_differentiable_input(self, name: &'static str) -> Self {
        self.push_input(name, 1, false)
    }

    pub fn repeated_input(self, name: &'static str, num: usize) -> Self {
        self.push_input(name, num, true)
    }

    fn push_input(mut self, name: &'static str, num: usize, differentiable: bool) -> Self {
        self.inputs.push(ArgDef {
            name,
            num,
            differentiable,
        });
        self
    }

    pub fn output(mut self, name: &'static str) -> Self {
        self.outputs.push(ArgDef {
            name,
            num: 1,
            differentiable: true,
        });
        self
    }

    pub fn attr(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        let single = AttrMap::builder().set(name, value).build();
        self.default_attrs = self.default_attrs.merged_with(&single);
        self
    }

    pub fn op_type(&self) -> &'static str {
        self.op_type
    }

    pub fn inputs(&self) -> &[ArgDef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ArgDef] {
        &self.outputs
    }

    pub fn default_attrs(&self) -> &AttrMap {
        &self.default_attrs
    }

    pub fn input_arity(&self) -> usize {
        self.inputs.iter().map(|arg| arg.num).sum()
    }

    pub fn output_arity(&self) -> usize {
        self.outputs.iter().map(|arg| arg.num).sum()
    }

    /// Differentiability of every flattened input position.
    pub fn differentiable_inputs(&self) -> Vec<bool> {
        self.inputs
            .iter()
            .flat_map(|arg| std::iter::repeat(arg.differentiable).take(arg.num))
            .collect()
    }
}

/// Argument bindings of one operator instance.
#[derive(Debug, Clone)]
pub struct UserOpConf {
    op_name: String,
    op_type_name: String,
    device_tag: String,
    inputs: Vec<(String, Vec<String>)>,
    outputs: Vec<(String, Vec<String>)>,
    attrs: AttrMap,
}

impl UserOpConf {
    /// Binds every declared argument to generated tensor names `"{op_name}/{arg}_{index}"`.
    pub fn from_schema(schema: &OpSchema, op_name: impl Into<String>, device: DeviceType) -> Self {
        let op_name = op_name.into();
        let bind = |args: &[ArgDef]| -> Vec<(String, Vec<String>)> {
            args.iter()
                .map(|arg| {
                    let names = (0..arg.num)
                        .map(|index| format!("{op_name}/{}_{index}", arg.name))
                        .collect();
                    (arg.name.to_string(), names)
                })
                .collect()
        };
        UserOpConf {
            inputs: bind(&schema.inputs),
            outputs: bind(&schema.outputs),
            op_type_name: schema.op_type.to_string(),
            device_tag: device.tag().to_string(),
            attrs: AttrMap::new(),
            op_name,
        }
    }

    pub fn with_attrs(mut self, attrs: AttrMap) -> Self {
        self.attrs = attrs;
        self
    }

    /// Rebinds one argument to explicit tensor names.
    pub fn bind(
        mut self,
        direction: ArgDirection,
        arg: &str,
        tensor_names: Vec<String>,
    ) -> Result<Self> {
        let op_type = self.op_type_name.clone();
        let slot = self
            .args_mut(direction)
            .iter_mut()
            .find(|(name, _)| name == arg)
            .ok_or_else(|| OpError::ArgNotFound {
                op_type,
                direction: direction.as_str(),
                arg: arg.to_string(),
                index: 0,
            })?;
        slot.1 = tensor_names;
        Ok(self)
    }

    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    pub fn op_type_name(&self) -> &str {
        &self.op_type_name
    }

    pub fn device_tag(&self) -> &str {
        &self.device_tag
    }

    pub fn attrs(&self) -> &AttrMap {
        &self.attrs
    }

    pub fn args(&self, direction: ArgDirection) -> &[(String, Vec<String>)] {
        match direction {
            ArgDirection::Input => &self.inputs,
            ArgDirection::Output => &self.outputs,
        }
    }

    fn args_mut(&mut self, direction: ArgDirection) -> &mut Vec<(String, Vec<String>)> {
        match direction {
            ArgDirection::Input => &mut self.inputs,
            ArgDirection::Output => &mut self.outputs,
        }
    }

    /// Tensor name bound to `(arg, index)`.
    pub fn tensor_name(&self, direction: ArgDirection, arg: &str, index: usize) -> Result<&str> {
        self.args(direction)
            .iter()
            .find(|(name, _)| name == arg)
            .and_then(|(_, names)| names.get(index))
            .map(String::as_str)
            .ok_or_else(|| self.arg_not_found(direction, arg, index))
    }

    pub fn has_arg(&self, direction: ArgDirection, arg: &str, index: usize) -> bool {
        self.position(direction, arg, index).is_some()
    }

    pub fn arg_size(&self, direction: ArgDirection, arg: &str) -> usize {
        self.args(direction)
            .iter()
            .find(|(name, _)| name == arg)
            .map_or(0, |(_, names)| names.len())
    }

    /// Flattened position of `(arg, index)` in the ordered tensor tuple.
    pub fn position(&self, direction: ArgDirection, arg: &str, index: usize) -> Option<usize> {
        let mut offset = 0;
        for (name, names) in self.args(direction) {
            if name == arg {
                return (index < names.len()).then_some(offset + index);
            }
            offset += names.len();
        }
        None
    }

    /// Ordered `(arg, index)` pairs.
    pub fn arg_list(&self, direction: ArgDirection) -> Vec<(String, usize)> {
        self.args(direction)
            .iter()
            .flat_map(|(name, names)| (0..names.len()).map(move |index| (name.clone(), index)))
            .collect()
    }

    pub fn arity(&self, direction: ArgDirection) -> usize {
        self.args(direction).iter().map(|(_, names)| names.len()).sum()
    }

    pub(crate) fn arg_not_found(&self, direction: ArgDirection, arg: &str, index: usize) -> OpError {
        OpError::ArgNotFound {
            op_type: self.op_type_name.clone(),
            direction: direction.as_str(),
            arg: arg.to_string(),
            index,
        }
    }
}

/// An operator template gradient functions bind to at graph-build time.
pub trait OpExpr: Any + Send + Sync {
    fn op_type_name(&self) -> &str;
    fn input_arity(&self) -> usize;
    fn output_arity(&self) -> usize;
    /// Concrete expression kind, reported in class-mismatch errors.
    fn kind(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

/// Operator instance backed by a registered schema and kernel.
pub struct UserOpExpr {
    conf: Arc<UserOpConf>,
    schema: Arc<OpSchema>,
    placement: Placement,
    kernel: OnceLock<Arc<KernelInstance>>,
    grad_fn: OnceLock<Arc<dyn ErasedGradFunction>>,
}

impl UserOpExpr {
    pub const KIND: &'static str = "UserOpExpr";

    /// Creates an expression, checking the total and per-argument bindings against the schema.
    pub fn new(schema: Arc<OpSchema>, conf: UserOpConf, placement: Placement) -> Result<Self> {
        let op_type = schema.op_type();
        if conf.op_type_name() != op_type {
            return Err(OpError::invalid_argument(format!(
                "operator conf of type '{}' bound to schema '{op_type}'",
                conf.op_type_name()
            )));
        }
        ensure_arity(
            op_type,
            "inputs",
            schema.input_arity(),
            conf.arity(ArgDirection::Input),
        )?;
        ensure_arity(
            op_type,
            "outputs",
            schema.output_arity(),
            conf.arity(ArgDirection::Output),
        )?;
        for (direction, args, what) in [
            (ArgDirection::Input, schema.inputs(), "inputs"),
            (ArgDirection::Output, schema.outputs(), "outputs"),
        ] {
            for arg in args {
                ensure_arity(
                    &format!("{op_type}.{}", arg.name),
                    what,
                    arg.num,
                    conf.arg_size(direction, arg.name),
                )?;
            }
        }
        Ok(UserOpExpr {
            conf: Arc::new(conf),
            schema,
            placement,
            kernel: OnceLock::new(),
            grad_fn: OnceLock::new(),
        })
    }

    /// Creates a single-device expression with generated tensor names.
    pub fn from_schema(
        schema: Arc<OpSchema>,
        op_name: impl Into<String>,
        attrs: AttrMap,
        placement: Placement,
    ) -> Result<Self> {
        let conf = UserOpConf::from_schema(&schema, op_name, placement.device_type())
            .with_attrs(attrs);
        UserOpExpr::new(schema, conf, placement)
    }

    pub fn conf(&self) -> &Arc<UserOpConf> {
        &self.conf
    }

    pub fn schema(&self) -> &Arc<OpSchema> {
        &self.schema
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Attributes of this instance resolved over the schema defaults.
    pub fn composed_attrs(&self) -> ComposedAttrMap<'_> {
        ComposedAttrMap::new(self.conf.attrs(), self.schema.default_attrs())
    }

    /// Schema defaults with this instance's attributes applied, as one flat map.
    pub fn base_attrs(&self) -> AttrMap {
        self.schema.default_attrs().merged_with(self.conf.attrs())
    }

    /// Kernel driver for this instance, created from `registry` on first use.
    pub fn kernel_instance(&self, registry: &OpRegistry) -> Result<Arc<KernelInstance>> {
        if let Some(instance) = self.kernel.get() {
            return Ok(Arc::clone(instance));
        }
        let kernel = registry.create_kernel(self.schema.op_type())?;
        let instance = Arc::new(KernelInstance::new(
            kernel,
            Arc::clone(&self.conf),
            Arc::clone(&self.schema),
            self.placement.clone(),
        ));
        Ok(Arc::clone(self.kernel.get_or_init(|| instance)))
    }

    /// Initialized gradient function for this instance, created from `registry` on first use.
    pub fn grad_fn(&self, registry: &OpRegistry) -> Result<Arc<dyn ErasedGradFunction>> {
        if let Some(grad_fn) = self.grad_fn.get() {
            return Ok(Arc::clone(grad_fn));
        }
        let mut grad_fn = registry.create_grad_fn(self.schema.op_type())?;
        grad_fn.init(self)?;
        let grad_fn: Arc<dyn ErasedGradFunction> = Arc::from(grad_fn);
        Ok(Arc::clone(self.grad_fn.get_or_init(|| grad_fn)))
    }
}

impl OpExpr for UserOpExpr {
    fn op_type_name(&self) -> &str {
        self.conf.op_type_name()
    }

    fn input_arity(&self) -> usize {
        self.conf.arity(ArgDirection::Input)
    }

    fn output_arity(&self) -> usize {
        self.conf.arity(ArgDirection::Output)
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for UserOpExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserOpExpr")
            .field("op_name", &self.conf.op_name())
            .field("op_type", &self.conf.op_type_name())
            .field("device", &self.placement.device_type())
            .finish()
    }
}

type HostFn = dyn Fn(&[Tensor]) -> Result<TensorTuple> + Send + Sync;

/// Operator implemented by a host closure rather than a registered kernel.
pub struct FunctionOpExpr {
    name: String,
    input_arity: usize,
    output_arity: usize,
    func: Arc<HostFn>,
}

impl FunctionOpExpr {
    pub const KIND: &'static str = "FunctionOpExpr";

    pub fn new<F>(name: impl Into<String>, input_arity: usize, output_arity: usize, func: F) -> Self
    where
        F: Fn(&[Tensor]) -> Result<TensorTuple> + Send + Sync + 'static,
    {
        FunctionOpExpr {
            name: name.into(),
            input_arity,
            output_arity,
            func: Arc::new(func),
        }
    }

    pub fn call(&self, inputs: &[Tensor]) -> Result<TensorTuple> {
        ensure_arity(&self.name, "inputs", self.input_arity, inputs.len())?;
        let outputs = (self.func)(inputs)?;
        ensure_arity(&self.name, "outputs", self.output_arity, outputs.len())?;
        Ok(outputs)
    }
}

impl OpExpr for FunctionOpExpr {
    fn op_type_name(&self) -> &str {
        &self.name
    }

    fn input_arity(&self) -> usize {
        self.input_arity
    }

    fn output_arity(&self) -> usize {
        self.output_arity
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn softmax_schema() -> OpSchema {
        OpSchema::new("fused_scale_mask_softmax")
            .input("x")
            .non_differentiable_input("mask")
            .output("y")
            .attr("scale_value", 1.0f32)
    }

    #[test]
    fn conf_resolves_positions_in_declaration_order() {
        let conf = UserOpConf::from_schema(&softmax_schema(), "softmax0", DeviceType::Cpu);
        assert_eq!(conf.position(ArgDirection::Input, "x", 0), Some(0));
        assert_eq!(conf.position(ArgDirection::Input, "mask", 0), Some(1));
        assert_eq!(conf.position(ArgDirection::Input, "mask", 1), None);
        assert_eq!(
            conf.tensor_name(ArgDirection::Output, "y", 0).unwrap(),
            "softmax0/y_0"
        );
        assert_eq!(
            conf.arg_list(ArgDirection::Input),
            vec![("x".to_string(), 0), ("mask".to_string(), 0)]
        );
    }

    #[test]
    fn expression_rejects_arity_mismatch() {
        let schema = Arc::new(softmax_schema());
        let conf = UserOpConf::from_schema(&schema, "softmax0", DeviceType::Cpu)
            .bind(ArgDirection::Input, "x", vec!["a".into(), "b".into()])
            .unwrap();
        let err = UserOpExpr::new(schema, conf, Placement::default()).unwrap_err();
        assert!(matches!(err, OpError::ArityViolation { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn expression_rejects_misassigned_bindings() {
        let schema = Arc::new(softmax_schema());
        let conf = UserOpConf::from_schema(&schema, "softmax0", DeviceType::Cpu)
            .bind(ArgDirection::Input, "x", vec!["a".into(), "b".into()])
            .unwrap()
            .bind(ArgDirection::Input, "mask", Vec::new())
            .unwrap();
        assert_eq!(conf.arity(ArgDirection::Input), 2);
        let err = UserOpExpr::new(schema, conf, Placement::default()).unwrap_err();
        assert_eq!(
            err,
            OpError::ArityViolation {
                op_type: "fused_scale_mask_softmax.x".into(),
                what: "inputs",
                expected: 1,
                actual: 2,
            }
        );
    }

    #[test]
    fn schema_tracks_differentiability() {
        let schema = softmax_schema();
        assert_eq!(schema.differentiable_inputs(), vec![true, false]);
        assert_eq!(schema.default_attrs().get_attr::<f32>("scale_value").unwrap(), 1.0);
    }
}
