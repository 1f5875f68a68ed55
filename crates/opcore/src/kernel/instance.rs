use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::context::{
    KernelCacheContext, KernelComputeContext, KernelInferContext, KernelInitContext,
    KernelMetadata,
};
use super::state::{CacheInvalidation, OpKernelCache, OpKernelState};
use super::OpKernel;
use crate::attr::{AttrFingerprint, AttrMap, ComposedAttrMap};
use crate::config::{runtime_config, CachePolicy, RuntimeConfig};
use crate::device::{NdSbp, Placement};
use crate::error::{ensure_arity, OpError, Result};
use crate::op::{ArgDirection, OpSchema, UserOpConf};
use crate::tensor::{DType, Shape, Tensor, TensorDesc, TensorTuple};

/// Lifecycle counters of one kernel instance.
#[derive(Debug, Default)]
pub struct KernelInstanceStats {
    states_created: AtomicUsize,
    caches_built: AtomicUsize,
    computes: AtomicUsize,
    skipped_computes: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelStatsSnapshot {
    pub states_created: usize,
    pub caches_built: usize,
    pub computes: usize,
    pub skipped_computes: usize,
}

impl KernelInstanceStats {
    pub fn snapshot(&self) -> KernelStatsSnapshot {
        KernelStatsSnapshot {
            states_created: self.states_created.load(Ordering::Relaxed),
            caches_built: self.caches_built.load(Ordering::Relaxed),
            computes: self.computes.load(Ordering::Relaxed),
            skipped_computes: self.skipped_computes.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct Slots {
    state: Option<Box<dyn OpKernelState>>,
    state_ready: bool,
    cache: Option<Box<dyn OpKernelCache>>,
    /// Inputs and attributes the cache was last validated against; `None` until the first
    /// successful cache decision.
    last_seen: Option<(Vec<TensorDesc>, AttrFingerprint)>,
}

/// Drives one kernel for one operator instance.
///
/// State and Cache decisions plus compute are serialized per instance; distinct instances run
/// independently.
pub struct KernelInstance {
    kernel: Box<dyn OpKernel>,
    conf: Arc<UserOpConf>,
    schema: Arc<OpSchema>,
    placement: Placement,
    input_sbp: Vec<NdSbp>,
    output_sbp: Vec<NdSbp>,
    config: RuntimeConfig,
    slots: Mutex<Slots>,
    stats: KernelInstanceStats,
}

impl KernelInstance {
    pub fn new(
        kernel: Box<dyn OpKernel>,
        conf: Arc<UserOpConf>,
        schema: Arc<OpSchema>,
        placement: Placement,
    ) -> Self {
        KernelInstance {
            kernel,
            conf,
            schema,
            placement,
            input_sbp: Vec::new(),
            output_sbp: Vec::new(),
            config: runtime_config().clone(),
            slots: Mutex::new(Slots::default()),
            stats: KernelInstanceStats::default(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Per-position distribution of inputs and outputs. Missing entries are broadcast.
    pub fn with_nd_sbp(mut self, input_sbp: Vec<NdSbp>, output_sbp: Vec<NdSbp>) -> Self {
        self.input_sbp = input_sbp;
        self.output_sbp = output_sbp;
        self
    }

    pub fn conf(&self) -> &UserOpConf {
        &self.conf
    }

    pub fn op_type_name(&self) -> &str {
        self.conf.op_type_name()
    }

    pub fn stats(&self) -> KernelStatsSnapshot {
        self.stats.snapshot()
    }

    fn metadata<'a>(&'a self, attrs: ComposedAttrMap<'a>) -> KernelMetadata<'a> {
        KernelMetadata::new(
            &self.conf,
            &self.placement,
            attrs,
            &self.input_sbp,
            &self.output_sbp,
        )
    }

    /// Instance attributes of this invocation: call-site attributes shadow the configured ones.
    fn effective_attrs(&self, attrs: &AttrMap) -> AttrMap {
        self.conf.attrs().merged_with(attrs)
    }

    fn check_arity(&self, direction: ArgDirection, actual: usize) -> Result<()> {
        let what = match direction {
            ArgDirection::Input => "inputs",
            ArgDirection::Output => "outputs",
        };
        ensure_arity(
            self.conf.op_type_name(),
            what,
            self.conf.arity(direction),
            actual,
        )
    }

    /// Runs shape and dtype inference, returning one descriptor per output.
    pub fn infer_outputs(&self, inputs: &[Tensor], attrs: &AttrMap) -> Result<Vec<TensorDesc>> {
        self.check_arity(ArgDirection::Input, inputs.len())?;
        let effective = self.effective_attrs(attrs);
        let composed = ComposedAttrMap::new(&effective, self.schema.default_attrs());
        let input_descs: Vec<TensorDesc> = inputs.iter().map(|t| t.desc().clone()).collect();
        let default_dtype = input_descs.first().map_or(DType::F32, TensorDesc::dtype);
        let output_arity = self.conf.arity(ArgDirection::Output);
        let mut output_descs = vec![TensorDesc::new(Shape::scalar(), default_dtype); output_arity];
        let mut ctx =
            KernelInferContext::new(self.metadata(composed), &input_descs, &mut output_descs);
        self.kernel.infer_shape(&mut ctx)?;
        Ok(output_descs)
    }

    /// Infers outputs, allocates them zero-filled on this instance's device, and computes.
    pub fn run(&self, inputs: &[Tensor], attrs: &AttrMap) -> Result<TensorTuple> {
        let device = self.placement.device_type();
        let mut outputs: Vec<Tensor> = self
            .infer_outputs(inputs, attrs)?
            .into_iter()
            .map(|desc| Tensor::zeros(desc).on_device(device))
            .collect();
        self.compute(inputs, &mut outputs, attrs)?;
        Ok(outputs.into_iter().collect())
    }

    /// One forward invocation against caller-provided outputs.
    pub fn compute(&self, inputs: &[Tensor], outputs: &mut [Tensor], attrs: &AttrMap) -> Result<()> {
        self.check_arity(ArgDirection::Input, inputs.len())?;
        self.check_arity(ArgDirection::Output, outputs.len())?;

        let effective = self.effective_attrs(attrs);
        let composed = ComposedAttrMap::new(&effective, self.schema.default_attrs());
        let input_descs: Vec<TensorDesc> = inputs.iter().map(|t| t.desc().clone()).collect();
        let output_descs: Vec<TensorDesc> = outputs.iter().map(|t| t.desc().clone()).collect();
        let op_type = self.conf.op_type_name();

        let mut slots = self.slots.lock().map_err(|_| {
            OpError::execution(format!("kernel instance for '{op_type}' is poisoned"))
        })?;
        let slots = &mut *slots;

        if !slots.state_ready {
            let ctx = KernelInitContext::new(self.metadata(composed), &input_descs, &output_descs);
            slots.state = self.kernel.create_state(&ctx)?;
            slots.state_ready = true;
            KernelInstanceStats::bump(&self.stats.states_created);
            debug!(
                op_type,
                op_name = self.conf.op_name(),
                has_state = slots.state.is_some(),
                "created kernel state"
            );
        }

        let fingerprint = effective.fingerprint();
        let invalidation = match (&slots.last_seen, self.config.cache_policy) {
            (None, _) | (_, CachePolicy::AlwaysRebuild) => CacheInvalidation::AllChanged,
            (Some((last_inputs, last_attrs)), CachePolicy::Reuse) => {
                CacheInvalidation::from_changes(
                    last_inputs != &input_descs,
                    last_attrs != &fingerprint,
                )
            }
        };
        let ctx = KernelCacheContext::new(self.metadata(composed), &input_descs, &output_descs);
        if self
            .kernel
            .refresh_cache(&ctx, invalidation, &mut slots.cache)?
        {
            KernelInstanceStats::bump(&self.stats.caches_built);
            debug!(
                op_type,
                invalidation = invalidation.as_str(),
                has_cache = slots.cache.is_some(),
                "rebuilt kernel cache"
            );
        }
        slots.last_seen = Some((input_descs, fingerprint));

        if self.config.skip_empty_outputs
            && !outputs.is_empty()
            && outputs.iter().all(Tensor::is_empty)
            && !self.kernel.always_compute_when_all_outputs_empty()
        {
            KernelInstanceStats::bump(&self.stats.skipped_computes);
            trace!(op_type, "skipped compute: all outputs empty");
            return Ok(());
        }

        let mut ctx = KernelComputeContext::new(self.metadata(composed), inputs, outputs);
        self.kernel.compute_with_state(
            &mut ctx,
            slots.state.as_deref_mut(),
            slots.cache.as_deref(),
        )?;
        KernelInstanceStats::bump(&self.stats.computes);
        trace!(op_type, op_name = self.conf.op_name(), "computed");
        Ok(())
    }
}

impl fmt::Debug for KernelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelInstance")
            .field("op_name", &self.conf.op_name())
            .field("op_type", &self.conf.op_type_name())
            .field("device", &self.placement.device_type())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
