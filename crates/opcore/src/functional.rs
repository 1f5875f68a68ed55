//! Eager interpreter: call an operator by name on concrete tensors.
//!
//! Each `(op type, device)` pair resolves to one [`UserOpExpr`] whose kernel instance keeps
//! its State and Cache across calls. Expressions are held in an LRU cache sized by
//! [`RuntimeConfig::kernel_instance_capacity`].
//!
//! The key carries no shapes: every eager caller of an op type on a device shares one kernel
//! instance. Alternating input shapes rebuild that instance's Cache on each switch, and
//! concurrent calls run one at a time on it. Callers that need a cache per shape should hold
//! their own [`UserOpExpr`].

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use lru::LruCache;
use tracing::debug;

use crate::attr::AttrMap;
use crate::autograd::{forward_with, ForwardResult};
use crate::config::{runtime_config, RuntimeConfig};
use crate::device::{DeviceType, Placement};
use crate::error::{OpError, Result};
use crate::op::UserOpExpr;
use crate::registry::{current_registry, OpRegistry};
use crate::tensor::{Tensor, TensorTuple};

type InstanceKey = (String, DeviceType);

struct CachedExpr {
    registry: Arc<OpRegistry>,
    expr: Arc<UserOpExpr>,
}

/// Name-keyed eager dispatch over shared kernel instances, one per `(op type, device)`.
pub struct Interpreter {
    exprs: Mutex<LruCache<InstanceKey, CachedExpr>>,
}

impl Interpreter {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            OpError::Config("interpreter capacity must be greater than zero".into())
        })?;
        Ok(Interpreter {
            exprs: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Interpreter::new(config.kernel_instance_capacity)
    }

    fn lock(&self) -> Result<MutexGuard<'_, LruCache<InstanceKey, CachedExpr>>> {
        self.exprs
            .lock()
            .map_err(|_| OpError::execution("interpreter cache lock poisoned"))
    }

    /// Expression for `op_type` on `device`, created against `registry` when missing or
    /// when the cached one came from a different registry.
    pub fn expr(
        &self,
        registry: &Arc<OpRegistry>,
        op_type: &str,
        device: DeviceType,
    ) -> Result<Arc<UserOpExpr>> {
        let key = (op_type.to_string(), device);
        let mut exprs = self.lock()?;
        if let Some(cached) = exprs.get(&key) {
            if Arc::ptr_eq(&cached.registry, registry) {
                return Ok(Arc::clone(&cached.expr));
            }
        }
        let schema = registry.schema(op_type)?;
        let expr = Arc::new(UserOpExpr::from_schema(
            schema,
            format!("{op_type}_{device}"),
            AttrMap::new(),
            Placement::single(device),
        )?);
        debug!(op_type, %device, "created eager operator instance");
        exprs.put(
            key,
            CachedExpr {
                registry: Arc::clone(registry),
                expr: Arc::clone(&expr),
            },
        );
        Ok(expr)
    }

    /// Runs `op_type` on `inputs`, placing it on the device of the first input.
    pub fn call(&self, op_type: &str, inputs: &[Tensor], attrs: &AttrMap) -> Result<TensorTuple> {
        let registry = current_registry()?;
        let expr = self.expr(&registry, op_type, device_of(inputs))?;
        expr.kernel_instance(&registry)?.run(inputs, attrs)
    }

    /// Like [`Interpreter::call`], also capturing gradient state when an input requires grad.
    pub fn call_with_grad(
        &self,
        op_type: &str,
        inputs: &[Tensor],
        attrs: &AttrMap,
    ) -> Result<ForwardResult> {
        let registry = current_registry()?;
        let expr = self.expr(&registry, op_type, device_of(inputs))?;
        forward_with(&registry, &expr, inputs, attrs)
    }

    pub fn cached_exprs(&self) -> usize {
        self.lock().map_or(0, |exprs| exprs.len())
    }
}

fn device_of(inputs: &[Tensor]) -> DeviceType {
    inputs.first().map_or(DeviceType::Cpu, Tensor::device)
}

static DEFAULT_INTERPRETER: OnceLock<Interpreter> = OnceLock::new();

pub fn default_interpreter() -> &'static Interpreter {
    DEFAULT_INTERPRETER.get_or_init(|| {
        let capacity = NonZeroUsize::new(runtime_config().kernel_instance_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        Interpreter {
            exprs: Mutex::new(LruCache::new(capacity)),
        }
    })
}

/// Runs `op_type` through the default interpreter.
pub fn call(op_type: &str, inputs: &[Tensor], attrs: &AttrMap) -> Result<TensorTuple> {
    default_interpreter().call(op_type, inputs, attrs)
}

pub fn call_with_grad(op_type: &str, inputs: &[Tensor], attrs: &AttrMap) -> Result<ForwardResult> {
    default_interpreter().call_with_grad(op_type, inputs, attrs)
}
