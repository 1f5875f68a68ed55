//! Name-keyed registries for operator schemas, kernels and gradient functions.
//!
//! Registration happens on a [`Registrar`] during a single-threaded setup phase. Freezing it
//! yields an immutable [`OpRegistry`] whose lookups take no lock. One registry can be
//! installed process-wide; crates contribute entries at link time through
//! [`OP_REGISTRARS`] and [`initialize`] collects them.
//!
//! ```ignore
//! fn register_my_ops(registrar: &mut opcore::registry::Registrar) -> opcore::Result<()> {
//!     registrar.register_kernel("my_op", MyKernel::default)
//! }
//!
//! #[opcore::linkme::distributed_slice(opcore::registry::OP_REGISTRARS)]
//! static REGISTER_MY_OPS: opcore::registry::RegistrarFn = register_my_ops;
//! ```

mod scope;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::autograd::{erase_grad_fn, ErasedGradFunction, OpExprGradFunction};
use crate::error::{OpError, Result};
use crate::kernel::OpKernel;
use crate::op::OpSchema;

pub use scope::{current_registry, push_registry, with_registry, RegistryGuard};

/// Factory that creates a fresh kernel for a new operator instance.
pub type KernelFactory = Box<dyn Fn() -> Box<dyn OpKernel> + Send + Sync>;

/// Factory that creates a fresh, uninitialized gradient function.
pub type GradFnFactory = Box<dyn Fn() -> Box<dyn ErasedGradFunction> + Send + Sync>;

/// Load-time registration hook.
pub type RegistrarFn = fn(&mut Registrar) -> Result<()>;

#[linkme::distributed_slice]
pub static OP_REGISTRARS: [RegistrarFn] = [..];

struct Registry<T> {
    kind: &'static str,
    entries: HashMap<String, T>,
}

impl<T> Registry<T> {
    fn new(kind: &'static str) -> Self {
        Registry {
            kind,
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, name: &str, value: T) -> Result<()> {
        if self.entries.contains_key(name) {
            return Err(OpError::DuplicateRegistration {
                registry: self.kind,
                name: name.to_string(),
            });
        }
        self.entries.insert(name.to_string(), value);
        Ok(())
    }

    fn get(&self, name: &str) -> Result<&T> {
        self.entries.get(name).ok_or_else(|| OpError::NotRegistered {
            registry: self.kind,
            name: name.to_string(),
        })
    }

    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Mutable registration phase.
pub struct Registrar {
    schemas: Registry<Arc<OpSchema>>,
    kernels: Registry<KernelFactory>,
    grad_fns: Registry<GradFnFactory>,
}

impl Default for Registrar {
    fn default() -> Self {
        Registrar::new()
    }
}

impl Registrar {
    pub fn new() -> Self {
        Registrar {
            schemas: Registry::new("schema"),
            kernels: Registry::new("kernel"),
            grad_fns: Registry::new("gradient function"),
        }
    }

    pub fn register_schema(&mut self, schema: OpSchema) -> Result<()> {
        let name = schema.op_type();
        self.schemas.insert(name, Arc::new(schema))
    }

    /// Registers a kernel factory for `op_type`.
    pub fn register_kernel<K, F>(&mut self, op_type: &str, factory: F) -> Result<()>
    where
        K: OpKernel + 'static,
        F: Fn() -> K + Send + Sync + 'static,
    {
        self.kernels
            .insert(op_type, Box::new(move || Box::new(factory()) as Box<dyn OpKernel>))
    }

    /// Registers a gradient-function factory for `op_type`.
    pub fn register_grad_fn<G, F>(&mut self, op_type: &str, factory: F) -> Result<()>
    where
        G: OpExprGradFunction,
        F: Fn() -> G + Send + Sync + 'static,
    {
        let name = op_type.to_string();
        self.grad_fns.insert(
            op_type,
            Box::new(move || erase_grad_fn(name.clone(), factory())),
        )
    }

    /// Runs every link-time registrar in [`OP_REGISTRARS`].
    pub fn register_linked(&mut self) -> Result<()> {
        for registrar in OP_REGISTRARS {
            if let Err(err) = registrar(self) {
                warn!(error = %err, "operator registrar failed");
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn freeze(self) -> OpRegistry {
        debug!(
            schemas = self.schemas.len(),
            kernels = self.kernels.len(),
            grad_fns = self.grad_fns.len(),
            "froze operator registry"
        );
        OpRegistry {
            schemas: self.schemas,
            kernels: self.kernels,
            grad_fns: self.grad_fns,
        }
    }
}

/// Immutable registry produced by [`Registrar::freeze`].
pub struct OpRegistry {
    schemas: Registry<Arc<OpSchema>>,
    kernels: Registry<KernelFactory>,
    grad_fns: Registry<GradFnFactory>,
}

impl OpRegistry {
    pub fn schema(&self, op_type: &str) -> Result<Arc<OpSchema>> {
        self.schemas.get(op_type).cloned()
    }

    pub fn kernel_factory(&self, op_type: &str) -> Result<&KernelFactory> {
        self.kernels.get(op_type)
    }

    pub fn create_kernel(&self, op_type: &str) -> Result<Box<dyn OpKernel>> {
        Ok(self.kernel_factory(op_type)?())
    }

    pub fn grad_fn_factory(&self, op_type: &str) -> Result<&GradFnFactory> {
        self.grad_fns.get(op_type)
    }

    pub fn create_grad_fn(&self, op_type: &str) -> Result<Box<dyn ErasedGradFunction>> {
        Ok(self.grad_fn_factory(op_type)?())
    }

    pub fn has_kernel(&self, op_type: &str) -> bool {
        self.kernels.contains(op_type)
    }

    pub fn has_grad_fn(&self, op_type: &str) -> bool {
        self.grad_fns.contains(op_type)
    }

    pub fn schema_names(&self) -> Vec<String> {
        self.schemas.names()
    }

    pub fn kernel_names(&self) -> Vec<String> {
        self.kernels.names()
    }

    pub fn grad_fn_names(&self) -> Vec<String> {
        self.grad_fns.names()
    }
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistry")
            .field("schemas", &self.schemas.names())
            .field("kernels", &self.kernels.names())
            .field("grad_fns", &self.grad_fns.names())
            .finish()
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<OpRegistry>> = OnceLock::new();
static LINKED_REGISTRY: OnceLock<Result<Arc<OpRegistry>>> = OnceLock::new();

/// Installs `registry` process-wide. Only the first installation succeeds.
pub fn install(registry: OpRegistry) -> Result<Arc<OpRegistry>> {
    let registry = Arc::new(registry);
    GLOBAL_REGISTRY
        .set(Arc::clone(&registry))
        .map_err(|_| OpError::RegistryFrozen("a global operator registry is already installed".into()))?;
    debug!(kernels = registry.kernels.len(), "installed global operator registry");
    Ok(registry)
}

pub fn global() -> Result<Arc<OpRegistry>> {
    GLOBAL_REGISTRY
        .get()
        .cloned()
        .ok_or(OpError::RegistryNotInitialized)
}

/// Builds, freezes and installs the registry from every linked registrar.
///
/// Runs at most once; later calls replay the first outcome, including a failure.
pub fn initialize() -> Result<Arc<OpRegistry>> {
    LINKED_REGISTRY
        .get_or_init(|| {
            let mut registrar = Registrar::new();
            registrar.register_linked()?;
            install(registrar.freeze())
        })
        .clone()
}
