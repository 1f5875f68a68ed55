//! The operator kernel contract and its per-instance driver.
//!
//! A kernel is the device-specific implementation of one operator type. It is created by a
//! registry factory, wrapped in a [`KernelInstance`] per operator instance, and driven through
//! four phases: state creation, cache (re)building, shape inference, and compute.

pub mod context;
mod instance;
pub mod state;

pub use context::{
    KernelCacheContext, KernelComputeContext, KernelInferContext, KernelInitContext,
    KernelMetadata, OpInfo,
};
pub use instance::{KernelInstance, KernelInstanceStats, KernelStatsSnapshot};
pub use state::{downcast_cache, downcast_state, CacheInvalidation, OpKernelCache, OpKernelState};

use crate::error::{OpError, Result};

pub trait OpKernel: Send + Sync {
    /// Creates the long-lived State. Called once per kernel instance.
    fn create_state(&self, _ctx: &KernelInitContext<'_>) -> Result<Option<Box<dyn OpKernelState>>> {
        Ok(None)
    }

    /// Builds the Cache from the current shapes and attributes.
    fn create_cache(&self, _ctx: &KernelCacheContext<'_>) -> Result<Option<Box<dyn OpKernelCache>>> {
        Ok(None)
    }

    /// Decides whether to rebuild `cache` given what changed since the last build.
    ///
    /// The first invocation of an instance always reports [`CacheInvalidation::AllChanged`].
    /// The default rebuilds on any change and keeps the cache otherwise. Returns whether
    /// [`OpKernel::create_cache`] ran. On error `cache` must be left as it was.
    fn refresh_cache(
        &self,
        ctx: &KernelCacheContext<'_>,
        invalidation: CacheInvalidation,
        cache: &mut Option<Box<dyn OpKernelCache>>,
    ) -> Result<bool> {
        if invalidation == CacheInvalidation::Unchanged {
            return Ok(false);
        }
        *cache = self.create_cache(ctx)?;
        Ok(true)
    }

    /// Computes outputs with access to State and Cache. Defaults to [`OpKernel::compute`].
    fn compute_with_state(
        &self,
        ctx: &mut KernelComputeContext<'_>,
        _state: Option<&mut (dyn OpKernelState + 'static)>,
        _cache: Option<&dyn OpKernelCache>,
    ) -> Result<()> {
        self.compute(ctx)
    }

    fn compute(&self, ctx: &mut KernelComputeContext<'_>) -> Result<()> {
        Err(OpError::unimplemented(ctx.op_type_name(), "compute"))
    }

    /// Writes output descriptors from input descriptors and attributes.
    fn infer_shape(&self, ctx: &mut KernelInferContext<'_>) -> Result<()> {
        Err(OpError::unimplemented(ctx.op_type_name(), "infer_shape"))
    }

    /// Whether compute must run even when every output has zero elements.
    fn always_compute_when_all_outputs_empty(&self) -> bool;
}
