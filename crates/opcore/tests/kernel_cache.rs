use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use opcore::config::{CachePolicy, RuntimeConfig};
use opcore::device::{DeviceType, Placement};
use opcore::kernel::{
    downcast_cache, KernelCacheContext, KernelComputeContext, KernelInferContext,
    KernelInitContext, KernelInstance, OpInfo, OpKernel, OpKernelCache, OpKernelState,
};
use opcore::op::{OpSchema, UserOpConf};
use opcore::{AttrMap, ErrorKind, OpError, Shape, Tensor};

struct ScaleCache {
    factor: f32,
    len: usize,
}

#[derive(Default)]
struct ScaleKernel {
    always_compute: bool,
    fail_next_cache: Arc<AtomicBool>,
}

impl OpKernel for ScaleKernel {
    fn create_state(&self, _ctx: &KernelInitContext<'_>) -> opcore::Result<Option<Box<dyn OpKernelState>>> {
        Ok(Some(Box::new(0usize)))
    }

    fn create_cache(&self, ctx: &KernelCacheContext<'_>) -> opcore::Result<Option<Box<dyn OpKernelCache>>> {
        if self.fail_next_cache.swap(false, Ordering::SeqCst) {
            return Err(OpError::execution("injected cache failure"));
        }
        Ok(Some(Box::new(ScaleCache {
            factor: ctx.attr::<f32>("factor")?,
            len: ctx.tensor_desc("x", 0)?.num_elements(),
        })))
    }

    fn infer_shape(&self, ctx: &mut KernelInferContext<'_>) -> opcore::Result<()> {
        let desc = ctx.tensor_desc("x", 0)?.clone();
        *ctx.mut_tensor_desc("y", 0)? = desc;
        Ok(())
    }

    fn compute_with_state(
        &self,
        ctx: &mut KernelComputeContext<'_>,
        state: Option<&mut (dyn OpKernelState + 'static)>,
        cache: Option<&dyn OpKernelCache>,
    ) -> opcore::Result<()> {
        let cache = downcast_cache::<ScaleCache>(cache)
            .ok_or_else(|| OpError::execution("scale kernel ran without its cache"))?;
        if let Some(calls) = state.and_then(|state| state.as_any_mut().downcast_mut::<usize>()) {
            *calls += 1;
        }
        let x = ctx.tensor("x", 0)?.to_vec::<f32>()?;
        assert_eq!(x.len(), cache.len, "cache built for a different shape");
        let y = ctx.tensor_mut("y", 0)?.data_mut::<f32>()?;
        for (out, value) in y.iter_mut().zip(&x) {
            *out = value * cache.factor;
        }
        Ok(())
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        self.always_compute
    }
}

fn scale_schema() -> Arc<OpSchema> {
    Arc::new(
        OpSchema::new("scale")
            .input("x")
            .output("y")
            .attr("factor", 2.0f32),
    )
}

fn instance_with(kernel: impl OpKernel + 'static, config: RuntimeConfig) -> KernelInstance {
    let schema = scale_schema();
    let conf = Arc::new(UserOpConf::from_schema(&schema, "scale0", DeviceType::Cpu));
    KernelInstance::new(Box::new(kernel), conf, schema, Placement::default()).with_config(config)
}

fn vector(len: usize) -> Result<Tensor> {
    let values = (0..len).map(|i| i as f32 + 1.0).collect();
    Ok(Tensor::from_vec(Shape::new([len]), values)?)
}

#[test]
fn unchanged_inputs_reuse_cache() -> Result<()> {
    let instance = instance_with(ScaleKernel::default(), RuntimeConfig::default());
    let x = vector(3)?;
    let first = instance.run(&[x.clone()], &AttrMap::new())?;
    let second = instance.run(&[x], &AttrMap::new())?;

    assert_eq!(first[0].to_vec::<f32>()?, vec![2.0, 4.0, 6.0]);
    assert_eq!(second[0].to_vec::<f32>()?, vec![2.0, 4.0, 6.0]);
    let stats = instance.stats();
    assert_eq!(stats.states_created, 1);
    assert_eq!(stats.caches_built, 1, "unchanged inputs must not rebuild the cache");
    assert_eq!(stats.computes, 2);
    Ok(())
}

#[test]
fn shape_change_rebuilds_exactly_once() -> Result<()> {
    let instance = instance_with(ScaleKernel::default(), RuntimeConfig::default());
    for len in [3, 3, 5, 5, 5] {
        instance.run(&[vector(len)?], &AttrMap::new())?;
    }
    assert_eq!(instance.stats().caches_built, 2);
    assert_eq!(instance.stats().states_created, 1);
    Ok(())
}

#[test]
fn attribute_change_rebuilds_cache() -> Result<()> {
    let instance = instance_with(ScaleKernel::default(), RuntimeConfig::default());
    let x = vector(2)?;
    let triple = AttrMap::builder().set("factor", 3.0f32).build();

    instance.run(&[x.clone()], &AttrMap::new())?;
    let out = instance.run(&[x.clone()], &triple)?;
    assert_eq!(out[0].to_vec::<f32>()?, vec![3.0, 6.0]);
    instance.run(&[x], &triple)?;
    assert_eq!(instance.stats().caches_built, 2);
    Ok(())
}

#[test]
fn non_finite_attribute_change_rebuilds_cache() -> Result<()> {
    let instance = instance_with(ScaleKernel::default(), RuntimeConfig::default());
    let x = vector(2)?;
    let factor = |value: f32| AttrMap::builder().set("factor", value).build();

    let mut built = Vec::new();
    for value in [f32::NEG_INFINITY, f32::INFINITY, f32::NAN, f32::NAN, -0.0, 0.0] {
        instance.run(&[x.clone()], &factor(value))?;
        built.push(instance.stats().caches_built);
    }
    assert_eq!(built, vec![1, 2, 3, 3, 4, 5]);
    Ok(())
}

#[test]
fn rebuild_policy_invalidates_every_call() -> Result<()> {
    let config = RuntimeConfig {
        cache_policy: CachePolicy::AlwaysRebuild,
        ..RuntimeConfig::default()
    };
    let instance = instance_with(ScaleKernel::default(), config);
    let x = vector(4)?;
    for _ in 0..3 {
        instance.run(&[x.clone()], &AttrMap::new())?;
    }
    assert_eq!(instance.stats().caches_built, 3);
    Ok(())
}

#[test]
fn failed_cache_build_is_retried() -> Result<()> {
    let fail = Arc::new(AtomicBool::new(false));
    let kernel = ScaleKernel {
        always_compute: false,
        fail_next_cache: Arc::clone(&fail),
    };
    let instance = instance_with(kernel, RuntimeConfig::default());

    instance.run(&[vector(3)?], &AttrMap::new())?;
    fail.store(true, Ordering::SeqCst);
    let err = instance.run(&[vector(4)?], &AttrMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert_eq!(instance.stats().computes, 1);

    // The previous cache is still valid for the previous shape.
    let out = instance.run(&[vector(3)?], &AttrMap::new())?;
    assert_eq!(out[0].to_vec::<f32>()?, vec![2.0, 4.0, 6.0]);
    assert_eq!(instance.stats().caches_built, 1);

    instance.run(&[vector(4)?], &AttrMap::new())?;
    assert_eq!(instance.stats().caches_built, 2);
    Ok(())
}

#[test]
fn empty_outputs_skip_compute_unless_kernel_insists() -> Result<()> {
    let empty = Tensor::from_vec(Shape::new([0]), Vec::<f32>::new())?;

    let lenient = instance_with(ScaleKernel::default(), RuntimeConfig::default());
    let out = lenient.run(&[empty.clone()], &AttrMap::new())?;
    assert!(out[0].is_empty());
    assert_eq!(lenient.stats().skipped_computes, 1);
    assert_eq!(lenient.stats().computes, 0);
    assert_eq!(lenient.stats().caches_built, 1);

    let insistent = instance_with(
        ScaleKernel {
            always_compute: true,
            ..ScaleKernel::default()
        },
        RuntimeConfig::default(),
    );
    insistent.run(&[empty.clone()], &AttrMap::new())?;
    assert_eq!(insistent.stats().computes, 1);

    let unskipped = instance_with(
        ScaleKernel::default(),
        RuntimeConfig {
            skip_empty_outputs: false,
            ..RuntimeConfig::default()
        },
    );
    unskipped.run(&[empty], &AttrMap::new())?;
    assert_eq!(unskipped.stats().computes, 1);
    assert_eq!(unskipped.stats().skipped_computes, 0);
    Ok(())
}

struct InferOnlyKernel;

impl OpKernel for InferOnlyKernel {
    fn infer_shape(&self, ctx: &mut KernelInferContext<'_>) -> opcore::Result<()> {
        let shape = ctx.shape_view("x", 0)?.clone();
        *ctx.mut_shape_view("y", 0)? = shape;
        Ok(())
    }

    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

struct BareKernel;

impl OpKernel for BareKernel {
    fn always_compute_when_all_outputs_empty(&self) -> bool {
        false
    }
}

#[test]
fn missing_compute_fails_explicitly() -> Result<()> {
    let instance = instance_with(InferOnlyKernel, RuntimeConfig::default());
    let err = instance.run(&[vector(2)?], &AttrMap::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unimplemented);
    assert_eq!(
        err,
        OpError::UnimplementedKernel {
            op_type: "scale".into(),
            method: "compute"
        }
    );

    let bare = instance_with(BareKernel, RuntimeConfig::default());
    let err = bare.infer_outputs(&[vector(2)?], &AttrMap::new()).unwrap_err();
    assert!(matches!(
        err,
        OpError::UnimplementedKernel {
            method: "infer_shape",
            ..
        }
    ));
    Ok(())
}

#[test]
fn wrong_input_count_is_an_arity_violation() -> Result<()> {
    let instance = instance_with(ScaleKernel::default(), RuntimeConfig::default());
    let err = instance
        .run(&[vector(2)?, vector(2)?], &AttrMap::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArityViolation);
    assert_eq!(instance.stats().states_created, 0);
    Ok(())
}

#[test]
fn concurrent_callers_share_one_cache() -> Result<()> {
    let instance = Arc::new(instance_with(ScaleKernel::default(), RuntimeConfig::default()));
    let x = vector(8)?;
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let instance = Arc::clone(&instance);
            let x = x.clone();
            thread::spawn(move || -> opcore::Result<()> {
                for _ in 0..10 {
                    instance.run(&[x.clone()], &AttrMap::new())?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }
    let stats = instance.stats();
    assert_eq!(stats.computes, 40);
    assert_eq!(stats.caches_built, 1);
    assert_eq!(stats.states_created, 1);
    Ok(())
}
