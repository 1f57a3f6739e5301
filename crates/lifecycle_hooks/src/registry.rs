use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::{
    JobExceptionContext, JobFailedContext, JobProcessedContext, JobProcessingContext,
    JobReleasedContext, WorkerStartContext, WorkerStoppingContext,
};
use crate::traits::LifecycleHooks;

/// Object safe mirror of [`LifecycleHooks`].
trait ErasedHooks: Send + Sync {
    fn on_worker_start(&self, ctx: WorkerStartContext) -> BoxFuture<'_, ()>;
    fn on_worker_stopping(&self, ctx: WorkerStoppingContext) -> BoxFuture<'_, ()>;
    fn on_job_processing(&self, ctx: JobProcessingContext) -> BoxFuture<'_, ()>;
    fn on_job_processed(&self, ctx: JobProcessedContext) -> BoxFuture<'_, ()>;
    fn on_job_exception(&self, ctx: JobExceptionContext) -> BoxFuture<'_, ()>;
    fn on_job_failed(&self, ctx: JobFailedContext) -> BoxFuture<'_, ()>;
    fn on_job_released(&self, ctx: JobReleasedContext) -> BoxFuture<'_, ()>;
}

impl<H: LifecycleHooks> ErasedHooks for H {
    fn on_worker_start(&self, ctx: WorkerStartContext) -> BoxFuture<'_, ()> {
        LifecycleHooks::on_worker_start(self, ctx).boxed()
    }

    fn on_worker_stopping(&self, ctx: WorkerStoppingContext) -> BoxFuture<'_, ()> {
        LifecycleHooks::on_worker_stopping(self, ctx).boxed()
    }

    fn on_job_processing(&self, ctx: JobProcessingContext) -> BoxFuture<'_, ()> {
        LifecycleHooks::on_job_processing(self, ctx).boxed()
    }

    fn on_job_processed(&self, ctx: JobProcessedContext) -> BoxFuture<'_, ()> {
        LifecycleHooks::on_job_processed(self, ctx).boxed()
    }

    fn on_job_exception(&self, ctx: JobExceptionContext) -> BoxFuture<'_, ()> {
        LifecycleHooks::on_job_exception(self, ctx).boxed()
    }

    fn on_job_failed(&self, ctx: JobFailedContext) -> BoxFuture<'_, ()> {
        LifecycleHooks::on_job_failed(self, ctx).boxed()
    }

    fn on_job_released(&self, ctx: JobReleasedContext) -> BoxFuture<'_, ()> {
        LifecycleHooks::on_job_released(self, ctx).boxed()
    }
}

/// Events a [`HookRegistry`] can dispatch.
pub trait Emittable: Clone + Send + Sync + 'static {
    #[doc(hidden)]
    fn emit_to(self, registry: &HookRegistry) -> BoxFuture<'_, ()>;
}

macro_rules! emittable {
    ($($ctx:ident => $method:ident),* $(,)?) => {
        $(
            impl Emittable for $ctx {
                fn emit_to(self, registry: &HookRegistry) -> BoxFuture<'_, ()> {
                    async move {
                        for hook in &registry.hooks {
                            hook.$method(self.clone()).await;
                        }
                    }
                    .boxed()
                }
            }
        )*
    };
}

emittable! {
    WorkerStartContext => on_worker_start,
    WorkerStoppingContext => on_worker_stopping,
    JobProcessingContext => on_job_processing,
    JobProcessedContext => on_job_processed,
    JobExceptionContext => on_job_exception,
    JobFailedContext => on_job_failed,
    JobReleasedContext => on_job_released,
}

/// Ordered collection of registered hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Box<dyn ErasedHooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: LifecycleHooks>(&mut self, hook: H) -> &mut Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every registered hook for `ctx`, one after the other.
    pub async fn emit<C: Emittable>(&self, ctx: C) {
        ctx.emit_to(self).await
    }
}
