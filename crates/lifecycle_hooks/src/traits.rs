use std::future::Future;

use crate::context::{
    JobExceptionContext, JobFailedContext, JobProcessedContext, JobProcessingContext,
    JobReleasedContext, WorkerStartContext, WorkerStoppingContext,
};

/// Observer of worker and job events.
///
/// Every method has an empty default, implement only what you need. Hooks
/// are awaited in registration order on the worker task, so a slow hook
/// slows down job processing.
pub trait LifecycleHooks: Send + Sync + 'static {
    fn on_worker_start(&self, _ctx: WorkerStartContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_worker_stopping(&self, _ctx: WorkerStoppingContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_job_processing(&self, _ctx: JobProcessingContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_job_processed(&self, _ctx: JobProcessedContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_job_exception(&self, _ctx: JobExceptionContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_job_failed(&self, _ctx: JobFailedContext) -> impl Future<Output = ()> + Send {
        async {}
    }

    fn on_job_released(&self, _ctx: JobReleasedContext) -> impl Future<Output = ()> + Send {
        async {}
    }
}
