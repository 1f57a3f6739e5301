//! Observer hooks fired by the worker around its own lifecycle and around
//! every job it runs.
//!
//! ```
//! use rabbit_worker_lifecycle_hooks::{HookRegistry, JobFailedContext, LifecycleHooks};
//!
//! struct AlertOnFailure;
//!
//! impl LifecycleHooks for AlertOnFailure {
//!     async fn on_job_failed(&self, ctx: JobFailedContext) {
//!         eprintln!("job {} archived: {}", ctx.job.job_id, ctx.error);
//!     }
//! }
//!
//! let mut hooks = HookRegistry::new();
//! hooks.register(AlertOnFailure);
//! ```

mod context;
mod registry;
mod traits;

pub use context::*;
pub use registry::{Emittable, HookRegistry};
pub use traits::LifecycleHooks;
