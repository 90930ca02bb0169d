use crate::BackgroundJob;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type RunTaskFn<Context> =
    Arc<dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

type RetryAtFn = fn(&anyhow::Error, &Value, i64) -> Option<DateTime<Utc>>;

/// Dispatch table mapping module names to their capabilities.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, RegistryEntry<Context>>,
}

struct RegistryEntry<Context> {
    run: RunTaskFn<Context>,
    retry_at: RetryAtFn,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> Clone for RegistryEntry<Context> {
    fn clone(&self) -> Self {
        Self {
            run: Arc::clone(&self.run),
            retry_at: self.retry_at,
        }
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    /// Register `J` under its module name.
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run: RunTaskFn<Context> = Arc::new(|ctx, arg| run_module::<J>(ctx, arg).boxed());
        let entry = RegistryEntry {
            run,
            retry_at: retry_at_of::<J>,
        };
        self.entries.insert(J::MODULE_NAME.to_owned(), entry);
    }

    /// Names of all registered modules.
    pub(crate) fn module_names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Look up the run capability for `module`.
    pub(crate) fn get(&self, module: &str) -> Option<&RunTaskFn<Context>> {
        self.entries.get(module).map(|entry| &entry.run)
    }

    /// Resolve `module`'s custom retry schedule for a failed run.
    ///
    /// Answers `None` when the module is unknown, when it does not define a
    /// schedule, or when its argument no longer deserializes.
    pub(crate) fn retry_at(
        &self,
        module: &str,
        error: &anyhow::Error,
        arg: &Value,
        attempts: i64,
    ) -> Option<DateTime<Utc>> {
        let entry = self.entries.get(module)?;
        (entry.retry_at)(error, arg, attempts)
    }
}

async fn run_module<J: BackgroundJob>(ctx: J::Context, arg: Value) -> anyhow::Result<()> {
    let job: J = serde_json::from_value(arg)?;
    job.run(ctx).await
}

fn retry_at_of<J: BackgroundJob>(
    error: &anyhow::Error,
    arg: &Value,
    attempts: i64,
) -> Option<DateTime<Utc>> {
    let job: J = serde_json::from_value(arg.clone()).ok()?;
    job.retry_at(error, attempts)
}
