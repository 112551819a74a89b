//! Callable bodies with scripted behaviour.

use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowrun_core::RunContext;

/// Body that fails its first `failures` attempts and then returns the
/// attempt number it succeeded on
pub fn fail_times(
    failures: u32,
) -> impl Fn(RunContext) -> BoxFuture<'static, anyhow::Result<u32>> + Send + Sync + 'static {
    move |ctx: RunContext| {
        async move {
            let attempt = ctx.attempt();
            if attempt <= failures {
                anyhow::bail!("scripted failure on attempt {}", attempt);
            }
            Ok::<_, anyhow::Error>(attempt)
        }
        .boxed()
    }
}

/// Body that always fails with `message`
pub fn always_fail(
    message: impl Into<String>,
) -> impl Fn(RunContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
    let message: Arc<str> = Arc::from(message.into());
    move |_ctx: RunContext| {
        let message = Arc::clone(&message);
        async move { Err::<(), _>(anyhow::anyhow!("{}", message)) }.boxed()
    }
}

/// Body that sleeps for `duration` and then returns `"done"`
pub fn sleep_for(
    duration: Duration,
) -> impl Fn(RunContext) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync + 'static {
    move |_ctx: RunContext| {
        async move {
            tokio::time::sleep(duration).await;
            Ok::<_, anyhow::Error>("done".to_string())
        }
        .boxed()
    }
}

/// Counts how often a body was invoked
#[derive(Debug, Clone, Default)]
pub struct CallCounter {
    calls: Arc<AtomicU32>,
}

impl CallCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invocations so far
    pub fn count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Body that bumps the counter and returns the new count
    pub fn body(
        &self,
    ) -> impl Fn(RunContext) -> BoxFuture<'static, anyhow::Result<u32>> + Send + Sync + 'static
    {
        let calls = Arc::clone(&self.calls);
        move |_ctx: RunContext| {
            let calls = Arc::clone(&calls);
            async move {
                let count = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok::<_, anyhow::Error>(count)
            }
            .boxed()
        }
    }
}
