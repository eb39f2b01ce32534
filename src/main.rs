use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use smart_retry::{CircuitBreakerStore, NoopObserver, RetryExecutor, RetryPolicy, UpstreamError};

/// Drives a simulated flaky dependency and prints the resulting breaker state.
///
/// Usage: `smart-retry [policy.yaml]`
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    smart_retry::init_tracing("info", false)?;

    let path = std::env::args().nth(1).map(PathBuf::from);
    let policy = RetryPolicy::load(path.as_deref())?;
    let store = Arc::new(CircuitBreakerStore::with_observer(policy, Arc::new(NoopObserver)));
    let executor = RetryExecutor::with_store(Arc::clone(&store));

    let calls = AtomicU32::new(0);
    let result = executor
        .execute(Some("demo-api"), None, || {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match call {
                    1 => Err(UpstreamError::status(429, "rate limited").with_retry_after("1")),
                    2 => Err(UpstreamError::status(503, "service unavailable")),
                    _ => Ok(format!("payload from call {call}")),
                }
            }
        })
        .await;

    match result {
        Ok(body) => println!("succeeded: {body}"),
        Err(err) => println!("failed: {err}"),
    }

    for (key, status) in store.statuses() {
        println!("{key}: {}", serde_json::to_string_pretty(&status)?);
    }

    Ok(())
}
