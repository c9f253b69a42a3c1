use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

type StartFuture = BoxFuture<'static, anyhow::Result<bool>>;

/// A component's start function.
///
/// Sync and async callables are normalized behind one signature. Each call
/// runs in its own task, so a panicking start function is reported as a
/// failed launch instead of tearing down the coordinator.
#[derive(Clone)]
pub struct StartFn {
    inner: Arc<dyn Fn() -> StartFuture + Send + Sync>,
}

/// Why a start function did not report success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartFailure {
    /// Returned `false`
    Falsy,
    Error(String),
    Panicked(String),
    TimedOut(Duration),
}

impl fmt::Display for StartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartFailure::Falsy => write!(f, "start function returned false"),
            StartFailure::Error(e) => write!(f, "start function failed: {}", e),
            StartFailure::Panicked(msg) => write!(f, "start function panicked: {}", msg),
            StartFailure::TimedOut(d) => write!(f, "start function timed out after {:?}", d),
        }
    }
}

impl StartFn {
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move || f().boxed()),
        }
    }

    /// Wrap a synchronous callable; it runs on a runtime worker, so it should not block for long
    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            inner: Arc::new(move || {
                let f = Arc::clone(&f);
                async move { f() }.boxed()
            }),
        }
    }

    /// A start function with a fixed result
    pub fn from_bool(value: bool) -> Self {
        Self::from_sync(move || Ok(value))
    }

    /// Run the start function once, optionally bounded by `limit`
    pub async fn invoke(&self, limit: Option<Duration>) -> Result<(), StartFailure> {
        let mut handle = tokio::spawn((self.inner)());

        let joined = match limit {
            Some(limit) => match timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(StartFailure::TimedOut(limit));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(StartFailure::Falsy),
            Ok(Err(e)) => Err(StartFailure::Error(format!("{:#}", e))),
            Err(join_error) if join_error.is_panic() => {
                let payload = join_error.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(StartFailure::Panicked(message))
            }
            Err(_) => Err(StartFailure::Error("start task was cancelled".to_string())),
        }
    }
}

impl fmt::Debug for StartFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartFn").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[tokio::test]
    async fn test_sync_and_async_results() {
        assert_eq!(StartFn::from_bool(true).invoke(None).await, Ok(()));
        assert_eq!(
            StartFn::from_bool(false).invoke(None).await,
            Err(StartFailure::Falsy)
        );

        let async_fn = StartFn::from_async(|| async { Ok(true) });
        assert_eq!(async_fn.invoke(None).await, Ok(()));
    }

    #[tokio::test]
    async fn test_error_and_panic_are_reported() {
        let failing = StartFn::from_sync(|| Err(anyhow!("port in use")));
        match failing.invoke(None).await {
            Err(StartFailure::Error(msg)) => assert!(msg.contains("port in use")),
            other => panic!("Unexpected result: {:?}", other),
        }

        let panicking = StartFn::from_sync(|| panic!("boom"));
        match panicking.invoke(None).await {
            Err(StartFailure::Panicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_enforced() {
        let slow = StartFn::from_async(|| async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(true)
        });
        assert_eq!(
            slow.invoke(Some(Duration::from_secs(120))).await,
            Err(StartFailure::TimedOut(Duration::from_secs(120)))
        );
    }
}
