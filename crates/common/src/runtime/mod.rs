//! Runtime trait for abstracting away OS-esque features and allow different
//! implementations for test, dev, prod, etc.

use std::{
    future::Future,
    marker::Send,
    num::TryFromIntError,
    ops::{
        Add,
        Sub,
    },
    pin::Pin,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use futures::{
    future::FusedFuture,
    select_biased,
    FutureExt,
};
use rand::{
    Rng,
    RngCore,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Future canceled")]
    Canceled,
    #[error("Future panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            let panic = e.into_panic();
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            JoinError::Panicked(anyhow::anyhow!(message))
        }
    }
}

pub trait SpawnHandle: Send + Sync {
    type Future: Future<Output = Result<(), JoinError>>;
    fn shutdown(&mut self);
    fn into_join_future(self) -> Self::Future;
}

/// Shutdown the associated future, preempting it at its next yield point, and
/// join on its result.
pub async fn shutdown_and_join(mut handle: impl SpawnHandle) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.into_join_future().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

/// A Runtime can be considered somewhat like an operating system abstraction
/// for our codebase. Functionality like time, randomness and spawning
/// should operate quite differently between test and prod, e.g., we don't
/// want `wait` to actually sleep in test but instead just to advance local
/// time. Queue heartbeats, orphan timeouts and cache renewal thresholds are all
/// computed from this clock, so tests can step through them deterministically.
pub trait Runtime: Clone + Sync + Send + 'static {
    /// Spawn handle type returned by `spawn`.
    type Handle: SpawnHandle;

    /// `std::time::Instant`-like type returned by `monotonic_now()`.
    type Instant: RuntimeInstant;

    /// Source of randomness associated with the runtime.
    type Rng: Rng;

    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle;

    /// Return (a potentially-virtualized) system time. Compare with
    /// `std::time::UNIX_EPOCH` to obtain a Unix timestamp.
    fn system_time(&self) -> SystemTime;

    fn unix_timestamp(&self) -> UnixTimestamp {
        UnixTimestamp(
            self.system_time()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
        )
    }

    /// Milliseconds since the unix epoch. Queue scores and cache entry times
    /// are stored in this unit.
    fn unix_millis(&self) -> i64 {
        self.unix_timestamp().as_ms_since_epoch().unwrap_or(i64::MAX)
    }

    /// Return (a potentially-virtualized) reading from a monotonic clock.
    fn monotonic_now(&self) -> Self::Instant;

    /// Use the runtime's source of randomness.
    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R;

    fn new_uuid_v4(&self) -> Uuid {
        let bytes = self.with_rng(|rng| {
            let mut bytes = [0u8; 16];
            rng.fill_bytes(&mut bytes);
            bytes
        });
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

/// Abstraction over different `Instant` types associated with a `Runtime`.
pub trait RuntimeInstant:
    Add<Duration, Output = Self> + Clone + Sub<Output = Duration> + Sync + Send + Ord + Eq
{
    fn elapsed(&self) -> Duration;
}

impl RuntimeInstant for std::time::Instant {
    fn elapsed(&self) -> Duration {
        std::time::Instant::elapsed(self)
    }
}

impl RuntimeInstant for tokio::time::Instant {
    fn elapsed(&self) -> Duration {
        tokio::time::Instant::elapsed(self)
    }
}

/// Abstraction over a unix timestamp. Internally it stores a Duration since the
/// unix epoch.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub struct UnixTimestamp(Duration);

impl UnixTimestamp {
    pub fn from_secs_f64(secs: f64) -> Self {
        UnixTimestamp(Duration::from_secs_f64(secs))
    }

    pub fn from_millis(ms: u64) -> Self {
        UnixTimestamp(Duration::from_millis(ms))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }

    pub fn as_system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.0
    }

    pub fn checked_sub(&self, rhs: UnixTimestamp) -> Option<Duration> {
        self.0.checked_sub(rhs.0)
    }

    pub fn as_ms_since_epoch(&self) -> Result<i64, anyhow::Error> {
        self.0
            .as_millis()
            .try_into()
            .map_err(|e: TryFromIntError| anyhow::anyhow!(e))
    }
}

impl Sub<UnixTimestamp> for UnixTimestamp {
    type Output = Duration;

    fn sub(self, rhs: UnixTimestamp) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn add(self, rhs: Duration) -> UnixTimestamp {
        UnixTimestamp(self.0 + rhs)
    }
}

#[async_trait]
pub trait WithTimeout {
    async fn with_timeout<T>(
        &self,
        description: &'static str,
        duration: Duration,
        fut: impl Future<Output = anyhow::Result<T>> + Send,
    ) -> anyhow::Result<T>;
}

#[async_trait]
impl<RT: Runtime> WithTimeout for RT {
    async fn with_timeout<T>(
        &self,
        description: &'static str,
        duration: Duration,
        fut: impl Future<Output = anyhow::Result<T>> + Send,
    ) -> anyhow::Result<T> {
        select_biased! {
            result = fut.fuse() => result,
            _q = self.wait(duration) => {
                let error = TimeoutError { description, duration };
                let msg = error.to_string();
                Err(anyhow::anyhow!(error).context(ErrorMetadata::timeout(msg)))
            },
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("'{description}' timeout after {duration:?}")]
pub struct TimeoutError {
    description: &'static str,
    duration: Duration,
}
