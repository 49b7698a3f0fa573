//! Production implementation of the Runtime trait.

use std::{
    future::Future,
    marker::Send,
    ops::{
        Add,
        Sub,
    },
    pin::Pin,
    time::{
        Instant,
        SystemTime,
    },
};

use common::{
    knobs::{
        RUNTIME_STACK_SIZE,
        RUNTIME_WORKER_THREADS,
    },
    runtime::{
        JoinError,
        Runtime,
        RuntimeInstant,
        SpawnHandle,
    },
};
use futures::{
    future::FusedFuture,
    FutureExt,
    TryFutureExt,
};
use rand::rngs::ThreadRng;
use tokio::{
    runtime::{
        Builder,
        Handle as TokioRuntimeHandle,
        Runtime as TokioRuntime,
    },
    time::{
        sleep,
        Duration,
    },
};

use crate::metrics::log_task_spawned;

pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for FutureHandle {
    type Future = Pin<Box<dyn Future<Output = Result<(), JoinError>> + Send>>;

    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn into_join_future(self) -> Self::Future {
        self.handle.map_err(|e| e.into()).boxed()
    }
}

/// Runtime for running in production that sleeps for wallclock time, doesn't
/// mock out any functionality, etc.
#[derive(Clone)]
pub struct ProdRuntime {
    rt: TokioRuntimeHandle,
}

impl ProdRuntime {
    pub fn init_tokio() -> anyhow::Result<TokioRuntime> {
        anyhow::ensure!(
            TokioRuntimeHandle::try_current().is_err(),
            "Tried to create a `ProdRuntime` from within a Tokio context. Are you using \
             `#[tokio::main]` or `#[tokio::test]`?"
        );
        let mut tokio_builder = Builder::new_multi_thread();
        tokio_builder.thread_stack_size(*RUNTIME_STACK_SIZE);
        if *RUNTIME_WORKER_THREADS > 0 {
            tokio_builder.worker_threads(*RUNTIME_WORKER_THREADS);
        }
        let tokio_rt = tokio_builder.enable_all().build()?;
        Ok(tokio_rt)
    }

    /// Create a new tokio-based runtime.
    /// Expected usage:
    /// ```rust
    /// use runtime::prod::ProdRuntime;
    /// fn main() -> anyhow::Result<()> {
    ///     let tokio = ProdRuntime::init_tokio()?;
    ///     let rt = ProdRuntime::new(&tokio);
    ///     rt.block_on(async {});
    ///     Ok(())
    /// }
    /// ```
    /// The `tokio_rt` should live for the duration of `main`. Queue processing
    /// loops spawned through this runtime are joined when it drops.
    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            rt: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.rt.block_on(f)
    }
}

impl Runtime for ProdRuntime {
    type Handle = FutureHandle;
    type Instant = ProdInstant;
    type Rng = ThreadRng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> FutureHandle {
        log_task_spawned(name);
        let handle = self.rt.spawn(f);
        FutureHandle { handle }
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> ProdInstant {
        ProdInstant(Instant::now())
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        let mut rng = rand::rng();
        f(&mut rng)
    }
}

#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq)]
pub struct ProdInstant(Instant);

impl Sub for ProdInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_duration_since(rhs.0)
    }
}

impl Add<Duration> for ProdInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

impl RuntimeInstant for ProdInstant {
    fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}
