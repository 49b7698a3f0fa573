use std::{
    pin::Pin,
    sync::{
        Arc,
        LazyLock,
        Weak,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use cmd_util::env::config_test;
use futures::{
    future::FusedFuture,
    Future,
    FutureExt,
    TryFutureExt,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use tokio::runtime::Builder;

use super::{
    JoinError,
    Runtime,
    SpawnHandle,
};

/// Wall clock reading of a freshly created `TestRuntime`. Sep 17th, 2020.
pub static TEST_EPOCH: LazyLock<SystemTime> =
    LazyLock::new(|| SystemTime::UNIX_EPOCH + Duration::from_millis(1600329890789));

pub struct TestDriver {
    tokio_runtime: Option<tokio::runtime::Runtime>,
    state: Arc<Mutex<TestRuntimeState>>,
}

impl TestDriver {
    pub fn new() -> Self {
        Self::new_with_seed(0)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        config_test();
        let tokio_runtime = Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .on_thread_start(|| {
                panic!("TestDriver should not start any threads");
            })
            .build()
            .expect("Failed to create Tokio runtime");
        let rng = ChaCha12Rng::seed_from_u64(seed);
        let creation_time = {
            let _handle = tokio_runtime.enter();
            tokio::time::Instant::now()
        };
        Self {
            tokio_runtime: Some(tokio_runtime),
            state: Arc::new(Mutex::new(TestRuntimeState { rng, creation_time })),
        }
    }

    pub fn rt(&self) -> TestRuntime {
        TestRuntime {
            tokio_handle: self
                .tokio_runtime
                .as_ref()
                .expect("tokio_runtime disappeared?")
                .handle()
                .clone(),
            state: Arc::downgrade(&self.state),
        }
    }

    pub fn run_until<F: Future>(&self, f: F) -> F::Output {
        self.tokio_runtime
            .as_ref()
            .expect("tokio_runtime disappeared?")
            .block_on(f)
    }
}

impl Drop for TestDriver {
    fn drop(&mut self) {
        if let Some(tokio_runtime) = self.tokio_runtime.take() {
            tokio_runtime.shutdown_background();
        }
    }
}

struct TestRuntimeState {
    creation_time: tokio::time::Instant,
    rng: ChaCha12Rng,
}

/// Deterministic runtime: a paused current-thread tokio runtime whose wall
/// clock starts at `TEST_EPOCH` and only moves when tokio's clock does.
#[derive(Clone)]
pub struct TestRuntime {
    tokio_handle: tokio::runtime::Handle,
    state: Weak<Mutex<TestRuntimeState>>,
}

impl TestRuntime {
    fn with_state<R>(&self, f: impl FnOnce(&mut TestRuntimeState) -> R) -> R {
        let state = self
            .state
            .upgrade()
            .expect("TestRuntime is used after `TestDriver` has been dropped");
        let mut state = state.lock();
        f(&mut state)
    }

    pub async fn advance_time(&self, duration: Duration) {
        tokio::time::advance(duration).await
    }
}

impl Runtime for TestRuntime {
    type Handle = TestFutureHandle;
    type Instant = tokio::time::Instant;
    type Rng = ChaCha12Rng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        // NB: `TestRuntime` uses Tokio's current thread runtime with the timer paused,
        // so can still achieve determinism. This sleep will suspend until either time
        // is manually advanced forward, or the Tokio runtime runs out of work to do and
        // auto advances to the next pending timer.
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle {
        let handle = self.tokio_handle.spawn(f);
        TestFutureHandle { handle }
    }

    fn system_time(&self) -> SystemTime {
        let elapsed = tokio::time::Instant::now() - self.with_state(|state| state.creation_time);
        *TEST_EPOCH + elapsed
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha12Rng) -> R) -> R {
        self.with_state(|state| f(&mut state.rng))
    }
}

pub struct TestFutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for TestFutureHandle {
    type Future = Pin<Box<dyn Future<Output = Result<(), JoinError>> + Send>>;

    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn into_join_future(self) -> Self::Future {
        self.handle.map_err(|e| e.into()).boxed()
    }
}
