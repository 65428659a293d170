//! Consumer manager
//!
//! Supervises named, long-running consumers. Each started consumer gets its own task:
//!
//! ```text
//! factory() ─▶ live map ─▶ attach shutdown ─▶ start_consuming() ─▶ close() ─▶ outcome
//!                                                  ▲
//!                   stop_consumer / stop_all / ShutdownSignal ─┘ (cooperative stop)
//! ```
//!
//! Nothing is aborted: stopping asks the consumer to leave its loop, then waits for the
//! task with a bound.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::BrokerError;
use crate::metrics;
use crate::shutdown::ShutdownSignal;

/// Connection and consumption state reported by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerHealth {
    pub consuming: bool,
    pub connected: bool,
}

impl ConsumerHealth {
    pub fn is_healthy(&self) -> bool {
        self.consuming && self.connected
    }
}

/// A long-running queue consumer supervised by [`ConsumerManager`].
#[async_trait]
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    /// Receive the process-wide shutdown signal before consumption starts.
    fn attach_shutdown(&self, _shutdown: ShutdownSignal) {}

    /// Consume until stopped. `Err` when consumption broke down.
    async fn start_consuming(&self) -> Result<(), BrokerError>;

    /// Ask the consume loop to return. Idempotent, callable from any task.
    fn stop(&self);

    /// Release the connection. Called once after `start_consuming` returns.
    async fn close(&self);

    fn health(&self) -> ConsumerHealth;
}

/// Builds a fresh consumer instance for each run.
pub type ConsumerFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Consumer>, BrokerError>> + Send + Sync>;

/// Last known state of a started consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Running,
    Completed,
    Error(String),
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Running => f.write_str("Running"),
            ConsumerState::Completed => f.write_str("Completed"),
            ConsumerState::Error(detail) => write!(f, "Error: {}", detail),
        }
    }
}

struct Run {
    id: u64,
    halted: bool,
    join: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    factories: BTreeMap<String, ConsumerFactory>,
    runs: HashMap<String, Run>,
    /// Instances whose run task is alive, tagged with their run id.
    live: HashMap<String, (u64, Arc<dyn Consumer>)>,
    outcomes: BTreeMap<String, ConsumerState>,
    next_run: u64,
}

impl State {
    /// Whether run `id` of `name` was asked to stop (or was cleared away entirely).
    fn is_halted(&self, name: &str, id: u64) -> bool {
        self.runs
            .get(name)
            .is_none_or(|run| run.id != id || run.halted)
    }

    fn is_current(&self, name: &str, id: u64) -> bool {
        self.runs.get(name).is_some_and(|run| run.id == id)
    }
}

type SharedState = Arc<Mutex<State>>;

fn lock(state: &SharedState) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ConsumerManager {
    state: SharedState,
    shutdown: ShutdownSignal,
    stop_timeout: Duration,
}

impl ConsumerManager {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            shutdown,
            stop_timeout: Duration::from_secs(30),
        }
    }

    /// Upper bound on waiting for consumer tasks when stopping.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Remember how to build `name`. Does not start anything.
    pub fn register_consumer<F, Fut>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Consumer>, BrokerError>> + Send + 'static,
    {
        let name = name.into();
        let factory: ConsumerFactory = Arc::new(move || factory().boxed());
        info!(consumer = %name, "Consumer registered");
        lock(&self.state).factories.insert(name, factory);
    }

    /// Start every registered consumer. Returns how many were started.
    pub fn start_all_consumers(&self) -> usize {
        let names: Vec<String> = {
            let state = lock(&self.state);
            if state.factories.is_empty() {
                warn!("No consumers registered, nothing to start");
                return 0;
            }
            if state.outcomes.values().any(|s| *s == ConsumerState::Running) {
                warn!("Consumers already running");
                return 0;
            }
            state.factories.keys().cloned().collect()
        };

        let mut started = 0;
        for name in names {
            match self.start_consumer(&name) {
                Ok(()) => started += 1,
                Err(e) => warn!(consumer = %name, error = %e, "Could not start consumer"),
            }
        }
        info!(count = started, "Consumers started");
        started
    }

    /// Spawn the run task for one registered consumer.
    pub fn start_consumer(&self, name: &str) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        let factory = state
            .factories
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::ConsumerNotRegistered(name.to_string()))?;
        if state.outcomes.get(name) == Some(&ConsumerState::Running) {
            return Err(BrokerError::ConsumerAlreadyRunning(name.to_string()));
        }

        state.next_run += 1;
        let id = state.next_run;
        let join = tokio::spawn(run_consumer(
            self.state.clone(),
            name.to_string(),
            id,
            factory,
            self.shutdown.clone(),
        ));
        state.runs.insert(
            name.to_string(),
            Run {
                id,
                halted: false,
                join: Some(join),
            },
        );
        state.outcomes.insert(name.to_string(), ConsumerState::Running);

        info!(consumer = %name, "Consumer starting");
        Ok(())
    }

    /// Stop one consumer and wait (bounded) for its task. False when it was not running.
    pub async fn stop_consumer(&self, name: &str) -> bool {
        let (consumer, join) = {
            let mut state = lock(&self.state);
            if state.outcomes.get(name) != Some(&ConsumerState::Running) {
                warn!(consumer = %name, "Consumer not running, nothing to stop");
                return false;
            }
            let consumer = state.live.get(name).map(|(_, consumer)| consumer.clone());
            let join = state.runs.get_mut(name).and_then(|run| {
                run.halted = true;
                run.join.take()
            });
            (consumer, join)
        };

        if let Some(consumer) = consumer {
            consumer.stop();
        }
        if let Some(join) = join {
            if tokio::time::timeout(self.stop_timeout, join).await.is_err() {
                warn!(consumer = %name, "Consumer did not stop in time");
            }
        }
        info!(consumer = %name, "Consumer stopped");
        true
    }

    /// Stop every live consumer, then wait (bounded) for all tasks.
    ///
    /// Bookkeeping is cleared even when some task did not finish in time. Returns false
    /// in that case.
    pub async fn stop_all_consumers(&self) -> bool {
        let (consumers, joins) = {
            let mut state = lock(&self.state);
            for run in state.runs.values_mut() {
                run.halted = true;
            }
            let consumers: Vec<Arc<dyn Consumer>> =
                state.live.values().map(|(_, consumer)| consumer.clone()).collect();
            let joins: Vec<JoinHandle<()>> = state
                .runs
                .values_mut()
                .filter_map(|run| run.join.take())
                .collect();
            (consumers, joins)
        };

        info!(count = consumers.len(), "Stopping consumers");
        for consumer in &consumers {
            consumer.stop();
        }

        let pending = joins.len();
        let finished = tokio::time::timeout(self.stop_timeout, join_all(joins))
            .await
            .is_ok();
        if !finished {
            warn!(
                tasks = pending,
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "Consumer tasks did not finish in time"
            );
        }

        {
            let mut state = lock(&self.state);
            state.runs.clear();
            state.live.clear();
            state.outcomes.clear();
        }
        metrics::consumers_running(0);
        finished
    }

    /// `Running`, `Completed` or `Error: <detail>` for each started consumer.
    pub fn consumer_status(&self) -> BTreeMap<String, String> {
        lock(&self.state)
            .outcomes
            .iter()
            .map(|(name, state)| (name.clone(), state.to_string()))
            .collect()
    }

    pub fn consumer_state(&self, name: &str) -> Option<ConsumerState> {
        lock(&self.state).outcomes.get(name).cloned()
    }

    /// Health of each consumer whose task is currently alive.
    pub fn consumer_health(&self) -> BTreeMap<String, ConsumerHealth> {
        lock(&self.state)
            .live
            .iter()
            .map(|(name, (_, consumer))| (name.clone(), consumer.health()))
            .collect()
    }

    /// No consumer failed and every live one is consuming on an open connection.
    pub fn all_healthy(&self) -> bool {
        let state = lock(&self.state);
        let none_failed = !state
            .outcomes
            .values()
            .any(|s| matches!(s, ConsumerState::Error(_)));
        none_failed && state.live.values().all(|(_, c)| c.health().is_healthy())
    }
}

async fn run_consumer(state: SharedState, name: String, id: u64, factory: ConsumerFactory, shutdown: ShutdownSignal) {
    let outcome = match AssertUnwindSafe(factory()).catch_unwind().await {
        Ok(Ok(consumer)) => supervise(&state, &name, id, consumer, shutdown).await,
        Ok(Err(e)) => ConsumerState::Error(format!("failed to create consumer: {}", e)),
        Err(panic) => ConsumerState::Error(panic_message(panic)),
    };

    match &outcome {
        ConsumerState::Error(detail) => {
            error!(consumer = %name, error = %detail, "Consumer exited with error");
            metrics::consumer_exited(&name, "error");
        }
        _ => {
            info!(consumer = %name, "Consumer completed");
            metrics::consumer_exited(&name, "completed");
        }
    }

    let mut state = lock(&state);
    if state.is_current(&name, id) {
        state.outcomes.insert(name, outcome);
    }
}

async fn supervise(
    state: &SharedState,
    name: &str,
    id: u64,
    consumer: Arc<dyn Consumer>,
    shutdown: ShutdownSignal,
) -> ConsumerState {
    let halted = {
        let mut state = lock(state);
        state.live.insert(name.to_string(), (id, consumer.clone()));
        metrics::consumers_running(state.live.len());
        state.is_halted(name, id)
    };

    consumer.attach_shutdown(shutdown.clone());
    if halted || shutdown.is_triggered() {
        consumer.stop();
    }

    let result = AssertUnwindSafe(consume_until_shutdown(consumer.as_ref(), &shutdown))
        .catch_unwind()
        .await;

    if AssertUnwindSafe(consumer.close()).catch_unwind().await.is_err() {
        error!(consumer = %name, "Consumer panicked while closing");
    }

    {
        let mut state = lock(state);
        if state.live.get(name).is_some_and(|(live_id, _)| *live_id == id) {
            state.live.remove(name);
        }
        metrics::consumers_running(state.live.len());
    }

    match result {
        Ok(Ok(())) => ConsumerState::Completed,
        Ok(Err(e)) => ConsumerState::Error(e.to_string()),
        Err(panic) => ConsumerState::Error(panic_message(panic)),
    }
}

/// Run the consumer; when shutdown fires, stop it and let the loop drain.
async fn consume_until_shutdown(consumer: &dyn Consumer, shutdown: &ShutdownSignal) -> Result<(), BrokerError> {
    let run = consumer.start_consuming();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = shutdown.wait() => {
            info!(consumer = %consumer.name(), "Shutdown signalled, stopping consumer");
            consumer.stop();
            run.await
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("panicked: {}", detail)
}
