//! Worker pool supervisor.
//!
//! One blocking worker runs per slot, the pool being as large as the
//! dispatcher capacity. Every worker reports its exit on a shared channel;
//! [`Supervisor::resume`] consumes those reports and decides, per the
//! [`FailurePolicy`], whether a slot is respawned or the failure is handed
//! back to the caller.

use crate::config::{Config, WorkerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::stats::DispatchStats;
use crate::worker::Worker;
use chatfsm_core::{Api, Machine, SaveLoader, TransitionEngine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What happens when a worker dies with an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// `resume` returns the error; the failed slot is respawned by the next
    /// `resume` call.
    #[default]
    Halt,
    /// Log the error and respawn the slot after the retry delay.
    Restart,
}

/// Exit report of one worker.
#[derive(Debug)]
struct SlotReport {
    slot: usize,
    result: Result<(), DispatchError>,
}

#[derive(Debug, Default)]
struct Slots {
    /// Slots waiting to be spawned.
    idle: Vec<usize>,
    /// Spawned workers whose report has not been consumed.
    active: usize,
}

/// Runs and watches the worker pool.
pub struct Supervisor {
    dispatcher: Arc<Dispatcher>,
    engine: Arc<TransitionEngine>,
    policy: FailurePolicy,
    retry_delay: Duration,
    pool_size: usize,
    slots: Mutex<Slots>,
    tx: mpsc::Sender<SlotReport>,
    rx: tokio::sync::Mutex<mpsc::Receiver<SlotReport>>,
}

impl Supervisor {
    /// Creates a supervisor with one slot per unit of dispatcher capacity.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        engine: Arc<TransitionEngine>,
        workers: &WorkerConfig,
    ) -> Self {
        let pool_size = dispatcher.capacity();
        let (tx, rx) = mpsc::channel(pool_size);
        Self {
            dispatcher,
            engine,
            policy: workers.failure_policy,
            retry_delay: workers.retry_delay(),
            pool_size,
            slots: Mutex::new(Slots {
                idle: (0..pool_size).rev().collect(),
                active: 0,
            }),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Wires a dispatcher and an engine from `config`.
    pub fn from_config(
        config: &Config,
        machine: Arc<Machine>,
        store: Arc<dyn SaveLoader>,
        api: Arc<dyn Api>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::from_config(&config.dispatch));
        let engine = Arc::new(TransitionEngine::with_config(
            machine,
            store,
            api,
            config.engine_config(),
        ));
        Self::new(dispatcher, engine, &config.workers)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn engine(&self) -> &Arc<TransitionEngine> {
        &self.engine
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        self.dispatcher.stats()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Spawns the pool and supervises it. Same as [`resume`](Self::resume).
    pub async fn start(&self) -> Result<(), DispatchError> {
        tracing::info!(
            "Starting {} workers (policy {:?})",
            self.pool_size,
            self.policy
        );
        self.resume().await
    }

    /// Spawns idle slots and consumes worker reports.
    ///
    /// Returns `Ok(())` once the dispatcher is closed and every worker has
    /// reported. Under [`FailurePolicy::Halt`] the first worker error is
    /// returned instead; calling `resume` again respawns the failed slot and
    /// continues supervising.
    pub async fn resume(&self) -> Result<(), DispatchError> {
        let mut rx = self.rx.lock().await;

        loop {
            self.spawn_idle();
            if self.slots.lock().active == 0 {
                tracing::info!("All workers stopped");
                return Ok(());
            }

            let report = match rx.recv().await {
                Some(report) => report,
                None => return Ok(()),
            };
            self.slots.lock().active -= 1;

            match report.result {
                Ok(()) => {
                    tracing::debug!("Worker {} exited", report.slot);
                    self.slots.lock().idle.push(report.slot);
                }
                Err(e) if self.dispatcher.is_closed() => {
                    tracing::error!(
                        "Worker {} failed during shutdown: {}",
                        report.slot,
                        e
                    );
                }
                Err(e) => {
                    DispatchStats::incr(&self.stats().worker_failures, 1);
                    match self.policy {
                        FailurePolicy::Halt => {
                            tracing::error!("Worker {} failed, halting: {}", report.slot, e);
                            self.slots.lock().idle.push(report.slot);
                            return Err(e);
                        }
                        FailurePolicy::Restart => {
                            tracing::error!(
                                "Worker {} failed, restarting in {:?}: {}",
                                report.slot,
                                self.retry_delay,
                                e
                            );
                            tokio::time::sleep(self.retry_delay).await;
                            self.slots.lock().idle.push(report.slot);
                        }
                    }
                }
            }
        }
    }

    /// Closes the dispatcher. Workers finish their current message and exit;
    /// a running or subsequent `resume` then returns once all have reported.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down worker pool");
        self.dispatcher.close();
    }

    fn spawn_idle(&self) {
        let mut slots = self.slots.lock();
        if self.dispatcher.is_closed() {
            slots.idle.clear();
            return;
        }

        while let Some(slot) = slots.idle.pop() {
            slots.active += 1;
            self.spawn(slot);
        }
    }

    fn spawn(&self, slot: usize) {
        let worker = Worker::new(
            slot,
            self.dispatcher.clone(),
            self.engine.clone(),
            self.retry_delay,
        );
        let handle = tokio::task::spawn_blocking(move || worker.run());

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(DispatchError::WorkerAborted {
                    slot,
                    reason: e.to_string(),
                }),
            };
            // The receiver lives as long as the supervisor.
            let _ = tx.send(SlotReport { slot, result }).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatfsm_core::{
        action, always, CoreError, InboundMessage, Key, MachineBuilder, MemoryStore,
        RecordingApi, Recipient, INITIAL_STATE,
    };
    use serde_json::{json, Value};
    use std::time::Instant;

    fn counting_machine() -> Arc<Machine> {
        let mut builder = MachineBuilder::new();
        builder
            .state_mut(INITIAL_STATE)
            .unwrap()
            .on_fallback(always("counting"));
        builder
            .add_state(
                "counting",
                Some(action(|_, ctx, _| {
                    let n = ctx.data()["count"].as_i64().unwrap_or(0);
                    ctx.set_data(json!({ "count": n + 1 }));
                    Ok(())
                })),
                None,
            )
            .unwrap()
            .on_fallback(always("counting"));
        Arc::new(builder.build().unwrap())
    }

    fn supervisor(
        policy: FailurePolicy,
        capacity: usize,
        store: Arc<MemoryStore>,
    ) -> Arc<Supervisor> {
        let mut config = Config::default();
        config.dispatch.capacity = capacity;
        config.workers.retry_delay_ms = 10;
        config.workers.failure_policy = policy;
        Arc::new(Supervisor::from_config(
            &config,
            counting_machine(),
            store,
            Arc::new(RecordingApi::default()),
        ))
    }

    fn text(user: i64, id: i64) -> InboundMessage {
        InboundMessage::text(id, Recipient::user(user, "u"), "tick")
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_processes_and_shuts_down() {
        let store = Arc::new(MemoryStore::default());
        let sup = supervisor(FailurePolicy::Halt, 2, store.clone());
        let running = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.start().await })
        };

        sup.dispatcher().feed(vec![text(1, 1)]).unwrap();
        sup.dispatcher().feed(vec![text(1, 2)]).unwrap();
        sup.dispatcher().feed(vec![text(2, 3)]).unwrap();
        wait_for(|| sup.stats().snapshot().committed == 3).await;

        assert_eq!(store.get(&Key::new("1")).unwrap().data, json!({"count": 2}));
        assert_eq!(store.get(&Key::new("2")).unwrap().data, json!({"count": 1}));

        sup.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_halt_returns_fatal_error() {
        let store = Arc::new(MemoryStore::default());
        store.save(&Key::new("1"), "ghost", &Value::Null).unwrap();
        let sup = supervisor(FailurePolicy::Halt, 1, store.clone());

        // With a capacity of one, feeding blocks until the message leaves
        // the queue.
        let dispatcher = sup.dispatcher().clone();
        let feeder = tokio::task::spawn_blocking(move || dispatcher.feed_one(text(1, 1)));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Core(CoreError::CorruptedState { .. })
        ));
        assert_eq!(sup.stats().snapshot().worker_failures, 1);
        assert_eq!(sup.dispatcher().pending_len(), 1);

        // Drop the poison message and keep going.
        assert!(sup.dispatcher().discard(0).is_some());
        assert_eq!(feeder.await.unwrap().unwrap(), 0);
        store.remove(&Key::new("1"));

        let running = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.resume().await })
        };
        let dispatcher = sup.dispatcher().clone();
        tokio::task::spawn_blocking(move || dispatcher.feed_one(text(1, 2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.get(&Key::new("1")).unwrap().state, "counting");

        sup.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_keeps_processing() {
        let store = Arc::new(MemoryStore::default());
        store.save(&Key::new("1"), "ghost", &Value::Null).unwrap();
        let sup = supervisor(FailurePolicy::Restart, 2, store.clone());
        let running = {
            let sup = sup.clone();
            tokio::spawn(async move { sup.start().await })
        };

        sup.dispatcher().feed_one(text(2, 1)).unwrap();
        let poison = sup.dispatcher().feed_one(text(1, 2)).unwrap();
        wait_for(|| store.get(&Key::new("2")).is_some()).await;
        wait_for(|| sup.stats().snapshot().worker_failures >= 1).await;

        wait_for(|| sup.dispatcher().discard(poison).is_some()).await;
        sup.shutdown();
        running.await.unwrap().unwrap();
        assert_eq!(sup.dispatcher().pending_len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resume_after_shutdown_returns() {
        let sup = supervisor(FailurePolicy::Halt, 2, Arc::new(MemoryStore::default()));
        sup.shutdown();
        sup.start().await.unwrap();
        sup.resume().await.unwrap();
    }
}
