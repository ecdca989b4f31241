//! Worker loop.

use crate::dispatcher::{Dispatcher, Envelope};
use crate::error::DispatchError;
use chatfsm_core::TransitionEngine;
use std::sync::Arc;
use std::time::Duration;

/// Processes claimed messages until the dispatcher closes.
pub struct Worker {
    slot: usize,
    dispatcher: Arc<Dispatcher>,
    engine: Arc<TransitionEngine>,
    retry_delay: Duration,
}

impl Worker {
    pub fn new(
        slot: usize,
        dispatcher: Arc<Dispatcher>,
        engine: Arc<TransitionEngine>,
        retry_delay: Duration,
    ) -> Self {
        Self {
            slot,
            dispatcher,
            engine,
            retry_delay,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Runs the claim/step/commit loop on the current thread.
    ///
    /// Returns `Ok(())` once the dispatcher is closed and the first fatal
    /// error otherwise.
    pub fn run(&self) -> Result<(), DispatchError> {
        tracing::debug!("Worker {} started", self.slot);
        while let Some(env) = self.dispatcher.begin() {
            self.process(&env)?;
        }
        tracing::debug!("Worker {} stopped", self.slot);
        Ok(())
    }

    /// Steps one claimed message and commits or rolls it back.
    pub fn process(&self, env: &Envelope) -> Result<(), DispatchError> {
        match self.engine.step_for(env.key(), env.message()) {
            Ok(outcome) => {
                tracing::debug!(
                    "[{}] Worker {}: message {} moved '{}' -> '{}' ({} hops)",
                    env.key(),
                    self.slot,
                    env.seq(),
                    outcome.from,
                    outcome.to,
                    outcome.hops
                );
                self.dispatcher.commit(env)
            }
            Err(e) if e.is_fatal() => {
                self.dispatcher.rollback(env);
                tracing::error!(
                    "[{}] Worker {}: message {} failed fatally: {}",
                    env.key(),
                    self.slot,
                    env.seq(),
                    e
                );
                Err(e.into())
            }
            Err(e) => {
                self.dispatcher.rollback_after(env, self.retry_delay);
                tracing::warn!(
                    "[{}] Worker {}: message {} failed ({}): {}; retrying in {:?}",
                    env.key(),
                    self.slot,
                    env.seq(),
                    e.error_code(),
                    e,
                    self.retry_delay
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatfsm_core::{
        always, CoreError, InboundMessage, Key, MachineBuilder, MemoryStore, RecordingApi,
        Recipient, SaveLoader, INITIAL_STATE,
    };
    use serde_json::Value;

    fn setup() -> (Arc<Dispatcher>, Arc<MemoryStore>, Worker) {
        setup_with_delay(Duration::ZERO)
    }

    fn setup_with_delay(retry_delay: Duration) -> (Arc<Dispatcher>, Arc<MemoryStore>, Worker) {
        let mut builder = MachineBuilder::new();
        builder
            .state_mut(INITIAL_STATE)
            .unwrap()
            .on_command("/start", always("started"));
        builder.add_state("started", None, None).unwrap();

        let store = Arc::new(MemoryStore::default());
        let engine = Arc::new(TransitionEngine::new(
            Arc::new(builder.build().unwrap()),
            store.clone(),
            Arc::new(RecordingApi::default()),
        ));
        let dispatcher = Arc::new(Dispatcher::new(4));
        let worker = Worker::new(0, dispatcher.clone(), engine, retry_delay);
        (dispatcher, store, worker)
    }

    fn text(user: i64, body: &str) -> InboundMessage {
        InboundMessage::text(1, Recipient::user(user, "u"), body)
    }

    #[test]
    fn test_success_commits() {
        let (dispatcher, store, worker) = setup();
        dispatcher.feed_one(text(1, "/start")).unwrap();

        let env = dispatcher.try_begin().unwrap();
        worker.process(&env).unwrap();
        assert_eq!(dispatcher.pending_len(), 0);
        assert_eq!(dispatcher.running_len(), 0);
        assert_eq!(store.get(&Key::new("1")).unwrap().state, "started");
    }

    #[test]
    fn test_recoverable_error_rolls_back() {
        let (dispatcher, store, worker) = setup();
        dispatcher.feed_one(text(1, "hello")).unwrap();

        let env = dispatcher.try_begin().unwrap();
        worker.process(&env).unwrap();
        assert_eq!(dispatcher.pending_len(), 1);
        assert!(!dispatcher.is_running(env.key()));
        assert!(store.is_empty());
        assert_eq!(dispatcher.try_begin().unwrap().seq(), env.seq());
    }

    #[test]
    fn test_retry_delay_applies_to_the_message() {
        let (dispatcher, _, worker) = setup_with_delay(Duration::from_secs(30));
        dispatcher.feed_one(text(1, "hello")).unwrap();
        dispatcher.feed_one(text(2, "/start")).unwrap();

        let failed = dispatcher.try_begin().unwrap();
        let started = std::time::Instant::now();
        worker.process(&failed).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        // Another worker gets the other key, never the failed message.
        let next = dispatcher.try_begin().unwrap();
        assert_eq!(next.key(), &Key::new("2"));
        assert!(dispatcher.try_begin().is_none());
        assert_eq!(dispatcher.pending_len(), 2);
    }

    #[test]
    fn test_fatal_error_stops_worker() {
        let (dispatcher, store, worker) = setup();
        store
            .save(&Key::new("1"), "removed_state", &Value::Null)
            .unwrap();
        dispatcher.feed_one(text(1, "/start")).unwrap();

        let err = worker.run().unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Core(CoreError::CorruptedState { .. })
        ));
        assert_eq!(dispatcher.running_len(), 0);
        assert_eq!(dispatcher.pending_len(), 1);
    }

    #[test]
    fn test_run_returns_when_closed() {
        let (dispatcher, _, worker) = setup();
        dispatcher.close();
        assert!(worker.run().is_ok());
    }
}
