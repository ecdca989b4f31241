//! Transition engine - runs one message through the state machine.

use crate::api::Api;
use crate::context::StateContext;
use crate::definition::Machine;
use crate::error::{CoreError, HookPhase};
use crate::matcher::match_transition;
use crate::message::{InboundMessage, Key, KeyBy};
use crate::store::SaveLoader;
use std::sync::Arc;

/// Default bound on transitions a single message may trigger.
pub const DEFAULT_MAX_HOPS: usize = 64;

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How messages map to conversations.
    pub key_by: KeyBy,
    /// Maximum transitions (chained hops included) per message.
    pub max_hops: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_by: KeyBy::Sender,
            max_hops: DEFAULT_MAX_HOPS,
        }
    }
}

/// Result of processing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// State the conversation was in before the message.
    pub from: String,
    /// State persisted last.
    pub to: String,
    /// Transitions performed, chained hops included.
    pub hops: usize,
    /// Matching passes, retransits included.
    pub passes: usize,
}

/// Drives conversations through a [`Machine`].
pub struct TransitionEngine {
    machine: Arc<Machine>,
    store: Arc<dyn SaveLoader>,
    api: Arc<dyn Api>,
    config: EngineConfig,
}

impl TransitionEngine {
    pub fn new(machine: Arc<Machine>, store: Arc<dyn SaveLoader>, api: Arc<dyn Api>) -> Self {
        Self::with_config(machine, store, api, EngineConfig::default())
    }

    pub fn with_config(
        machine: Arc<Machine>,
        store: Arc<dyn SaveLoader>,
        api: Arc<dyn Api>,
        config: EngineConfig,
    ) -> Self {
        Self {
            machine,
            store,
            api,
            config,
        }
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the conversation key of a message.
    pub fn key_of(&self, msg: &InboundMessage) -> Key {
        self.config.key_by.key(msg)
    }

    /// Processes one message for the conversation it belongs to.
    pub fn step(&self, msg: &InboundMessage) -> Result<StepOutcome, CoreError> {
        let key = self.key_of(msg);
        self.step_for(&key, msg)
    }

    /// Processes one message for `key`.
    ///
    /// Loads the stored state, matches, runs hooks and persists after every
    /// transition. Chained transitions and retransit passes all happen here,
    /// so the caller sees a single outcome per message.
    pub fn step_for(&self, key: &Key, msg: &InboundMessage) -> Result<StepOutcome, CoreError> {
        let user = self.config.key_by.recipient(msg).clone();
        let (sid, data) = self.store.load(key)?;

        if !self.machine.contains(&sid) {
            tracing::error!("[{}] Stored state '{}' is not registered", key, sid);
            return Err(CoreError::CorruptedState {
                key: key.to_string(),
                state: sid,
            });
        }

        let mut ctx = StateContext::new(sid.clone(), user, data);
        let mut hops = 0;
        let mut passes = 0;

        loop {
            passes += 1;
            let state = self.machine.target(ctx.id())?;
            let next = match_transition(state, &ctx, msg)?;
            tracing::debug!("[{}] Matched '{}' -> '{}'", key, ctx.id(), next);

            ctx = self.transition(key, msg, ctx, next, &mut hops)?;
            if !ctx.wants_retransit() {
                break;
            }
            ctx.clear_retransit();
            tracing::debug!("[{}] Retransit requested in '{}'", key, ctx.id());
        }

        Ok(StepOutcome {
            from: sid,
            to: ctx.id().to_string(),
            hops,
            passes,
        })
    }

    /// Moves `current` into `next_id`, following chain requests.
    ///
    /// Per hop: leave hook, data carried over, enter hook, save. A hook error
    /// stops everything before the save of its hop; earlier hops stay saved.
    fn transition(
        &self,
        key: &Key,
        msg: &InboundMessage,
        mut current: StateContext,
        mut next_id: String,
        hops: &mut usize,
    ) -> Result<StateContext, CoreError> {
        loop {
            *hops += 1;
            if *hops > self.config.max_hops {
                return Err(CoreError::TooManyHops {
                    state: current.id().to_string(),
                    limit: self.config.max_hops,
                });
            }

            let from = self.machine.target(current.id())?;
            let to = self.machine.target(&next_id)?;

            if let Some(leave) = from.leave() {
                leave
                    .run(msg, &mut current, self.api.as_ref())
                    .map_err(|source| CoreError::HookFailed {
                        state: from.id().to_string(),
                        phase: HookPhase::Leave,
                        source,
                    })?;
            }

            let mut next = current.advance(to.id());

            if let Some(enter) = to.enter() {
                enter
                    .run(msg, &mut next, self.api.as_ref())
                    .map_err(|source| CoreError::HookFailed {
                        state: to.id().to_string(),
                        phase: HookPhase::Enter,
                        source,
                    })?;
            }

            self.store.save(key, next.id(), next.data())?;
            tracing::debug!("[{}] Entered '{}' (hop {})", key, next.id(), hops);

            match next.take_chain() {
                Some(target) => {
                    // A chain request wins over a retransit from the same hop.
                    next.clear_retransit();
                    tracing::debug!("[{}] Chained '{}' -> '{}'", key, next.id(), target);
                    current = next;
                    next_id = target;
                }
                None => return Ok(next),
            }
        }
    }
}
