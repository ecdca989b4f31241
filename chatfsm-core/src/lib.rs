//! # chatfsm-core
//!
//! Conversation state machines for chat bots.
//!
//! This crate provides:
//! - State and transitor definitions
//! - Message matching with forward/reply/command/kind/fallback precedence
//! - The transition engine with enter/leave hooks, chaining and retransit
//! - The persistence and messaging seams (`SaveLoader`, `Api`)

pub mod api;
pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod message;
pub mod store;

pub use api::{Api, Outbound, RecordingApi};
pub use context::StateContext;
pub use definition::{
    action, always, transitor, Action, Machine, MachineBuilder, StateDefinition, StateMaker,
    Transitor, TransitorCategory, TransitorMap, INITIAL_STATE,
};
pub use engine::{EngineConfig, StepOutcome, TransitionEngine, DEFAULT_MAX_HOPS};
pub use error::{CoreError, HookError, HookPhase, StoreError};
pub use matcher::match_transition;
pub use message::{InboundMessage, Key, KeyBy, MessageKind, Recipient, RecipientKind};
pub use store::{MemoryStore, SaveLoader, StateInitializer, StoredState};
