//! State definitions and the setup-time registry.
//!
//! A bot is described by registering states on a [`MachineBuilder`]:
//!
//! ```
//! use chatfsm_core::definition::{action, always, MachineBuilder, INITIAL_STATE};
//!
//! let mut builder = MachineBuilder::new();
//! builder
//!     .state_mut(INITIAL_STATE)
//!     .unwrap()
//!     .on_command("/start", always("ask_name"));
//! builder
//!     .add_state(
//!         "ask_name",
//!         Some(action(|_msg, ctx, api| {
//!             api.send_message(ctx.user(), "What is your name?")
//!         })),
//!         None,
//!     )
//!     .unwrap();
//! let machine = builder.build().unwrap();
//! assert_eq!(machine.len(), 2);
//! ```

use crate::api::Api;
use crate::context::StateContext;
use crate::error::{CoreError, HookError};
use crate::message::{InboundMessage, MessageKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Id of the initial state. It cannot carry hooks.
pub const INITIAL_STATE: &str = "";

/// Picks the next state for a message. Must not have side effects.
pub trait Transitor: Send + Sync {
    /// Returns the next state id, or `None` when the message does not match.
    fn test(&self, msg: &InboundMessage, state: &StateContext) -> Option<String>;
}

impl<F> Transitor for F
where
    F: Fn(&InboundMessage, &StateContext) -> Option<String> + Send + Sync,
{
    fn test(&self, msg: &InboundMessage, state: &StateContext) -> Option<String> {
        self(msg, state)
    }
}

/// Code run when entering or leaving a state. Side effects belong here.
pub trait Action: Send + Sync {
    fn run(
        &self,
        msg: &InboundMessage,
        state: &mut StateContext,
        api: &dyn Api,
    ) -> Result<(), HookError>;
}

impl<F> Action for F
where
    F: Fn(&InboundMessage, &mut StateContext, &dyn Api) -> Result<(), HookError> + Send + Sync,
{
    fn run(
        &self,
        msg: &InboundMessage,
        state: &mut StateContext,
        api: &dyn Api,
    ) -> Result<(), HookError> {
        self(msg, state, api)
    }
}

/// Wraps a closure as a shared [`Transitor`].
pub fn transitor<F>(f: F) -> Arc<dyn Transitor>
where
    F: Fn(&InboundMessage, &StateContext) -> Option<String> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wraps a closure as a shared [`Action`].
pub fn action<F>(f: F) -> Arc<dyn Action>
where
    F: Fn(&InboundMessage, &mut StateContext, &dyn Api) -> Result<(), HookError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// A transitor that matches everything and always picks `id`.
pub fn always(id: impl Into<String>) -> Arc<dyn Transitor> {
    let id = id.into();
    transitor(move |_, _| Some(id.clone()))
}

/// Where a transitor is bound inside a state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransitorCategory {
    /// Tried first for forwarded messages.
    Forward,
    /// Tried for replies.
    Reply,
    /// Text messages whose first word equals the command, case-sensitive.
    Command(String),
    /// Messages of the given kind.
    Kind(MessageKind),
    /// Last resort.
    Fallback,
}

impl fmt::Display for TransitorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitorCategory::Forward => f.write_str("forward"),
            TransitorCategory::Reply => f.write_str("reply"),
            TransitorCategory::Command(cmd) => write!(f, "command {}", cmd),
            TransitorCategory::Kind(kind) => write!(f, "kind {}", kind),
            TransitorCategory::Fallback => f.write_str("fallback"),
        }
    }
}

/// Ordered transitors of one category.
pub(crate) type Transitors = Vec<Arc<dyn Transitor>>;

/// A registered state.
pub struct StateDefinition {
    id: String,
    enter: Option<Arc<dyn Action>>,
    leave: Option<Arc<dyn Action>>,
    pub(crate) forward: Transitors,
    pub(crate) reply: Transitors,
    pub(crate) commands: HashMap<String, Transitors>,
    pub(crate) kinds: HashMap<MessageKind, Transitors>,
    pub(crate) fallback: Transitors,
}

impl StateDefinition {
    fn new(
        id: impl Into<String>,
        enter: Option<Arc<dyn Action>>,
        leave: Option<Arc<dyn Action>>,
    ) -> Self {
        Self {
            id: id.into(),
            enter,
            leave,
            forward: Vec::new(),
            reply: Vec::new(),
            commands: HashMap::new(),
            kinds: HashMap::new(),
            fallback: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn enter(&self) -> Option<&Arc<dyn Action>> {
        self.enter.as_ref()
    }

    pub fn leave(&self) -> Option<&Arc<dyn Action>> {
        self.leave.as_ref()
    }

    /// Binds a transitor to a category. Transitors of the same category are
    /// tried in registration order.
    pub fn register(&mut self, category: TransitorCategory, t: Arc<dyn Transitor>) -> &mut Self {
        match category {
            TransitorCategory::Forward => self.forward.push(t),
            TransitorCategory::Reply => self.reply.push(t),
            TransitorCategory::Command(cmd) => self.commands.entry(cmd).or_default().push(t),
            TransitorCategory::Kind(kind) => self.kinds.entry(kind).or_default().push(t),
            TransitorCategory::Fallback => self.fallback.push(t),
        }
        self
    }

    pub fn on_forward(&mut self, t: Arc<dyn Transitor>) -> &mut Self {
        self.register(TransitorCategory::Forward, t)
    }

    pub fn on_reply(&mut self, t: Arc<dyn Transitor>) -> &mut Self {
        self.register(TransitorCategory::Reply, t)
    }

    pub fn on_command(&mut self, cmd: impl Into<String>, t: Arc<dyn Transitor>) -> &mut Self {
        self.register(TransitorCategory::Command(cmd.into()), t)
    }

    pub fn on_kind(&mut self, kind: MessageKind, t: Arc<dyn Transitor>) -> &mut Self {
        self.register(TransitorCategory::Kind(kind), t)
    }

    pub fn on_fallback(&mut self, t: Arc<dyn Transitor>) -> &mut Self {
        self.register(TransitorCategory::Fallback, t)
    }

    /// Total number of bound transitors.
    pub fn transitor_count(&self) -> usize {
        self.forward.len()
            + self.reply.len()
            + self.commands.values().map(Vec::len).sum::<usize>()
            + self.kinds.values().map(Vec::len).sum::<usize>()
            + self.fallback.len()
    }
}

impl fmt::Debug for StateDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<&String> = self.commands.keys().collect();
        commands.sort();
        f.debug_struct("StateDefinition")
            .field("id", &self.id)
            .field("has_enter", &self.enter.is_some())
            .field("has_leave", &self.leave.is_some())
            .field("commands", &commands)
            .field("transitors", &self.transitor_count())
            .finish()
    }
}

/// One edge declared by a [`StateMaker`].
///
/// The transitor is bound to `parent` and is expected to lead into the
/// maker's state.
#[derive(Clone)]
pub struct TransitorMap {
    /// State the transitor is bound to.
    pub parent: String,
    pub category: TransitorCategory,
    /// `None` for hidden entries.
    pub transitor: Option<Arc<dyn Transitor>>,
    /// Human readable note about the edge.
    pub description: String,
    /// Documents a `transit()` call made by a hook; nothing gets bound.
    pub hidden: bool,
}

impl TransitorMap {
    pub fn new(
        parent: impl Into<String>,
        category: TransitorCategory,
        transitor: Arc<dyn Transitor>,
    ) -> Self {
        Self {
            parent: parent.into(),
            category,
            transitor: Some(transitor),
            description: String::new(),
            hidden: false,
        }
    }

    /// Declares an implicit move made with `transit(target)`.
    pub fn hidden(target: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            parent: target.into(),
            category: TransitorCategory::Fallback,
            transitor: None,
            description: description.into(),
            hidden: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Debug for TransitorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitorMap")
            .field("parent", &self.parent)
            .field("category", &self.category)
            .field("description", &self.description)
            .field("hidden", &self.hidden)
            .finish()
    }
}

/// A self-describing state: its id, hooks and incoming edges.
pub trait StateMaker: Send + Sync {
    /// Id of the state to register.
    fn name(&self) -> String;

    /// Enter and leave hooks.
    fn actions(&self) -> (Option<Arc<dyn Action>>, Option<Arc<dyn Action>>) {
        (None, None)
    }

    /// Edges leading into this state.
    fn transitors(&self) -> Vec<TransitorMap>;
}

/// Collects state definitions before the machine starts.
pub struct MachineBuilder {
    states: HashMap<String, StateDefinition>,
    pending: Vec<TransitorMap>,
}

impl MachineBuilder {
    /// Creates a builder holding only the initial state.
    pub fn new() -> Self {
        let mut states = HashMap::new();
        states.insert(
            INITIAL_STATE.to_string(),
            StateDefinition::new(INITIAL_STATE, None, None),
        );
        Self {
            states,
            pending: Vec::new(),
        }
    }

    /// Registers a state.
    pub fn add_state(
        &mut self,
        id: impl Into<String>,
        enter: Option<Arc<dyn Action>>,
        leave: Option<Arc<dyn Action>>,
    ) -> Result<&mut StateDefinition, CoreError> {
        let id = id.into();
        if self.states.contains_key(&id) {
            return Err(CoreError::DuplicateState { state: id });
        }

        tracing::debug!(
            "Registering state '{}' (enter={}, leave={})",
            id,
            enter.is_some(),
            leave.is_some()
        );
        Ok(self
            .states
            .entry(id.clone())
            .or_insert_with(|| StateDefinition::new(id, enter, leave)))
    }

    /// Registers a state described by a [`StateMaker`].
    ///
    /// The maker's edges are bound when [`build`](Self::build) runs, so they
    /// may refer to states registered later.
    pub fn make_state(&mut self, maker: &dyn StateMaker) -> Result<(), CoreError> {
        let name = maker.name();
        let (enter, leave) = maker.actions();

        if name == INITIAL_STATE {
            if enter.is_some() || leave.is_some() {
                return Err(CoreError::InitialStateHooks);
            }
        } else {
            self.add_state(name, enter, leave)?;
        }

        self.pending.extend(maker.transitors());
        Ok(())
    }

    /// Returns a registered state for binding transitors.
    pub fn state_mut(&mut self, id: &str) -> Option<&mut StateDefinition> {
        self.states.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.states.contains_key(id)
    }

    /// Binds pending maker edges and freezes the registry.
    pub fn build(mut self) -> Result<Machine, CoreError> {
        for map in std::mem::take(&mut self.pending) {
            let Some(t) = map.transitor else {
                continue;
            };
            let state =
                self.states
                    .get_mut(&map.parent)
                    .ok_or_else(|| CoreError::StateNotFound {
                        state: map.parent.clone(),
                    })?;
            state.register(map.category, t);
        }

        tracing::info!("State machine built with {} states", self.states.len());
        Ok(Machine {
            states: self.states,
        })
    }
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The frozen state registry shared by all workers.
#[derive(Debug)]
pub struct Machine {
    states: HashMap<String, StateDefinition>,
}

impl Machine {
    pub fn get(&self, id: &str) -> Option<&StateDefinition> {
        self.states.get(id)
    }

    /// Looks up a state that a transition wants to move into.
    pub fn target(&self, id: &str) -> Result<&StateDefinition, CoreError> {
        self.get(id).ok_or_else(|| CoreError::StateNotFound {
            state: id.to_string(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.states.contains_key(id)
    }

    /// Registered state ids, sorted.
    pub fn state_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.states.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hello;

    impl StateMaker for Hello {
        fn name(&self) -> String {
            "hello".to_string()
        }

        fn actions(&self) -> (Option<Arc<dyn Action>>, Option<Arc<dyn Action>>) {
            let enter = action(|_, ctx, _| {
                ctx.transit(INITIAL_STATE);
                Ok(())
            });
            (Some(enter), None)
        }

        fn transitors(&self) -> Vec<TransitorMap> {
            vec![
                TransitorMap::new("dispatch", TransitorCategory::Fallback, always("hello")),
                TransitorMap::hidden(INITIAL_STATE, "work done, back to initial state"),
            ]
        }
    }

    #[test]
    fn test_initial_state_exists() {
        let machine = MachineBuilder::new().build().unwrap();
        assert!(machine.contains(INITIAL_STATE));
        assert_eq!(machine.len(), 1);
    }

    #[test]
    fn test_duplicate_state() {
        let mut builder = MachineBuilder::new();
        builder.add_state("a", None, None).unwrap();

        let err = builder.add_state("a", None, None).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateState { ref state } if state == "a"));

        let err = builder.add_state(INITIAL_STATE, None, None).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_register_categories() {
        let mut builder = MachineBuilder::new();
        let state = builder.add_state("a", None, None).unwrap();
        state
            .on_forward(always("f"))
            .on_reply(always("r"))
            .on_command("/go", always("c"))
            .on_command("/go", always("c2"))
            .on_kind(MessageKind::Photo, always("p"))
            .on_fallback(always("fb"));

        assert_eq!(state.transitor_count(), 6);
        assert_eq!(state.commands["/go"].len(), 2);
    }

    #[test]
    fn test_state_maker_unknown_parent() {
        let mut builder = MachineBuilder::new();
        builder.make_state(&Hello).unwrap();

        let err = builder.build().unwrap_err();
        assert!(matches!(err, CoreError::StateNotFound { ref state } if state == "dispatch"));
    }

    #[test]
    fn test_state_maker_binds_to_parent() {
        let mut builder = MachineBuilder::new();
        builder.add_state("dispatch", None, None).unwrap();
        builder.make_state(&Hello).unwrap();

        let machine = builder.build().unwrap();
        assert_eq!(machine.state_ids(), vec!["", "dispatch", "hello"]);
        assert_eq!(machine.get("dispatch").unwrap().fallback.len(), 1);
        assert!(machine.get("hello").unwrap().enter().is_some());
        // Hidden edges bind nothing.
        assert_eq!(machine.get(INITIAL_STATE).unwrap().transitor_count(), 0);
    }

    #[test]
    fn test_initial_state_maker_rejects_hooks() {
        struct BadInitial;
        impl StateMaker for BadInitial {
            fn name(&self) -> String {
                INITIAL_STATE.to_string()
            }
            fn actions(&self) -> (Option<Arc<dyn Action>>, Option<Arc<dyn Action>>) {
                (Some(action(|_, _, _| Ok(()))), None)
            }
            fn transitors(&self) -> Vec<TransitorMap> {
                Vec::new()
            }
        }

        let mut builder = MachineBuilder::new();
        let err = builder.make_state(&BadInitial).unwrap_err();
        assert!(matches!(err, CoreError::InitialStateHooks));
    }

    #[test]
    fn test_target_lookup() {
        let machine = MachineBuilder::new().build().unwrap();
        assert!(machine.target(INITIAL_STATE).is_ok());
        assert!(matches!(
            machine.target("nowhere"),
            Err(CoreError::StateNotFound { .. })
        ));
    }
}
