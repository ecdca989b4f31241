//! Per-message execution context.

use crate::message::Recipient;
use serde_json::Value;

/// The current state of one conversation while a message is processed.
///
/// Built fresh for every state the message passes through and dropped when
/// the step completes. Hooks use it to read and modify the conversation data
/// and to request further transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct StateContext {
    id: String,
    user: Recipient,
    data: Value,
    chain: Option<String>,
    retransit: bool,
}

impl StateContext {
    pub fn new(id: impl Into<String>, user: Recipient, data: Value) -> Self {
        Self {
            id: id.into(),
            user,
            data,
            chain: None,
            retransit: false,
        }
    }

    /// Current state id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Who this conversation belongs to.
    pub fn user(&self) -> &Recipient {
        &self.user
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Value {
        &mut self.data
    }

    pub fn set_data(&mut self, data: Value) {
        self.data = data;
    }

    /// Requests a direct move to `id` once the current transition has been
    /// persisted, without consulting any transitor.
    ///
    /// Takes precedence over [`retransit`](Self::retransit). The last call
    /// wins.
    pub fn transit(&mut self, id: impl Into<String>) {
        self.chain = Some(id.into());
    }

    /// Requests another matching pass over the same message, starting from
    /// the state this context ends up in.
    pub fn retransit(&mut self) {
        self.retransit = true;
    }

    /// Pending chain target, if any.
    pub fn chained(&self) -> Option<&str> {
        self.chain.as_deref()
    }

    pub fn wants_retransit(&self) -> bool {
        self.retransit
    }

    /// Builds the context for the next state, carrying the data and any
    /// pending chain or retransit request forward.
    pub(crate) fn advance(self, next_id: impl Into<String>) -> Self {
        Self {
            id: next_id.into(),
            user: self.user,
            data: self.data,
            chain: self.chain,
            retransit: self.retransit,
        }
    }

    pub(crate) fn take_chain(&mut self) -> Option<String> {
        self.chain.take()
    }

    pub(crate) fn clear_retransit(&mut self) {
        self.retransit = false;
    }
}
