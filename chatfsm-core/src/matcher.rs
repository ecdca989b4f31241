//! Transitor matching.
//!
//! Precedence, first match wins:
//! 1. forward transitors, for forwarded messages
//! 2. reply transitors, for replies
//! 3. command transitors, for text whose first word is a registered command
//! 4. transitors registered for the message kind
//! 5. fallback transitors
//!
//! Failing one tier falls through to the next one.

use crate::context::StateContext;
use crate::definition::{StateDefinition, Transitors};
use crate::error::CoreError;
use crate::message::{InboundMessage, MessageKind};
use regex::Regex;
use std::sync::LazyLock;

/// Splits a text into its first word and the rest. `\S` keeps commands
/// language agnostic.
static COMMAND_SPLITTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)(\s*.*)?$").expect("command regex is valid"));

/// Returns the command word of a text, if the text has the command shape.
pub fn split_command(text: &str) -> Option<&str> {
    COMMAND_SPLITTER
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn try_each(ts: &Transitors, msg: &InboundMessage, ctx: &StateContext) -> Option<String> {
    ts.iter().find_map(|t| t.test(msg, ctx))
}

fn try_command(
    state: &StateDefinition,
    msg: &InboundMessage,
    ctx: &StateContext,
) -> Option<String> {
    let cmd = split_command(msg.text_or_empty())?;
    let ts = state.commands.get(cmd)?;
    try_each(ts, msg, ctx)
}

/// Picks the next state id for `msg` in `state`.
pub fn match_transition(
    state: &StateDefinition,
    ctx: &StateContext,
    msg: &InboundMessage,
) -> Result<String, CoreError> {
    if msg.is_forward() {
        if let Some(next) = try_each(&state.forward, msg, ctx) {
            tracing::trace!("State '{}': forward transitor matched", state.id());
            return Ok(next);
        }
    }

    if msg.is_reply() {
        if let Some(next) = try_each(&state.reply, msg, ctx) {
            tracing::trace!("State '{}': reply transitor matched", state.id());
            return Ok(next);
        }
    }

    if msg.kind == MessageKind::Text {
        if let Some(next) = try_command(state, msg, ctx) {
            tracing::trace!("State '{}': command transitor matched", state.id());
            return Ok(next);
        }
    }

    if let Some(ts) = state.kinds.get(&msg.kind) {
        if let Some(next) = try_each(ts, msg, ctx) {
            tracing::trace!("State '{}': {} transitor matched", state.id(), msg.kind);
            return Ok(next);
        }
    }

    try_each(&state.fallback, msg, ctx).ok_or_else(|| CoreError::NoMatch {
        state: state.id().to_string(),
    })
}
