//! Handle to the messaging provider, passed to hooks.
//!
//! The wire client lives outside this crate; hooks only see this trait.

use crate::error::HookError;
use crate::message::Recipient;
use parking_lot::Mutex;

/// Outbound operations a hook may perform.
pub trait Api: Send + Sync {
    /// Returns the bot's own identity.
    fn me(&self) -> Result<Recipient, HookError>;

    /// Sends a text message.
    fn send_message(&self, to: &Recipient, text: &str) -> Result<(), HookError>;

    /// Forwards `message_id` from `from` to `to`.
    fn forward_message(
        &self,
        to: &Recipient,
        from: &Recipient,
        message_id: i64,
    ) -> Result<(), HookError>;
}

/// An outbound call captured by [`RecordingApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text {
        to: Recipient,
        text: String,
    },
    Forward {
        to: Recipient,
        from: Recipient,
        message_id: i64,
    },
}

/// In-memory [`Api`] that records every call instead of sending it.
#[derive(Debug)]
pub struct RecordingApi {
    bot: Recipient,
    sent: Mutex<Vec<Outbound>>,
}

impl RecordingApi {
    pub fn new(bot: Recipient) -> Self {
        Self {
            bot,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of everything sent so far.
    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().clone()
    }

    /// Returns the texts sent to `to`, in order.
    pub fn texts_to(&self, to: &Recipient) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|o| match o {
                Outbound::Text { to: t, text } if t == to => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for RecordingApi {
    fn default() -> Self {
        Self::new(Recipient::user(0, "bot"))
    }
}

impl Api for RecordingApi {
    fn me(&self) -> Result<Recipient, HookError> {
        Ok(self.bot.clone())
    }

    fn send_message(&self, to: &Recipient, text: &str) -> Result<(), HookError> {
        self.sent.lock().push(Outbound::Text {
            to: to.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    fn forward_message(
        &self,
        to: &Recipient,
        from: &Recipient,
        message_id: i64,
    ) -> Result<(), HookError> {
        self.sent.lock().push(Outbound::Forward {
            to: to.clone(),
            from: from.clone(),
            message_id,
        });
        Ok(())
    }
}
