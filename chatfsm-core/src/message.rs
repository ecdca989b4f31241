//! Inbound message model and conversation keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Kind of a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    /// A single user.
    #[default]
    User,
    /// One-to-one chat with a user.
    Private,
    Group,
    Supergroup,
    Channel,
}

/// Someone (a user) or somewhere (a chat) a message comes from or goes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    #[serde(default)]
    pub kind: RecipientKind,
    /// Display name (full name for users, title for chats).
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Recipient {
    /// Creates a user recipient.
    pub fn user(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            kind: RecipientKind::User,
            name: name.into(),
            username: None,
        }
    }

    /// Creates a chat recipient.
    pub fn chat(id: i64, kind: RecipientKind, title: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            name: title.into(),
            username: None,
        }
    }

    /// Sets the public username.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Returns the stable identifier of this recipient.
    ///
    /// Channels and supergroups with a public username are addressed as
    /// `@username`; everything else by numeric id.
    pub fn identifier(&self) -> String {
        match (self.kind, &self.username) {
            (RecipientKind::Channel | RecipientKind::Supergroup, Some(username)) => {
                format!("@{}", username)
            }
            _ => self.id.to_string(),
        }
    }
}

/// Identity of an independent conversation (one FSM instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(pub String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How conversations are partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyBy {
    /// One conversation per sender, even inside groups.
    #[default]
    Sender,
    /// One conversation per chat; everyone in a group shares it.
    Chat,
}

impl KeyBy {
    /// Returns the recipient a message is associated with.
    pub fn recipient<'a>(&self, msg: &'a InboundMessage) -> &'a Recipient {
        match self {
            KeyBy::Sender => &msg.sender,
            KeyBy::Chat => &msg.chat,
        }
    }

    /// Returns the conversation key of a message.
    pub fn key(&self, msg: &InboundMessage) -> Key {
        Key(self.recipient(msg).identifier())
    }
}

/// Content classification of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Photo,
    Audio,
    Document,
    Sticker,
    Video,
    Voice,
    Contact,
    Location,
    /// Service messages and anything without recognizable content.
    Status,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Photo => "photo",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
            MessageKind::Sticker => "sticker",
            MessageKind::Video => "video",
            MessageKind::Voice => "voice",
            MessageKind::Contact => "contact",
            MessageKind::Location => "location",
            MessageKind::Status => "status",
        }
    }

    /// Classifies provider content.
    ///
    /// `attachments` holds the field names present on the provider payload
    /// (`"contact"`, `"photo"`, ...). Attachments win over text, in the order
    /// the provider documents them.
    pub fn classify(attachments: &[&str], text: Option<&str>) -> Self {
        const ORDER: [(&str, MessageKind); 8] = [
            ("contact", MessageKind::Contact),
            ("location", MessageKind::Location),
            ("sticker", MessageKind::Sticker),
            ("photo", MessageKind::Photo),
            ("video", MessageKind::Video),
            ("voice", MessageKind::Voice),
            ("audio", MessageKind::Audio),
            ("document", MessageKind::Document),
        ];

        for (field, kind) in ORDER {
            if attachments.contains(&field) {
                return kind;
            }
        }
        match text {
            Some(t) if !t.is_empty() => MessageKind::Text,
            _ => MessageKind::Status,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message received from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider message id.
    pub id: i64,
    pub sender: Recipient,
    pub chat: Recipient,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Original author, for forwarded messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_from: Option<Recipient>,
    /// Id of the message this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i64>,
    /// Unix time in seconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Provider-specific content, opaque to the framework.
    #[serde(default)]
    pub payload: Value,
}

impl InboundMessage {
    /// Creates a message of the given kind sent privately by `sender`.
    pub fn new(id: i64, sender: Recipient, kind: MessageKind) -> Self {
        let chat = Recipient {
            kind: RecipientKind::Private,
            ..sender.clone()
        };
        Self {
            id,
            sender,
            chat,
            kind,
            text: None,
            forwarded_from: None,
            reply_to: None,
            timestamp: 0,
            payload: Value::Null,
        }
    }

    /// Creates a private text message.
    pub fn text(id: i64, sender: Recipient, text: impl Into<String>) -> Self {
        let mut msg = Self::new(id, sender, MessageKind::Text);
        msg.text = Some(text.into());
        msg
    }

    /// Places the message in another chat.
    pub fn in_chat(mut self, chat: Recipient) -> Self {
        self.chat = chat;
        self
    }

    /// Marks the message as forwarded from `from`.
    pub fn forwarded(mut self, from: Recipient) -> Self {
        self.forwarded_from = Some(from);
        self
    }

    /// Marks the message as a reply to `message_id`.
    pub fn replying_to(mut self, message_id: i64) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_forward(&self) -> bool {
        self.forwarded_from.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    /// Returns the text, or an empty string for non-text messages.
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}
