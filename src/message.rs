//! Conversation messages and the in-memory message log.
//!
//! A [`MessageLog`] is transient: it is built from a context snapshot,
//! mutated, and flattened back into a new snapshot by the caller.

use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
    Agent,
    Action,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::System => write!(f, "system"),
            Self::Agent => write!(f, "agent"),
            Self::Action => write!(f, "action"),
        }
    }
}

/// Which side of the conversation a message is hidden from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HideFrom {
    /// Not shown to the end user (internal bookkeeping).
    Client,
    /// Not included in model prompts.
    Model,
}

/// A side effect the model asked for while generating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Identifier linking the request to its result message.
    pub id: String,
    /// Action name as declared by its provider.
    pub name: String,
    /// JSON arguments supplied by the model.
    pub arguments: serde_json::Value,
}

/// Role-specific message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageBody {
    User {
        content: String,
    },
    System {
        content: String,
    },
    Agent {
        content: String,
        #[serde(default)]
        actions: Vec<ActionRequest>,
    },
    Action {
        action_id: String,
        action_name: String,
        action_success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action_output: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action_error: Option<String>,
    },
}

impl MessageBody {
    /// The role tag of this body.
    pub fn role(&self) -> Role {
        match self {
            Self::User { .. } => Role::User,
            Self::System { .. } => Role::System,
            Self::Agent { .. } => Role::Agent,
            Self::Action { .. } => Role::Action,
        }
    }

    /// Textual content for roles that carry prose, empty otherwise.
    pub fn content(&self) -> &str {
        match self {
            Self::User { content } | Self::System { content } | Self::Agent { content, .. } => {
                content
            }
            Self::Action { .. } => "",
        }
    }
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within one context's message list.
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hide_from: Option<HideFrom>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Build a message with a fresh id and current timestamps.
    pub fn new(body: MessageBody) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            last_updated: now,
            hide_from: None,
            body,
        }
    }

    pub fn role(&self) -> Role {
        self.body.role()
    }
}

/// Role-specific patch applied by [`MessageLog::update`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessagePatch {
    User {
        #[serde(default)]
        content: Option<String>,
    },
    System {
        #[serde(default)]
        content: Option<String>,
    },
    Agent {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        actions: Option<Vec<ActionRequest>>,
    },
    Action {
        #[serde(default)]
        action_success: Option<bool>,
        #[serde(default)]
        action_output: Option<serde_json::Value>,
        #[serde(default)]
        action_error: Option<String>,
    },
}

impl MessagePatch {
    fn role(&self) -> Role {
        match self {
            Self::User { .. } => Role::User,
            Self::System { .. } => Role::System,
            Self::Agent { .. } => Role::Agent,
            Self::Action { .. } => Role::Action,
        }
    }
}

/// Ordered collection of conversation messages.
///
/// Constructed per call from a context snapshot; mutation methods return the
/// affected message id. Flatten back with [`MessageLog::into_messages`].
#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn get_all(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Most recent message whose role is one of `roles`, searching from the
    /// end of the log.
    pub fn find_last_from_roles(&self, roles: &[Role]) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| roles.contains(&m.role()))
    }

    /// The final message in the log, if any.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a new message, assigning id and timestamps.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if an explicit id collides with an existing one.
    pub fn create(&mut self, body: MessageBody) -> Result<String> {
        let message = Message::new(body);
        if self.get(&message.id).is_some() {
            return Err(AgentError::Validation(format!(
                "duplicate message id {}",
                message.id
            )));
        }
        let id = message.id.clone();
        self.messages.push(message);
        Ok(id)
    }

    /// Merge a role-checked patch into an existing message and bump its
    /// `last_updated` timestamp.
    ///
    /// # Errors
    ///
    /// `NotFound` if no message has `id`; `Validation` if the stored role
    /// disagrees with the patch's role.
    pub fn update(&mut self, id: &str, patch: MessagePatch) -> Result<String> {
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| AgentError::NotFound(format!("message {id}")))?;

        if message.role() != patch.role() {
            return Err(AgentError::Validation(format!(
                "message {id} has role {}, patch targets {}",
                message.role(),
                patch.role()
            )));
        }

        match (&mut message.body, patch) {
            (MessageBody::User { content }, MessagePatch::User { content: new }) => {
                if let Some(new) = new {
                    *content = new;
                }
            }
            (MessageBody::System { content }, MessagePatch::System { content: new }) => {
                if let Some(new) = new {
                    *content = new;
                }
            }
            (
                MessageBody::Agent { content, actions },
                MessagePatch::Agent {
                    content: new,
                    actions: new_actions,
                },
            ) => {
                if let Some(new) = new {
                    *content = new;
                }
                if let Some(new_actions) = new_actions {
                    *actions = new_actions;
                }
            }
            (
                MessageBody::Action {
                    action_success,
                    action_output,
                    action_error,
                    ..
                },
                MessagePatch::Action {
                    action_success: new_success,
                    action_output: new_output,
                    action_error: new_error,
                },
            ) => {
                if let Some(new_success) = new_success {
                    *action_success = new_success;
                }
                if new_output.is_some() {
                    *action_output = new_output;
                }
                if new_error.is_some() {
                    *action_error = new_error;
                }
            }
            // Role equality was checked above.
            _ => unreachable!("role mismatch survived validation"),
        }

        message.last_updated = Utc::now();
        Ok(id.to_owned())
    }
}
