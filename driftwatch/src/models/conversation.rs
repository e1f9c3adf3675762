use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::Role;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// An ordered conversation as delivered by the ingestion collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub source: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, messages: Vec<Message>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            source: None,
            messages,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages.iter().map(|m| m.content.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IngestConversationRequest {
    #[validate(length(min = 1, max = 256))]
    pub id: String,
    #[validate(length(max = 1000))]
    pub title: Option<String>,
    pub source: Option<String>,
    #[validate(length(max = 20_000))]
    pub messages: Vec<IngestMessage>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMessage {
    pub role: Role,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl IngestConversationRequest {
    pub fn into_conversation(self) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: self.id,
            title: self.title,
            source: self.source,
            messages: self
                .messages
                .into_iter()
                .map(|m| Message {
                    role: m.role,
                    content: m.content,
                    created_at: m.created_at,
                })
                .collect(),
            created_at: self.created_at.unwrap_or(now),
            updated_at: now,
        }
    }
}
