use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Chat messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn of a conversation. Messages are values; once handed to a
/// provider they are only ever read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Token accounting for one call.
///
/// `total_tokens` is always `prompt_tokens + completion_tokens`; vendor
/// totals are never trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageInfo {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Combine two partial reports. Vendors split usage across several
    /// events (input tokens up front, output tokens at the end), so each
    /// non-zero field of `later` replaces the earlier value.
    pub fn merge(self, later: UsageInfo) -> Self {
        let prompt = if later.prompt_tokens > 0 {
            later.prompt_tokens
        } else {
            self.prompt_tokens
        };
        let completion = if later.completion_tokens > 0 {
            later.completion_tokens
        } else {
            self.completion_tokens
        };
        Self::new(prompt, completion)
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

// ---------------------------------------------------------------------------
// Non-streaming response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub model: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub usage: UsageInfo,
    /// Extended reasoning text, when the vendor returned any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Streaming events
// ---------------------------------------------------------------------------

/// Phase of an extended-reasoning event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingPhase {
    Start,
    #[default]
    Delta,
    End,
}

impl ThinkingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingPhase::Start => "start",
            ThinkingPhase::Delta => "delta",
            ThinkingPhase::End => "end",
        }
    }
}

/// The canonical event vocabulary every vendor stream is decoded into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ContentStart,
    MessageStart {
        model: String,
    },
    ContentDelta {
        text: String,
    },
    Thinking {
        #[serde(default)]
        text: String,
        #[serde(default)]
        phase: ThinkingPhase,
        #[serde(default)]
        depth: u32,
    },
    Usage {
        usage: UsageInfo,
    },
    MessageStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
    },
    /// Successful end of stream. Carries the full response text.
    ContentEnd {
        content: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ContentStart => "content_start",
            EventKind::MessageStart { .. } => "message_start",
            EventKind::ContentDelta { .. } => "content_delta",
            EventKind::Thinking { .. } => "thinking",
            EventKind::Usage { .. } => "usage",
            EventKind::MessageStop { .. } => "message_stop",
            EventKind::ContentEnd { .. } => "content_end",
            EventKind::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// True for the event that closes a stream (`ContentEnd` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ContentEnd { .. } | EventKind::Error { .. }
        )
    }

    /// Alias of [`Event::is_terminal`].
    pub fn done(&self) -> bool {
        self.is_terminal()
    }

    /// True once the event carries output a caller would render.
    pub fn is_visible(&self) -> bool {
        matches!(
            self.kind,
            EventKind::ContentDelta { .. } | EventKind::Thinking { .. }
        )
    }

    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            EventKind::ContentDelta { text } | EventKind::Thinking { text, .. } => Some(text),
            EventKind::ContentEnd { content } => Some(content),
            _ => None,
        }
    }
}
