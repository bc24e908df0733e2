//! Messages and their delivery priority.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Priority level for messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority - informational only.
    Low,
    /// Normal priority - standard notifications.
    Normal,
    /// High priority - important events.
    High,
    /// Critical priority - requires immediate attention.
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Body format tag, interpreted by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Text,
    Markdown,
    Html,
}

impl MessageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::Html => "html",
        }
    }
}

/// A message to deliver to one or more targets.
///
/// The hub takes ownership of the message on send and never mutates it
/// afterwards, apart from assigning an id when none was given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier. Generated on send when empty.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub format: MessageFormat,
    #[serde(default)]
    pub priority: Priority,
    /// Free-form metadata forwarded to platforms.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Platform-specific payloads, keyed by platform name.
    #[serde(default)]
    pub platform_data: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Create a new message with a title and body.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_format(mut self, format: MessageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_platform_data(
        mut self,
        platform: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        self.platform_data.insert(platform.into(), data);
        self
    }

    /// Platform-specific payload for `platform`, if one was attached.
    pub fn platform_data(&self, platform: &str) -> Option<&serde_json::Value> {
        self.platform_data.get(platform)
    }

    /// Assign a fresh id if the message does not have one yet.
    ///
    /// Returns true when an id was generated.
    pub fn ensure_id(&mut self) -> bool {
        if !self.id.is_empty() {
            return false;
        }
        self.id = Uuid::new_v4().to_string();
        true
    }

    /// Check the message is deliverable.
    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() && self.body.trim().is_empty() {
            return Err(Error::invalid_message("title and body are both empty"));
        }
        Ok(())
    }
}
