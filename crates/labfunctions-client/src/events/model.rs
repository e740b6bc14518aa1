use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Data value the server sends to end a stream. Never handed to consumers.
pub const EXIT_SENTINEL: &str = "exit";

/// One parsed SSE record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
}

impl Event {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Parse one frame. Comment lines (`:`) and unknown fields are skipped;
    /// a frame without `data` yields empty data so keep-alives don't end
    /// the stream.
    pub fn from_frame(frame: &str) -> Self {
        let mut event = Event::default();
        let mut data: Vec<&str> = Vec::new();

        for line in frame.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => data.push(value),
                "event" => event.event = Some(value.to_string()),
                "id" => event.id = Some(value.to_string()),
                "retry" => event.retry = value.trim().parse().ok(),
                _ => {}
            }
        }

        event.data = data.join("\n");
        event
    }

    /// Render as a wire frame, terminator included.
    pub fn to_sse(&self) -> String {
        let mut frame = String::new();
        if let Some(ref id) = self.id {
            frame.push_str(&format!("id: {}\n", id));
        }
        if let Some(ref event) = self.event {
            frame.push_str(&format!("event: {}\n", event));
        }
        if let Some(retry) = self.retry {
            frame.push_str(&format!("retry: {}\n", retry));
        }
        for line in self.data.split('\n') {
            frame.push_str(&format!("data: {}\n", line));
        }
        frame.push('\n');
        frame
    }

    pub fn is_exit(&self) -> bool {
        self.data == EXIT_SENTINEL
    }

    /// Decode a structured (JSON) data payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.data).context("Event data is not valid JSON")
    }
}

/// What a publisher sends: raw text, or a structured value encoded as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Text(String),
    Json(serde_json::Value),
}

impl EventPayload {
    pub fn encode(&self) -> Result<String> {
        match self {
            EventPayload::Text(text) => Ok(text.clone()),
            EventPayload::Json(value) => {
                serde_json::to_string(value).context("Failed to encode event payload")
            }
        }
    }
}

impl From<&str> for EventPayload {
    fn from(text: &str) -> Self {
        EventPayload::Text(text.to_string())
    }
}

impl From<String> for EventPayload {
    fn from(text: String) -> Self {
        EventPayload::Text(text)
    }
}

impl From<serde_json::Value> for EventPayload {
    fn from(value: serde_json::Value) -> Self {
        EventPayload::Json(value)
    }
}
