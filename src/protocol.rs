//! Messages exchanged with browser clients.
//!
//! Outbound updates carry a widget index and a payload whose shape depends on
//! the widget type. Over SSE the event name is the SSE `event:` field and the
//! body is `{"widgetIndex": n, "data": {...}}`; over WebSocket the same object
//! gains an `"event"` key. Raw bytes (images, button and terminal output) are
//! base64 encoded; file contents shown as text are sent as (lossy) UTF-8.

use crate::executor::Origin;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileContents {
    pub contents: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageContents {
    /// Base64 of the image file.
    pub data: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ButtonOutput {
    Output {
        origin: Origin,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Finished {
        exit_code: Option<i32>,
        truncated: bool,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TerminalOutput {
    Output { data: String },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Text(FileContents),
    Image(ImageContents),
    Button(ButtonOutput),
    Editor(FileContents),
    Terminal(TerminalOutput),
}

impl Payload {
    pub fn event(&self) -> &'static str {
        match self {
            Payload::Text(_) => "textContents",
            Payload::Image(_) => "imageData",
            Payload::Button(_) => "buttonOutput",
            Payload::Editor(_) => "editorContents",
            Payload::Terminal(_) => "terminalOutput",
        }
    }
}

/// One outbound event for one widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub widget_index: usize,
    pub payload: Payload,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Body<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
    widget_index: usize,
    data: &'a Payload,
}

impl Update {
    pub fn new(widget_index: usize, payload: Payload) -> Self {
        Self {
            widget_index,
            payload,
        }
    }

    pub fn text(widget_index: usize, contents: &[u8], errors: Vec<String>) -> Self {
        Self::new(
            widget_index,
            Payload::Text(FileContents {
                contents: String::from_utf8_lossy(contents).into_owned(),
                errors,
            }),
        )
    }

    pub fn editor(widget_index: usize, contents: &[u8], errors: Vec<String>) -> Self {
        Self::new(
            widget_index,
            Payload::Editor(FileContents {
                contents: String::from_utf8_lossy(contents).into_owned(),
                errors,
            }),
        )
    }

    pub fn image(widget_index: usize, data: &[u8], errors: Vec<String>) -> Self {
        Self::new(
            widget_index,
            Payload::Image(ImageContents {
                data: BASE64.encode(data),
                errors,
            }),
        )
    }

    pub fn button_chunk(widget_index: usize, origin: Origin, chunk: &[u8]) -> Self {
        Self::new(
            widget_index,
            Payload::Button(ButtonOutput::Output {
                origin,
                data: BASE64.encode(chunk),
            }),
        )
    }

    pub fn button_finished(widget_index: usize, exit_code: Option<i32>, truncated: bool) -> Self {
        Self::new(
            widget_index,
            Payload::Button(ButtonOutput::Finished {
                exit_code,
                truncated,
            }),
        )
    }

    pub fn button_error(widget_index: usize, message: impl Into<String>) -> Self {
        Self::new(
            widget_index,
            Payload::Button(ButtonOutput::Error {
                message: message.into(),
            }),
        )
    }

    pub fn terminal(widget_index: usize, data: &[u8]) -> Self {
        Self::new(
            widget_index,
            Payload::Terminal(TerminalOutput::Output {
                data: BASE64.encode(data),
            }),
        )
    }

    pub fn terminal_error(widget_index: usize, message: impl Into<String>) -> Self {
        Self::new(
            widget_index,
            Payload::Terminal(TerminalOutput::Error {
                message: message.into(),
            }),
        )
    }

    pub fn event(&self) -> &'static str {
        self.payload.event()
    }

    /// Body of an SSE event (the event name travels separately).
    pub fn sse_data(&self) -> String {
        self.encode(None)
    }

    /// A self-describing WebSocket text frame.
    pub fn ws_frame(&self) -> String {
        self.encode(Some(self.event()))
    }

    fn encode(&self, event: Option<&'static str>) -> String {
        let body = Body {
            event,
            widget_index: self.widget_index,
            data: &self.payload,
        };
        // Plain structs of strings and integers; serialization cannot fail.
        serde_json::to_string(&body).unwrap_or_default()
    }
}

/// Actions a client can send over the WebSocket channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    ButtonClick { widget_index: usize },
    #[serde(rename_all = "camelCase")]
    EditorContents {
        widget_index: usize,
        contents: String,
    },
    /// `data` is base64 so arbitrary key sequences survive JSON.
    #[serde(rename_all = "camelCase")]
    TerminalInput { widget_index: usize, data: String },
}

/// Answer to a WebSocket action that was not accepted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejected {
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget_index: Option<usize>,
    pub error: &'static str,
    pub message: String,
}

impl Rejected {
    pub fn new(widget_index: Option<usize>, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            event: "rejected",
            widget_index,
            error,
            message: message.into(),
        }
    }
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(data.as_bytes())
}
