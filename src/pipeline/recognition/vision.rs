//! Ollama vision backend: sends the page as a base64 PNG to `/api/chat`.
//!
//! Vision models report no confidence, so one is estimated from the amount
//! and structure of the returned text.

use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::{encode_png, RecognitionBackend, RecognitionError, RecognitionOutput};
use crate::config::ConfigError;
use crate::pipeline::collaborators::PageImage;

const SYSTEM_PROMPT: &str = "\
You are a document transcription engine. Output only the text visible in the \
page image, preserving line breaks and reading order. Do not summarize or comment.";

const USER_PROMPT: &str = "Transcribe all text on this scanned page.";

pub struct OllamaVision {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaVision {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Result<Self, ConfigError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ConfigError::BackendUnavailable(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl RecognitionBackend for OllamaVision {
    fn name(&self) -> &str {
        "ollama_vision"
    }

    fn run(&self, page: &PageImage) -> Result<RecognitionOutput, RecognitionError> {
        let _span =
            tracing::debug_span!("vision_ocr", model = %self.model, page = page.index).entered();
        let png = encode_png(page)?;
        let image = base64::engine::general_purpose::STANDARD.encode(png);

        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                    images: Vec::new(),
                },
                ChatMessage {
                    role: "user",
                    content: USER_PROMPT,
                    images: vec![image],
                },
            ],
            stream: false,
        };

        let url = format!("{}/api/chat", self.base_url);
        let response = self.client.post(&url).json(&body).send().map_err(|e| {
            if e.is_connect() {
                RecognitionError::Unreachable(self.base_url.clone())
            } else if e.is_timeout() {
                RecognitionError::Timeout {
                    backend: self.name().into(),
                    secs: self.timeout_secs,
                }
            } else {
                RecognitionError::Backend {
                    backend: self.name().into(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(RecognitionError::Backend {
                backend: self.name().into(),
                reason: format!("HTTP {}: {body}", status.as_u16()),
            });
        }

        let parsed: ChatResponse = response.json().map_err(|e| RecognitionError::Backend {
            backend: self.name().into(),
            reason: format!("response parsing: {e}"),
        })?;

        let text = parsed.message.content.trim().to_string();
        let confidence = heuristic_confidence(&text);
        tracing::debug!(text_len = text.len(), confidence, "Vision transcription complete");
        Ok(RecognitionOutput { text, confidence })
    }
}

/// Length-based estimate with small bonuses for structured output, capped
/// below certainty.
pub fn heuristic_confidence(text: &str) -> f32 {
    if text.is_empty() {
        return 0.0;
    }

    let len = text.len();
    let base: f32 = if len < 50 {
        0.2
    } else if len < 200 {
        0.4
    } else if len < 500 {
        0.6
    } else {
        0.8
    };

    let has_headers = text.lines().any(|l| l.starts_with('#'));
    let has_tables = text.lines().any(|l| l.matches('|').count() >= 2);
    let has_lists = text
        .lines()
        .any(|l| l.trim_start().starts_with("- ") || l.trim_start().starts_with("* "));

    let bonus: f32 = if has_headers { 0.05 } else { 0.0 }
        + if has_tables { 0.05 } else { 0.0 }
        + if has_lists { 0.03 } else { 0.0 };

    (base + bonus).min(0.95)
}
