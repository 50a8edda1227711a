use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;

use crate::browser::PageHandle;

// Screenshots are declared to the model at this size; the browser viewport
// must match or the model's coordinates land on the wrong pixels.
pub const TOOL_DISPLAY: (u32, u32) = (1024, 768);

#[derive(Clone)]
pub struct ModelConfig {
    pub api_base: String,      // e.g. "https://api.openai.com/v1"
    pub api_key: String,       // env OPENAI_API_KEY
    pub model: String,         // e.g. "computer-use-preview"
    pub tool_display: (u32, u32),
    pub environment: String,   // "browser"
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("OPENAI_CUA_MODEL").unwrap_or_else(|_| "computer-use-preview".into()),
            tool_display: TOOL_DISPLAY,
            environment: "browser".into(),
        }
    }
}

// ========================= Response Data Model =========================

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(pub String);

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SafetyCheck {
    pub id: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PointerButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl PointerButton {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "right" => PointerButton::Right,
            "middle" => PointerButton::Middle,
            _ => PointerButton::Left,
        }
    }
}

/// One proposed UI operation, decoded from a `computer_call` action payload.
/// Decoding is total: kinds this loop does not execute come out as `Unknown`
/// so a surprising model response degrades to a reported no-op instead of a
/// parse failure that would kill the session.
#[derive(Clone, Debug, PartialEq)]
pub enum UiAction {
    Click { x: i64, y: i64, button: PointerButton },
    Scroll { x: i64, y: i64, scroll_x: i64, scroll_y: i64 },
    Keypress { keys: Vec<String> },
    Type { text: String },
    Wait,
    Unknown { kind: String },
}

impl UiAction {
    pub fn decode(v: &Value) -> Self {
        let kind = v.get("type").and_then(Value::as_str).unwrap_or("unknown");
        match kind {
            "click" => UiAction::Click {
                x: int_field(v, "x"),
                y: int_field(v, "y"),
                button: v
                    .get("button")
                    .and_then(Value::as_str)
                    .map(PointerButton::parse)
                    .unwrap_or_default(),
            },
            "scroll" => UiAction::Scroll {
                x: int_field(v, "x"),
                y: int_field(v, "y"),
                scroll_x: int_field(v, "scroll_x"),
                scroll_y: int_field(v, "scroll_y"),
            },
            "keypress" => UiAction::Keypress {
                keys: v
                    .get("keys")
                    .and_then(Value::as_array)
                    .map(|keys| {
                        keys.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            "type" => UiAction::Type {
                text: v.get("text").and_then(Value::as_str).unwrap_or("").to_string(),
            },
            "wait" => UiAction::Wait,
            other => UiAction::Unknown { kind: other.to_string() },
        }
    }
}

impl<'de> Deserialize<'de> for UiAction {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = Value::deserialize(deserializer)?;
        Ok(UiAction::decode(&v))
    }
}

fn int_field(v: &Value, key: &str) -> i64 {
    v.get(key).and_then(Value::as_i64).unwrap_or(0)
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<ContentPart>,
    },
    ComputerCall {
        call_id: String,
        action: UiAction,
        #[serde(default)]
        pending_safety_checks: Vec<SafetyCheck>,
    },
    // reasoning items and anything the API grows later land here
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelResponse {
    pub id: ResponseId,
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

/// The first proposed action of a response, lifted out with its call id and
/// the safety checks that must be acknowledged when its outcome is reported.
#[derive(Clone, Debug)]
pub struct PendingCall {
    pub call_id: String,
    pub action: UiAction,
    pub safety_checks: Vec<SafetyCheck>,
}

impl PendingCall {
    pub fn safety_check_ids(&self) -> Vec<String> {
        self.safety_checks.iter().map(|check| check.id.clone()).collect()
    }
}

impl ModelResponse {
    /// Concatenated `output_text` of all message items, the response's answer
    /// when no action is proposed.
    pub fn output_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for item in &self.output {
            if let OutputItem::Message { content } = item {
                for part in content {
                    if part.kind == "output_text" && !part.text.is_empty() {
                        parts.push(&part.text);
                    }
                }
            }
        }
        parts.join("\n")
    }

    pub fn first_computer_call(&self) -> Option<PendingCall> {
        self.output.iter().find_map(|item| match item {
            OutputItem::ComputerCall { call_id, action, pending_safety_checks } => Some(PendingCall {
                call_id: call_id.clone(),
                action: action.clone(),
                safety_checks: pending_safety_checks.clone(),
            }),
            _ => None,
        })
    }
}

// ========================= Turn Payloads =========================

/// Screenshot of the active surface right after an action ran. Lives for one
/// turn: encoded into the next payload and dropped, never persisted.
#[derive(Clone, Debug)]
pub struct Observation {
    pub surface: PageHandle,
    pub png: Vec<u8>,
}

impl Observation {
    pub fn to_data_url(&self) -> String {
        format!("data:image/png;base64,{}", B64.encode(&self.png))
    }
}

#[derive(Clone, Debug)]
pub struct ActionOutput {
    pub call_id: String,
    pub observation: Observation,
    /// Bare ids of the safety checks attached to `call_id`; must ride on the
    /// immediately following turn and no other.
    pub acknowledged_safety_checks: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum TurnInput {
    Task { system: String, task: String },
    UserText(String),
    ActionOutput(ActionOutput),
}

// ========================= Responses Client =========================

#[derive(Clone)]
pub struct ResponsesClient {
    http: Client,
    cfg: ModelConfig,
}

impl ResponsesClient {
    pub fn new(cfg: ModelConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("OPENAI_API_KEY missing");
        }
        Ok(Self { http: Client::new(), cfg })
    }

    /// One request/response round trip. Communication failures are returned
    /// as-is and never retried; the caller treats them as fatal.
    pub async fn exchange(
        &self,
        previous: Option<&ResponseId>,
        input: &TurnInput,
    ) -> Result<ModelResponse> {
        let url = format!("{}/responses", self.cfg.api_base);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&self.build_body(previous, input))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("OpenAI error {}: {}", status, text);
        }
        serde_json::from_str(&text).context("failed to parse OpenAI response JSON")
    }

    fn build_body(&self, previous: Option<&ResponseId>, input: &TurnInput) -> Value {
        let mut body = json!({
            "model": self.cfg.model,
            "truncation": "auto",
            "tools": [{
                "type": "computer_use_preview",
                "display_width": self.cfg.tool_display.0,
                "display_height": self.cfg.tool_display.1,
                "environment": self.cfg.environment,
            }],
        });
        match input {
            TurnInput::Task { system, task } => {
                body["input"] = json!([
                    { "role": "system", "content": [{ "type": "input_text", "text": system }] },
                    { "role": "user", "content": [{ "type": "input_text", "text": task }] },
                ]);
                body["reasoning"] = json!({ "summary": "concise" });
            }
            TurnInput::UserText(text) => {
                body["input"] = json!([{ "role": "user", "content": text }]);
            }
            TurnInput::ActionOutput(out) => {
                let mut item = json!({
                    "type": "computer_call_output",
                    "call_id": out.call_id,
                    "output": {
                        "type": "input_image",
                        "image_url": out.observation.to_data_url(),
                    },
                });
                if !out.acknowledged_safety_checks.is_empty() {
                    item["acknowledged_safety_checks"] = Value::Array(
                        out.acknowledged_safety_checks
                            .iter()
                            .map(|id| json!({ "id": id }))
                            .collect(),
                    );
                }
                body["input"] = Value::Array(vec![item]);
            }
        }
        if let Some(prev) = previous {
            body["previous_response_id"] = Value::String(prev.0.clone());
        }
        body
    }
}
