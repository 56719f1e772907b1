//! Messages exchanged with the host. Both directions are tagged on a
//! `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::GenerationOptions;
use crate::error::WorkerError;
use crate::lifecycle::ModelConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Value>,
    #[serde(default)]
    pub options: GenerationOptions,
}

impl StreamRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
            options: GenerationOptions::default(),
        }
    }

    pub fn has_image(&self) -> bool {
        match &self.image {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    InitWasm,
    LoadModel(ModelConfig),
    StreamTokens(StreamRequest),
    CheckCache,
    ClearCache,
}

impl InboundMessage {
    pub const TAGS: &'static [&'static str] =
        &["init_wasm", "load_model", "stream_tokens", "check_cache", "clear_cache"];

    pub fn tag(&self) -> &'static str {
        match self {
            InboundMessage::InitWasm => "init_wasm",
            InboundMessage::LoadModel(_) => "load_model",
            InboundMessage::StreamTokens(_) => "stream_tokens",
            InboundMessage::CheckCache => "check_cache",
            InboundMessage::ClearCache => "clear_cache",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    LoadingProgress {
        message: String,
    },
    WasmInitialized {
        success: bool,
    },
    ModelLoaded,
    Token {
        token: String,
        #[serde(rename = "tokensSec")]
        tokens_sec: f64,
        #[serde(rename = "totalTime")]
        total_time: f64,
    },
    StreamComplete,
    Error {
        error: String,
    },
    CacheStatus {
        status: String,
    },
}

impl OutboundMessage {
    pub fn error(err: &WorkerError) -> Self {
        OutboundMessage::Error {
            error: err.to_string(),
        }
    }
}

/// Result of decoding a raw inbound value.
#[derive(Debug)]
pub enum Decoded {
    Command(InboundMessage),
    /// Tag not handled by this worker (or no tag at all).
    Unknown(String),
    /// Known tag with a payload that does not fit.
    Invalid(WorkerError),
}

pub fn decode(value: Value) -> Decoded {
    let tag = match value.get("type").and_then(Value::as_str) {
        Some(tag) => tag.to_string(),
        None => return Decoded::Unknown(String::new()),
    };

    if !InboundMessage::TAGS.contains(&tag.as_str()) {
        return Decoded::Unknown(tag);
    }

    match serde_json::from_value(value) {
        Ok(msg) => Decoded::Command(msg),
        Err(e) => Decoded::Invalid(WorkerError::InvalidCommand {
            command: tag,
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_load_model() {
        let value = json!({
            "type": "load_model",
            "baseUrl": "https://x/",
            "modelPath": "m.bin",
            "tokenizerPath": "t.bin",
            "configPath": "c.json",
            "quantized": true
        });
        match decode(value) {
            Decoded::Command(InboundMessage::LoadModel(config)) => {
                assert_eq!(config.base_url, "https://x/");
                assert!(config.quantized);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_unit_commands() {
        assert!(matches!(
            decode(json!({"type": "init_wasm"})),
            Decoded::Command(InboundMessage::InitWasm)
        ));
        assert!(matches!(
            decode(json!({"type": "clear_cache"})),
            Decoded::Command(InboundMessage::ClearCache)
        ));
    }

    #[test]
    fn test_decode_unknown_and_invalid() {
        assert!(matches!(decode(json!({"type": "reboot"})), Decoded::Unknown(ref t) if t == "reboot"));
        assert!(matches!(decode(json!({"prompt": "hi"})), Decoded::Unknown(ref t) if t.is_empty()));
        assert!(matches!(
            decode(json!({"type": "load_model", "baseUrl": "https://x/"})),
            Decoded::Invalid(WorkerError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_stream_request_image_flag() {
        let plain: StreamRequest = serde_json::from_value(json!({"prompt": "hi"})).unwrap();
        assert!(!plain.has_image());

        let with_image: StreamRequest =
            serde_json::from_value(json!({"prompt": "hi", "image": "data:image/png;base64,AAAA"})).unwrap();
        assert!(with_image.has_image());

        let null_image: StreamRequest = serde_json::from_value(json!({"prompt": "hi", "image": null})).unwrap();
        assert!(!null_image.has_image());
    }

    #[test]
    fn test_outbound_wire_format() {
        let token = OutboundMessage::Token {
            token: "hi".to_string(),
            tokens_sec: 12.5,
            total_time: 80.0,
        };
        assert_eq!(
            serde_json::to_value(&token).unwrap(),
            json!({"type": "token", "token": "hi", "tokensSec": 12.5, "totalTime": 80.0})
        );
        assert_eq!(
            serde_json::to_value(OutboundMessage::StreamComplete).unwrap(),
            json!({"type": "stream_complete"})
        );
        assert_eq!(
            serde_json::to_value(OutboundMessage::WasmInitialized { success: true }).unwrap(),
            json!({"type": "wasm_initialized", "success": true})
        );
    }
}
