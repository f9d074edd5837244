//! RPA Dispatch Client
//!
//! Translates high-level automation actions into HTTP calls against the
//! local desktop-automation backend. Unknown actions fail locally with
//! zero network traffic; backend and transport failures all collapse
//! into a structured outcome rather than an error the caller must match.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};

/// Default timeout for remote command execution when the caller gives none
pub const DEFAULT_EXECUTE_TIMEOUT_SECS: u64 = 30;

/// HTTP timeout for the quick interactive actions
const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(5);

fn default_base_url() -> String {
    "http://127.0.0.1:17821".to_string()
}

/// Automation backend endpoint and credential
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpaConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub auth_token: String,
}

impl Default for RpaConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_token: String::new(),
        }
    }
}

/// Actions the backend understands
#[derive(Debug, Clone, PartialEq)]
pub enum RpaAction {
    Hotkey { keys: Vec<String> },
    Click { x: i64, y: i64, button: String },
    Type { text: String },
    Screenshot,
    Execute { command: String, timeout_secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpaMethod {
    Get,
    Post,
}

/// Planned HTTP call for one action
#[derive(Debug, Clone, PartialEq)]
pub struct RpaRequest {
    pub method: RpaMethod,
    pub path: &'static str,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub binary: bool,
}

impl RpaAction {
    /// Parse an action name plus its JSON parameters. Unknown names and
    /// missing required parameters fail here, before any network call.
    pub fn parse(action: &str, params: &Value) -> Result<Self> {
        match action {
            "hotkey" => {
                let keys = params
                    .get("keys")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .filter(|keys| !keys.is_empty())
                    .ok_or_else(|| Error::Rpa("hotkey requires a non-empty keys array".into()))?;
                Ok(Self::Hotkey { keys })
            }
            "click" => {
                let x = params
                    .get("x")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::Rpa("click requires x".into()))?;
                let y = params
                    .get("y")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::Rpa("click requires y".into()))?;
                let button = params
                    .get("button")
                    .and_then(Value::as_str)
                    .unwrap_or("left")
                    .to_string();
                Ok(Self::Click { x, y, button })
            }
            "type" => {
                let text = params
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Rpa("type requires text".into()))?
                    .to_string();
                Ok(Self::Type { text })
            }
            "screenshot" => Ok(Self::Screenshot),
            "execute" => {
                let command = params
                    .get("command")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Rpa("execute requires command".into()))?
                    .to_string();
                let timeout_secs = params
                    .get("timeout")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_EXECUTE_TIMEOUT_SECS);
                Ok(Self::Execute {
                    command,
                    timeout_secs,
                })
            }
            other => Err(Error::Rpa(format!("unknown action: {}", other))),
        }
    }

    /// Plan the HTTP call. Execute actions carry their declared timeout
    /// plus slack; interactive actions use the short fixed timeout.
    pub fn plan(&self) -> RpaRequest {
        match self {
            Self::Hotkey { keys } => RpaRequest {
                method: RpaMethod::Post,
                path: "keyboard/hotkey",
                body: Some(json!({ "keys": keys })),
                timeout: INTERACTIVE_TIMEOUT,
                binary: false,
            },
            Self::Click { x, y, button } => RpaRequest {
                method: RpaMethod::Post,
                path: "mouse/click",
                body: Some(json!({ "x": x, "y": y, "button": button })),
                timeout: INTERACTIVE_TIMEOUT,
                binary: false,
            },
            Self::Type { text } => RpaRequest {
                method: RpaMethod::Post,
                path: "keyboard/type",
                body: Some(json!({ "text": text })),
                timeout: INTERACTIVE_TIMEOUT,
                binary: false,
            },
            Self::Screenshot => RpaRequest {
                method: RpaMethod::Get,
                path: "screenshot",
                body: None,
                timeout: INTERACTIVE_TIMEOUT,
                binary: true,
            },
            Self::Execute {
                command,
                timeout_secs,
            } => RpaRequest {
                method: RpaMethod::Post,
                path: "execute",
                body: Some(json!({ "command": command, "timeout": timeout_secs })),
                timeout: Duration::from_secs(timeout_secs + 5),
                binary: false,
            },
        }
    }
}

/// Result of one dispatched action, success or not
#[derive(Debug, Clone)]
pub struct RpaOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl RpaOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Client for the desktop-automation backend
pub struct RpaClient {
    config: RpaConfig,
    http: reqwest::Client,
}

impl RpaClient {
    pub fn new(config: RpaConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Full URL for an API path: `{base}/{token}/api/{path}`
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.auth_token,
            path
        )
    }

    /// Parse and dispatch in one step; parse failures short-circuit into
    /// a failed outcome without touching the network
    pub async fn run(&self, action: &str, params: &Value) -> RpaOutcome {
        match RpaAction::parse(action, params) {
            Ok(action) => self.dispatch(&action).await,
            Err(e) => {
                tracing::warn!(action, error = %e, "automation action rejected");
                RpaOutcome::failure(e.to_string())
            }
        }
    }

    /// Dispatch a parsed action to the backend
    pub async fn dispatch(&self, action: &RpaAction) -> RpaOutcome {
        let request = action.plan();
        let url = self.endpoint(request.path);

        match self.send(&url, &request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(path = request.path, error = %e, "automation dispatch failed");
                RpaOutcome::failure(e.to_string())
            }
        }
    }

    async fn send(&self, url: &str, request: &RpaRequest) -> Result<RpaOutcome> {
        let builder = match request.method {
            RpaMethod::Get => self.http.get(url),
            RpaMethod::Post => {
                let builder = self.http.post(url);
                match &request.body {
                    Some(body) => builder.json(body),
                    None => builder,
                }
            }
        };

        let response = builder.timeout(request.timeout).send().await?;
        let status = response.status();

        if request.binary {
            if !status.is_success() {
                return Ok(RpaOutcome::failure(format!(
                    "automation backend returned {}",
                    status
                )));
            }
            let bytes = response.bytes().await?;
            return Ok(RpaOutcome {
                success: true,
                data: Some(json!({ "image_base64": BASE64.encode(&bytes) })),
                error: None,
            });
        }

        let body: Value = response.json().await?;
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("automation backend returned {}", status));
            return Ok(RpaOutcome::failure(message));
        }

        // Backends that already report success pass through; bare payloads
        // are wrapped as successful data
        match body.get("success").and_then(Value::as_bool) {
            Some(success) => Ok(RpaOutcome {
                success,
                data: body.get("data").cloned(),
                error: body
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            None => Ok(RpaOutcome {
                success: true,
                data: Some(body),
                error: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hotkey_translation() {
        let action = RpaAction::parse("hotkey", &json!({ "keys": ["ctrl", "shift", "t"] })).unwrap();
        let request = action.plan();
        assert_eq!(request.method, RpaMethod::Post);
        assert_eq!(request.path, "keyboard/hotkey");
        assert_eq!(request.body, Some(json!({ "keys": ["ctrl", "shift", "t"] })));
        assert_eq!(request.timeout, Duration::from_secs(5));
    }

    #[test]
    fn click_defaults_to_left_button() {
        let action = RpaAction::parse("click", &json!({ "x": 100, "y": 200 })).unwrap();
        assert_eq!(
            action,
            RpaAction::Click {
                x: 100,
                y: 200,
                button: "left".into()
            }
        );
        assert_eq!(action.plan().path, "mouse/click");
    }

    #[test]
    fn click_requires_coordinates() {
        assert!(matches!(
            RpaAction::parse("click", &json!({ "x": 100 })),
            Err(Error::Rpa(_))
        ));
    }

    #[test]
    fn type_translation() {
        let action = RpaAction::parse("type", &json!({ "text": "hello" })).unwrap();
        let request = action.plan();
        assert_eq!(request.path, "keyboard/type");
        assert_eq!(request.body, Some(json!({ "text": "hello" })));
    }

    #[test]
    fn screenshot_is_a_binary_get() {
        let request = RpaAction::parse("screenshot", &json!({})).unwrap().plan();
        assert_eq!(request.method, RpaMethod::Get);
        assert_eq!(request.path, "screenshot");
        assert!(request.binary);
        assert!(request.body.is_none());
    }

    #[test]
    fn execute_timeout_defaults_and_carries_slack() {
        let defaulted = RpaAction::parse("execute", &json!({ "command": "dir" })).unwrap();
        assert_eq!(
            defaulted,
            RpaAction::Execute {
                command: "dir".into(),
                timeout_secs: DEFAULT_EXECUTE_TIMEOUT_SECS
            }
        );
        assert_eq!(defaulted.plan().timeout, Duration::from_secs(35));

        let explicit =
            RpaAction::parse("execute", &json!({ "command": "dir", "timeout": 10 })).unwrap();
        assert_eq!(explicit.plan().timeout, Duration::from_secs(15));
    }

    #[test]
    fn unknown_action_fails_locally() {
        let err = RpaAction::parse("reboot", &json!({})).unwrap_err();
        assert!(matches!(err, Error::Rpa(_)));
        assert!(err.to_string().contains("reboot"));
    }

    #[test]
    fn hotkey_rejects_empty_keys() {
        assert!(RpaAction::parse("hotkey", &json!({ "keys": [] })).is_err());
        assert!(RpaAction::parse("hotkey", &json!({})).is_err());
    }

    #[test]
    fn endpoint_embeds_token_between_base_and_api() {
        let client = RpaClient::new(RpaConfig {
            base_url: "http://127.0.0.1:17821/".into(),
            auth_token: "secret-token".into(),
        });
        assert_eq!(
            client.endpoint("mouse/click"),
            "http://127.0.0.1:17821/secret-token/api/mouse/click"
        );
    }
}
