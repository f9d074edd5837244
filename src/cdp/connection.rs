//! CDP Connection/Session Management
//!
//! One `Connection` per managed Chrome instance; one `ViewSession` per
//! attached content view (tab) inside it.

use std::sync::Arc;

use super::transport::Transport;
use super::types::*;
use crate::error::Result;

/// A CDP connection to one Chrome instance
pub struct Connection {
    transport: Arc<Transport>,
}

impl Connection {
    /// Create a new connection wrapping a transport
    pub fn new(transport: Transport) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    /// Get a reference to the transport
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Get browser version info
    pub async fn version(&self) -> Result<BrowserGetVersionResult> {
        self.transport
            .send("Browser.getVersion", &BrowserGetVersion {})
            .await
    }

    /// Create a new target (content view)
    pub async fn create_target(&self, url: &str) -> Result<String> {
        let result: TargetCreateTargetResult = self
            .transport
            .send(
                "Target.createTarget",
                &TargetCreateTarget {
                    url: url.to_string(),
                    width: None,
                    height: None,
                },
            )
            .await?;
        Ok(result.target_id)
    }

    /// Attach to a target and get a session
    pub async fn attach_to_target(&self, target_id: &str) -> Result<ViewSession> {
        let result: TargetAttachToTargetResult = self
            .transport
            .send(
                "Target.attachToTarget",
                &TargetAttachToTarget {
                    target_id: target_id.to_string(),
                    flatten: Some(true),
                },
            )
            .await?;

        Ok(ViewSession {
            transport: Arc::clone(&self.transport),
            session_id: result.session_id,
            target_id: target_id.to_string(),
        })
    }

    /// Close a target
    pub async fn close_target(&self, target_id: &str) -> Result<bool> {
        let result: TargetCloseTargetResult = self
            .transport
            .send(
                "Target.closeTarget",
                &TargetCloseTarget {
                    target_id: target_id.to_string(),
                },
            )
            .await?;
        Ok(result.success)
    }

    /// Activate (bring forward) a target — the previous one keeps running
    pub async fn activate_target(&self, target_id: &str) -> Result<()> {
        self.transport
            .send::<_, serde_json::Value>(
                "Target.activateTarget",
                &TargetActivateTarget {
                    target_id: target_id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    /// Get all targets
    pub async fn get_targets(&self) -> Result<Vec<TargetInfo>> {
        let result: TargetGetTargetsResult = self
            .transport
            .send("Target.getTargets", &TargetGetTargets {})
            .await?;
        Ok(result.target_infos)
    }

    /// Close the browser
    pub async fn close(&self) -> Result<()> {
        let _ = self
            .transport
            .send::<_, serde_json::Value>("Browser.close", &BrowserClose {})
            .await;
        self.transport.close().await
    }
}

/// A CDP session attached to a specific content view
#[derive(Clone)]
pub struct ViewSession {
    transport: Arc<Transport>,
    session_id: String,
    target_id: String,
}

impl ViewSession {
    /// Get the session ID
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the target ID
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Send a command to this session
    pub async fn send<C, R>(&self, method: &str, params: &C) -> Result<R>
    where
        C: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        self.transport
            .send_to_session(&self.session_id, method, params)
            .await
    }

    /// Enable page events
    pub async fn page_enable(&self) -> Result<()> {
        self.send::<_, serde_json::Value>("Page.enable", &PageEnable {})
            .await?;
        Ok(())
    }

    /// Navigate to a URL
    pub async fn navigate(&self, url: &str) -> Result<PageNavigateResult> {
        self.send(
            "Page.navigate",
            &PageNavigate {
                url: url.to_string(),
            },
        )
        .await
    }

    /// Reload the view's content without touching sibling views
    pub async fn reload(&self) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Page.reload",
            &PageReload {
                ignore_cache: Some(false),
            },
        )
        .await?;
        Ok(())
    }

    /// Add a script to evaluate before every new document in this view
    pub async fn add_script_to_evaluate_on_new_document(&self, source: &str) -> Result<String> {
        let result: PageAddScriptToEvaluateOnNewDocumentResult = self
            .send(
                "Page.addScriptToEvaluateOnNewDocument",
                &PageAddScriptToEvaluateOnNewDocument {
                    source: source.to_string(),
                },
            )
            .await?;
        Ok(result.identifier)
    }

    /// Evaluate JavaScript in the view
    pub async fn evaluate(&self, expression: &str) -> Result<RuntimeEvaluateResult> {
        self.send(
            "Runtime.evaluate",
            &RuntimeEvaluate {
                expression: expression.to_string(),
                return_by_value: Some(true),
                await_promise: Some(false),
            },
        )
        .await
    }

    /// Override outbound request headers for this view's session
    pub async fn set_extra_http_headers(
        &self,
        headers: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.send::<_, serde_json::Value>("Network.enable", &NetworkEnable {})
            .await?;
        self.send::<_, serde_json::Value>(
            "Network.setExtraHTTPHeaders",
            &NetworkSetExtraHTTPHeaders { headers },
        )
        .await?;
        Ok(())
    }

    /// Enable Fetch interception at the response stage, optionally handling
    /// auth challenges (used for proxy credentials)
    pub async fn fetch_enable(&self, handle_auth: bool) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Fetch.enable",
            &FetchEnable {
                patterns: Some(vec![RequestPattern {
                    url_pattern: Some("*".to_string()),
                    request_stage: Some("Response".to_string()),
                }]),
                handle_auth_requests: Some(handle_auth),
            },
        )
        .await?;
        Ok(())
    }

    /// Continue a paused response, optionally with rewritten headers
    pub async fn fetch_continue_response(
        &self,
        request_id: &str,
        response_headers: Option<Vec<HeaderEntry>>,
    ) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Fetch.continueResponse",
            &FetchContinueResponse {
                request_id: request_id.to_string(),
                response_headers,
            },
        )
        .await?;
        Ok(())
    }

    /// Answer an auth challenge
    pub async fn fetch_continue_with_auth(
        &self,
        request_id: &str,
        response: AuthChallengeResponse,
    ) -> Result<()> {
        self.send::<_, serde_json::Value>(
            "Fetch.continueWithAuth",
            &FetchContinueWithAuth {
                request_id: request_id.to_string(),
                auth_challenge_response: response,
            },
        )
        .await?;
        Ok(())
    }
}
