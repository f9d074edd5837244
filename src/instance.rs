//! Instance Manager
//!
//! Owns the full lifecycle of managed browser instances: launch with an
//! isolated session, view creation per role, control routing, and the
//! cleanup that runs when an operator closes a window. One manager per
//! console process; all registry mutations go through its single lock.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};

use crate::asr::{AsrClient, AsrConfig};
use crate::cdp::{self, CdpMessage, Connection, Transport, ViewSession};
use crate::cdp::types::{FetchAuthRequiredEvent, FetchRequestPausedEvent};
use crate::compositor::{self, ViewEntry};
use crate::error::{Error, Result};
use crate::inject::Injector;
use crate::router::{ControlOp, Router};
use crate::rpa::{RpaClient, RpaConfig, RpaOutcome};
use crate::session::{ProxyConfig, SessionHandle};

/// Capacity of the console event channel; slow subscribers lag, they
/// never block instance work
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What a managed instance is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceRole {
    /// Operator console: platform backend plus the live room, tabbed
    ControlPanel,
    /// Audience-side presence: a single full-window room view
    Crowd,
}

impl InstanceRole {
    pub fn label(self) -> &'static str {
        match self {
            InstanceRole::ControlPanel => "control",
            InstanceRole::Crowd => "crowd",
        }
    }
}

/// Everything needed to bring one instance up
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub role: InstanceRole,
    pub display_name: String,
    #[serde(default)]
    pub platform_tag: String,
    /// First tab of a ControlPanel instance
    #[serde(default)]
    pub control_panel_url: Option<String>,
    /// Second tab of a ControlPanel instance
    #[serde(default)]
    pub live_screen_url: Option<String>,
    /// The single view of a Crowd instance
    #[serde(default)]
    pub room_url: Option<String>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

/// Instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Requested,
    CreatingSession,
    CreatingViews,
    Active,
    Closing,
    Destroyed,
}

impl InstanceState {
    /// Legal forward transitions. `Active -> Destroyed` covers the
    /// operator closing the window without going through `Closing`.
    pub fn can_transition(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Requested, CreatingSession)
                | (CreatingSession, CreatingViews)
                | (CreatingViews, Active)
                | (Active, Closing)
                | (Active, Destroyed)
                | (Closing, Destroyed)
        )
    }
}

/// Events broadcast to console subscribers
#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    /// An instance is gone, whatever closed it
    InstanceClosed { instance_id: String },
    /// A flushed transcript segment from the live transcription stream
    Transcript {
        control_id: String,
        text: String,
        timestamp_ms: u64,
    },
}

/// Snapshot of one live instance for listings
#[derive(Debug, Clone)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub role: InstanceRole,
    pub title: String,
    pub state: InstanceState,
    pub tabs: usize,
    pub active_tab: usize,
    /// Current host content rectangle (width, height)
    pub content: (u32, u32),
}

/// Manager-wide settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Browser binary; auto-detected when absent
    pub chrome_path: Option<PathBuf>,
    /// Root directory holding per-instance partitions
    pub profiles_dir: PathBuf,
    pub window_width: u32,
    pub window_height: u32,
    /// Override for the default fingerprint payload
    pub fingerprint_payload: Option<String>,
    pub asr: AsrConfig,
    pub rpa: RpaConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            profiles_dir: std::env::temp_dir().join("streamops-profiles"),
            window_width: 1280,
            window_height: 900,
            fingerprint_payload: None,
            asr: AsrConfig::default(),
            rpa: RpaConfig::default(),
        }
    }
}

struct Instance {
    role: InstanceRole,
    title: String,
    state: InstanceState,
    connection: Arc<Connection>,
    views: Vec<ViewEntry>,
    active_tab: usize,
    content: (u32, u32),
}

#[derive(Default)]
struct ManagerState {
    registry: HashMap<String, Instance>,
    /// Ids with a create in flight but no registry entry yet
    creating: HashSet<String>,
    router: Router,
}

/// The console's one owner of instance state
pub struct InstanceManager {
    config: ManagerConfig,
    state: Arc<Mutex<ManagerState>>,
    events: broadcast::Sender<ConsoleEvent>,
    asr: Mutex<Option<AsrClient>>,
    rpa: RpaClient,
}

impl InstanceManager {
    pub fn new(config: ManagerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let rpa = RpaClient::new(config.rpa.clone());
        Self {
            config,
            state: Arc::new(Mutex::new(ManagerState::default())),
            events,
            asr: Mutex::new(None),
            rpa,
        }
    }

    /// Receive console events (instance closures, transcript segments)
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    /// Create an instance: isolated session, launched browser, views per
    /// role, registered routes. Calling again with a live id focuses the
    /// existing window instead of building a duplicate; a call racing an
    /// in-flight create of the same id is a no-op.
    pub async fn create_instance(&self, instance_id: &str, config: InstanceConfig) -> Result<()> {
        // Reserve the id under the lock before the first await, so two
        // concurrent creates cannot both pass the liveness check and
        // launch two browsers for one id. Entries already in `Closing`
        // don't count as live: their browser is on its way out.
        let focus = {
            let mut state = self.state.lock().await;
            let live = state
                .registry
                .get(instance_id)
                .filter(|instance| instance.state != InstanceState::Closing)
                .map(|instance| {
                    (
                        Arc::clone(&instance.connection),
                        instance
                            .views
                            .get(instance.active_tab)
                            .map(|v| v.target_id.clone()),
                    )
                });
            if live.is_none() && !state.creating.insert(instance_id.to_string()) {
                tracing::info!(instance_id, "instance creation already in progress");
                return Ok(());
            }
            live
        };
        if let Some((connection, target)) = focus {
            tracing::info!(instance_id, "instance already live, focusing");
            if let Some(target_id) = target {
                let _ = connection.activate_target(&target_id).await;
            }
            return Ok(());
        }

        let result = self.build_instance(instance_id, config).await;
        // Release the reservation whether the build succeeded or not
        self.state.lock().await.creating.remove(instance_id);
        result
    }

    async fn build_instance(&self, instance_id: &str, config: InstanceConfig) -> Result<()> {
        let mut lifecycle = InstanceState::Requested;
        advance(instance_id, &mut lifecycle, InstanceState::CreatingSession);

        let mut handle = SessionHandle::acquire(&self.config.profiles_dir, instance_id)?;
        // A broken proxy degrades to a direct connection rather than
        // blocking the instance
        if let Err(e) = handle.configure_proxy(config.proxy.as_ref()) {
            tracing::warn!(instance_id, error = %e, "proxy rejected, continuing without");
        }

        let chrome = match &self.config.chrome_path {
            Some(path) => path.clone(),
            None => cdp::find_chrome()?,
        };
        let (width, height) = (self.config.window_width, self.config.window_height);
        let args = handle.launch_args(width, height);
        let (child, ws_url) = cdp::launch_chrome(&chrome, &args)?;
        let transport = Transport::new(child, &ws_url)?;
        let connection = Arc::new(Connection::new(transport));
        let version = connection.version().await?;
        tracing::info!(instance_id, browser = %version.product, "instance launched");

        advance(instance_id, &mut lifecycle, InstanceState::CreatingViews);

        let handle = Arc::new(handle);
        let injector = match &self.config.fingerprint_payload {
            Some(payload) => Injector::with_payload(payload),
            None => Injector::new(),
        };

        let mut views = Vec::new();
        match config.role {
            InstanceRole::ControlPanel => {
                let urls = [&config.control_panel_url, &config.live_screen_url];
                for (index, url) in urls.iter().enumerate() {
                    let view = compositor::create_view(
                        &connection,
                        &handle,
                        &injector,
                        config.role,
                        width,
                        height,
                        index,
                        url.as_deref(),
                    )
                    .await?;
                    views.push(view);
                }
            }
            InstanceRole::Crowd => {
                if config.room_url.is_none() {
                    tracing::warn!(instance_id, "crowd instance has no room url, starting blank");
                }
                let view = compositor::create_view(
                    &connection,
                    &handle,
                    &injector,
                    config.role,
                    width,
                    height,
                    0,
                    config.room_url.as_deref(),
                )
                .await?;
                views.push(view);
            }
        }
        compositor::set_active(&connection, instance_id, &views, 0).await?;

        advance(instance_id, &mut lifecycle, InstanceState::Active);

        let title = instance_title(config.role, &config.display_name, &config.platform_tag);
        let sessions: HashMap<String, ViewSession> = views
            .iter()
            .map(|v| (v.session.session_id().to_string(), v.session.clone()))
            .collect();

        {
            let mut state = self.state.lock().await;
            state.router.register_instance(instance_id);
            state.registry.insert(
                instance_id.to_string(),
                Instance {
                    role: config.role,
                    title,
                    state: lifecycle,
                    connection: Arc::clone(&connection),
                    views,
                    active_tab: 0,
                    content: (width, height),
                },
            );
        }

        // Per-instance event pump: response-header stripping, proxy auth,
        // payload re-injection after navigations
        {
            let connection = Arc::clone(&connection);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                event_pump(connection, handle, injector, sessions).await;
            });
        }

        // The transport going away means the browser is gone, whoever
        // closed it; the watcher finishes the cleanup
        {
            let state = Arc::clone(&self.state);
            let events = self.events.clone();
            let instance_id = instance_id.to_string();
            tokio::spawn(async move {
                connection.transport().wait_closed().await;
                cleanup_instance(&state, &events, &instance_id, &connection).await;
            });
        }

        Ok(())
    }

    /// Close an instance deliberately. Registry removal and the
    /// `InstanceClosed` event follow from the watcher once the browser
    /// is actually gone.
    pub async fn close_instance(&self, instance_id: &str) -> Result<()> {
        let connection = {
            let mut state = self.state.lock().await;
            let instance = state
                .registry
                .get_mut(instance_id)
                .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
            instance.state = InstanceState::Closing;
            Arc::clone(&instance.connection)
        };
        connection.close().await
    }

    pub async fn list(&self) -> Vec<InstanceSummary> {
        let state = self.state.lock().await;
        state
            .registry
            .iter()
            .map(|(id, instance)| InstanceSummary {
                instance_id: id.clone(),
                role: instance.role,
                title: instance.title.clone(),
                state: instance.state,
                tabs: instance.views.len(),
                active_tab: instance.active_tab,
                content: instance.content,
            })
            .collect()
    }

    /// Bring a tab forward on one instance. The route check runs first,
    /// so a stale control message for a destroyed instance fails cleanly.
    pub async fn switch_tab(&self, instance_id: &str, index: usize) -> Result<()> {
        let mut state = self.state.lock().await;
        state.router.resolve(instance_id, ControlOp::SwitchTab)?;
        let instance = state
            .registry
            .get_mut(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;

        compositor::set_active(&instance.connection, instance_id, &instance.views, index).await?;
        instance.active_tab = index;
        Ok(())
    }

    /// Reload one tab without touching its siblings
    pub async fn refresh_tab(&self, instance_id: &str, index: usize) -> Result<()> {
        let state = self.state.lock().await;
        state.router.resolve(instance_id, ControlOp::Refresh)?;
        let instance = state
            .registry
            .get(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;

        compositor::refresh(instance_id, &instance.views, index).await
    }

    /// Track a host window resize
    pub async fn host_resized(&self, instance_id: &str, width: u32, height: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let instance = state
            .registry
            .get_mut(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        instance.content = (width, height);
        compositor::resize_views(&mut instance.views, instance.role, width, height);
        Ok(())
    }

    /// Start the live transcription stream; flushed segments arrive as
    /// `ConsoleEvent::Transcript` tagged with the given control id
    pub async fn start_asr(&self, control_id: &str) -> Result<()> {
        let mut guard = self.asr.lock().await;
        if guard.is_some() {
            return Err(Error::Asr("transcription already running".into()));
        }

        let events = self.events.clone();
        let control_id = control_id.to_string();
        let client = AsrClient::new(self.config.asr.clone(), move |text| {
            let _ = events.send(ConsoleEvent::Transcript {
                control_id: control_id.clone(),
                text,
                timestamp_ms: now_ms(),
            });
        });
        client.connect().await;
        *guard = Some(client);
        Ok(())
    }

    pub async fn stop_asr(&self) -> Result<()> {
        let client = self
            .asr
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Asr("transcription not running".into()))?;
        client.disconnect().await;
        Ok(())
    }

    /// Forward microphone audio to the transcription stream
    pub async fn send_audio(&self, chunk: &[u8]) {
        let client = self.asr.lock().await.clone();
        match client {
            Some(client) => client.send_audio_chunk(chunk).await,
            None => tracing::warn!("audio chunk dropped, transcription not running"),
        }
    }

    /// Dispatch a desktop-automation action; never errors, the outcome
    /// carries any failure
    pub async fn run_rpa(&self, action: &str, params: &Value) -> RpaOutcome {
        self.rpa.run(action, params).await
    }
}

/// Window title encoding role, operator-facing name and platform
fn instance_title(role: InstanceRole, display_name: &str, platform_tag: &str) -> String {
    format!("[{}] {} - {}", role.label(), display_name, platform_tag)
}

fn advance(instance_id: &str, from: &mut InstanceState, to: InstanceState) {
    debug_assert!(from.can_transition(to));
    tracing::debug!(instance_id, from = ?*from, to = ?to, "instance state");
    *from = to;
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Routes one instance's CDP events to the view session they belong to.
/// Ends when the transport's event channel closes.
async fn event_pump(
    connection: Arc<Connection>,
    handle: Arc<SessionHandle>,
    injector: Injector,
    sessions: HashMap<String, ViewSession>,
) {
    while let Some(message) = connection.transport().recv_event().await {
        let CdpMessage::Event {
            method,
            params,
            session_id,
        } = message
        else {
            continue;
        };
        let Some(view) = session_id.as_deref().and_then(|id| sessions.get(id)) else {
            continue;
        };

        match method.as_str() {
            "Fetch.requestPaused" => {
                let event: FetchRequestPausedEvent = match serde_json::from_value(params) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::debug!(error = %e, "unparsed requestPaused event");
                        continue;
                    }
                };
                let rewritten = event
                    .response_headers
                    .as_deref()
                    .and_then(SessionHandle::strip_response_headers);
                if let Err(e) = view.fetch_continue_response(&event.request_id, rewritten).await {
                    tracing::debug!(error = %e, "continueResponse failed");
                }
            }
            "Fetch.authRequired" => {
                let event: FetchAuthRequiredEvent = match serde_json::from_value(params) {
                    Ok(event) => event,
                    Err(_) => continue,
                };
                let answer = handle.auth_response(event.auth_challenge.source.as_deref());
                if let Err(e) = view.fetch_continue_with_auth(&event.request_id, answer).await {
                    tracing::debug!(error = %e, "continueWithAuth failed");
                }
            }
            "Page.frameNavigated" | "Page.navigatedWithinDocument" => {
                injector.reinject(view).await;
            }
            _ => {}
        }
    }
    tracing::debug!("instance event pump ended");
}

/// Remove every trace of an instance: routes, registry entry, and the
/// closure event subscribers key on. The watcher identifies its instance
/// by connection, not just id — if the id has since been reused, the
/// newer instance's entry is left alone and no event fires.
async fn cleanup_instance(
    state: &Mutex<ManagerState>,
    events: &broadcast::Sender<ConsoleEvent>,
    instance_id: &str,
    connection: &Arc<Connection>,
) {
    let removed = {
        let mut state = state.lock().await;
        let owned = state
            .registry
            .get(instance_id)
            .is_some_and(|instance| Arc::ptr_eq(&instance.connection, connection));
        if !owned {
            return;
        }
        state.router.deregister_instance(instance_id);
        state.registry.remove(instance_id)
    };

    if let Some(mut instance) = removed {
        instance.state = InstanceState::Destroyed;
        tracing::info!(instance_id, "instance destroyed");
        let _ = events.send(ConsoleEvent::InstanceClosed {
            instance_id: instance_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_transitions_are_ordered() {
        use InstanceState::*;
        assert!(Requested.can_transition(CreatingSession));
        assert!(CreatingSession.can_transition(CreatingViews));
        assert!(CreatingViews.can_transition(Active));
        assert!(Active.can_transition(Closing));
        assert!(Closing.can_transition(Destroyed));
        // Window closed by the operator, no deliberate Closing step
        assert!(Active.can_transition(Destroyed));

        assert!(!Requested.can_transition(Active));
        assert!(!Destroyed.can_transition(Requested));
        assert!(!Active.can_transition(CreatingViews));
    }

    #[test]
    fn instance_title_encodes_role_name_platform() {
        let title = instance_title(InstanceRole::ControlPanel, "room-7", "douyin");
        assert_eq!(title, "[control] room-7 - douyin");
        assert_eq!(
            instance_title(InstanceRole::Crowd, "viewer-2", "tiktok"),
            "[crowd] viewer-2 - tiktok"
        );
    }

    #[test]
    fn instance_config_deserializes_from_console_json() {
        let config: InstanceConfig = serde_json::from_value(json!({
            "role": "controlPanel",
            "displayName": "room-7",
            "platformTag": "douyin",
            "controlPanelUrl": "https://backend.example/panel",
            "liveScreenUrl": "https://room.example/live",
            "proxy": { "enabled": true, "host": "1.2.3.4", "port": 1080 }
        }))
        .unwrap();

        assert_eq!(config.role, InstanceRole::ControlPanel);
        assert_eq!(config.display_name, "room-7");
        assert!(config.proxy.unwrap().enabled);
        assert!(config.room_url.is_none());
    }

    #[test]
    fn crowd_config_needs_only_a_room_url() {
        let config: InstanceConfig = serde_json::from_value(json!({
            "role": "crowd",
            "displayName": "viewer-2",
            "roomUrl": "https://room.example/live"
        }))
        .unwrap();
        assert_eq!(config.role, InstanceRole::Crowd);
        assert!(config.control_panel_url.is_none());
    }

    #[tokio::test]
    async fn empty_manager_lists_nothing() {
        let manager = InstanceManager::new(ManagerConfig::default());
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn close_unknown_instance_fails() {
        let manager = InstanceManager::new(ManagerConfig::default());
        assert!(matches!(
            manager.close_instance("nope").await,
            Err(Error::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn controls_for_unknown_instance_hit_no_route() {
        let manager = InstanceManager::new(ManagerConfig::default());
        assert!(matches!(
            manager.switch_tab("ghost", 0).await,
            Err(Error::RouteNotFound { .. })
        ));
        assert!(matches!(
            manager.refresh_tab("ghost", 1).await,
            Err(Error::RouteNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn failed_create_frees_the_id_for_retry() {
        let config = ManagerConfig {
            chrome_path: Some(std::path::PathBuf::from("/nonexistent/browser")),
            ..ManagerConfig::default()
        };
        let manager = InstanceManager::new(config);
        let instance: InstanceConfig = serde_json::from_value(json!({
            "role": "crowd",
            "displayName": "retry",
            "roomUrl": "https://example.com"
        }))
        .unwrap();

        assert!(manager
            .create_instance("retry", instance.clone())
            .await
            .is_err());
        // The creation reservation is released on failure: the retry hits
        // the launch path again instead of short-circuiting as in-progress
        assert!(manager.create_instance("retry", instance).await.is_err());
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn stop_asr_without_start_fails() {
        let manager = InstanceManager::new(ManagerConfig::default());
        assert!(matches!(manager.stop_asr().await, Err(Error::Asr(_))));
    }

    #[tokio::test]
    async fn second_asr_start_is_rejected() {
        let manager = InstanceManager::new(ManagerConfig::default());
        manager.start_asr("control-1").await.unwrap();
        assert!(matches!(
            manager.start_asr("control-1").await,
            Err(Error::Asr(_))
        ));
        manager.stop_asr().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_rpa_action_fails_without_network() {
        let manager = InstanceManager::new(ManagerConfig::default());
        let outcome = manager.run_rpa("reboot", &json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("reboot"));
    }
}
