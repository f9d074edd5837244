//! streamops — control-room core for live-stream operations
//!
//! Manages fleets of isolated browser instances (operator control panels
//! and audience-side "crowd" windows), keeps their network identity and
//! fingerprint consistent, relays live speech transcription, and
//! dispatches desktop-automation actions to a local RPA backend.
//!
//! The browser side runs over a hand-rolled Chrome DevTools Protocol
//! client with stealth filtering: commands that anti-bot checks detect
//! are never emitted.
//!
//! ```no_run
//! use streamops::{InstanceConfig, InstanceManager, ManagerConfig};
//!
//! # async fn run() -> streamops::Result<()> {
//! let manager = InstanceManager::new(ManagerConfig::default());
//!
//! let config: InstanceConfig = serde_json::from_str(
//!     r#"{
//!         "role": "crowd",
//!         "displayName": "viewer-1",
//!         "platformTag": "demo",
//!         "roomUrl": "https://live.example.com/room/42"
//!     }"#,
//! )?;
//! manager.create_instance("crowd-1", config).await?;
//! manager.refresh_tab("crowd-1", 0).await?;
//! manager.close_instance("crowd-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod asr;
pub mod cdp;
pub mod compositor;
pub mod error;
pub mod inject;
pub mod instance;
pub mod router;
pub mod rpa;
pub mod session;
pub mod ws;

pub use asr::{AsrClient, AsrConfig, StreamState, TranscriptBuffer};
pub use compositor::{Bounds, ViewEntry, TAB_BAR_HEIGHT};
pub use error::{Error, Result};
pub use inject::{Injector, FINGERPRINT_PAYLOAD};
pub use instance::{
    ConsoleEvent, InstanceConfig, InstanceManager, InstanceRole, InstanceState, InstanceSummary,
    ManagerConfig,
};
pub use router::{ControlOp, Router};
pub use rpa::{RpaAction, RpaClient, RpaConfig, RpaOutcome};
pub use session::{ProxyConfig, SessionHandle, DESKTOP_USER_AGENT};
