//! View Compositor
//!
//! Owns the tab/view model for one host window: view creation, screen-space
//! bounds relative to the chrome strip, active-view switching and refresh.
//! ControlPanel hosts carry two views under a fixed tab strip; Crowd hosts a
//! single full-area view.

use crate::cdp::{Connection, ViewSession};
use crate::error::{Error, Result};
use crate::inject::Injector;
use crate::instance::InstanceRole;
use crate::session::SessionHandle;

/// Height of the tab strip on ControlPanel hosts, in pixels
pub const TAB_BAR_HEIGHT: u32 = 40;

/// Navigation error codes symptomatic of a broken or unauthenticated proxy.
/// These get the diagnostic page; anything else is just logged.
const PROXY_CLASS_ERRORS: &[&str] = &[
    "net::ERR_CONNECTION_REFUSED",
    "net::ERR_CONNECTION_CLOSED",
    "net::ERR_CONNECTION_RESET",
    "net::ERR_TIMED_OUT",
    "net::ERR_PROXY_CONNECTION_FAILED",
    "net::ERR_SOCKS_CONNECTION_FAILED",
];

/// Screen-space rectangle relative to the host window's content area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One content surface bound to an instance's session
pub struct ViewEntry {
    pub index: usize,
    pub target_id: String,
    pub session: ViewSession,
    pub bounds: Bounds,
    pub url: Option<String>,
}

/// Chrome strip height for a role
pub fn chrome_height(role: InstanceRole) -> u32 {
    match role {
        InstanceRole::ControlPanel => TAB_BAR_HEIGHT,
        InstanceRole::Crowd => 0,
    }
}

/// Compute a view's bounds from the host content rectangle: full width,
/// offset below the chrome strip, remaining height.
pub fn view_bounds(role: InstanceRole, content_width: u32, content_height: u32) -> Bounds {
    let chrome = chrome_height(role);
    Bounds {
        x: 0,
        y: chrome,
        width: content_width,
        height: content_height.saturating_sub(chrome),
    }
}

/// Whether a navigation failure belongs to the proxy-symptomatic set
pub fn is_proxy_class_error(error_text: &str) -> bool {
    PROXY_CLASS_ERRORS.contains(&error_text)
}

/// Static diagnostic page shown when a view load fails with a
/// proxy-class error — the load path's only user-visible error surface
pub fn diagnostic_page_url(error_text: &str, failed_url: &str) -> String {
    let html = format!(
        "<html><body style='font-family:sans-serif;background:#1e293b;color:#e2e8f0;\
         display:flex;align-items:center;justify-content:center;height:100vh'>\
         <div style='text-align:center'>\
         <h2>Page failed to load</h2>\
         <p>{}</p><p style='color:#94a3b8'>{}</p>\
         <p>Check the instance's proxy configuration and refresh.</p>\
         </div></body></html>",
        error_text, failed_url
    );
    format!("data:text/html;charset=utf-8,{}", urlencode(&html))
}

/// Percent-encode the characters that break a data: URL
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'#' | b'%' | b'?' | b'&' | b'+' => out.push_str(&format!("%{:02X}", b)),
            _ => out.push(b as char),
        }
    }
    out
}

/// Create one content view on the instance's connection: blank target,
/// attach, wire the injector and session identity, then load the target
/// URL if one was given (a missing URL leaves a blank placeholder).
pub async fn create_view(
    conn: &Connection,
    handle: &SessionHandle,
    injector: &Injector,
    role: InstanceRole,
    content_width: u32,
    content_height: u32,
    index: usize,
    url: Option<&str>,
) -> Result<ViewEntry> {
    let target_id = conn.create_target("about:blank").await?;
    let session = conn.attach_to_target(&target_id).await?;
    session.page_enable().await?;

    // Identity and injection are wired before any real content loads
    injector.attach(&session).await;
    if let Err(e) = handle.apply(&session).await {
        tracing::warn!(target_id = %target_id, error = %e, "session identity apply failed");
    }

    if let Some(url) = url {
        load_view(&session, url).await;
    }

    Ok(ViewEntry {
        index,
        target_id,
        session,
        bounds: view_bounds(role, content_width, content_height),
        url: url.map(String::from),
    })
}

/// Navigate a view, replacing its content with the diagnostic page on
/// proxy-class failures. Never returns an error — a failed load degrades
/// the one view, not the instance.
pub async fn load_view(session: &ViewSession, url: &str) {
    match session.navigate(url).await {
        Ok(result) => {
            if let Some(error_text) = result.error_text {
                if is_proxy_class_error(&error_text) {
                    tracing::warn!(url, error = %error_text, "view load failed, showing diagnostic page");
                    let diag = diagnostic_page_url(&error_text, url);
                    if let Err(e) = session.navigate(&diag).await {
                        tracing::debug!(error = %e, "diagnostic page load failed");
                    }
                } else {
                    tracing::warn!(url, error = %error_text, "view load failed");
                }
            }
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "view navigation errored");
        }
    }
}

/// Bring the view at `index` forward; the previously active view keeps
/// running in the background so switching back is instant.
pub async fn set_active(
    conn: &Connection,
    instance_id: &str,
    views: &[ViewEntry],
    index: usize,
) -> Result<()> {
    let view = views.get(index).ok_or_else(|| Error::TabOutOfRange {
        instance_id: instance_id.to_string(),
        index,
    })?;
    conn.activate_target(&view.target_id).await
}

/// Reload one view's content without touching its siblings
pub async fn refresh(instance_id: &str, views: &[ViewEntry], index: usize) -> Result<()> {
    let view = views.get(index).ok_or_else(|| Error::TabOutOfRange {
        instance_id: instance_id.to_string(),
        index,
    })?;
    view.session.reload().await
}

/// Track a host resize: every owned view follows the new content rectangle
pub fn resize_views(views: &mut [ViewEntry], role: InstanceRole, width: u32, height: u32) {
    let bounds = view_bounds(role, width, height);
    for view in views.iter_mut() {
        view.bounds = bounds;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_panel_views_sit_below_tab_strip() {
        let b = view_bounds(InstanceRole::ControlPanel, 1280, 900);
        assert_eq!(
            b,
            Bounds {
                x: 0,
                y: TAB_BAR_HEIGHT,
                width: 1280,
                height: 900 - TAB_BAR_HEIGHT
            }
        );
    }

    #[test]
    fn crowd_view_fills_content_area() {
        let b = view_bounds(InstanceRole::Crowd, 1280, 900);
        assert_eq!(
            b,
            Bounds {
                x: 0,
                y: 0,
                width: 1280,
                height: 900
            }
        );
    }

    #[test]
    fn bounds_never_underflow_tiny_hosts() {
        let b = view_bounds(InstanceRole::ControlPanel, 100, 10);
        assert_eq!(b.height, 0);
    }

    #[test]
    fn proxy_error_classification() {
        assert!(is_proxy_class_error("net::ERR_CONNECTION_REFUSED"));
        assert!(is_proxy_class_error("net::ERR_TIMED_OUT"));
        assert!(is_proxy_class_error("net::ERR_SOCKS_CONNECTION_FAILED"));
        assert!(!is_proxy_class_error("net::ERR_NAME_NOT_RESOLVED"));
        assert!(!is_proxy_class_error("net::ERR_ABORTED"));
    }

    #[test]
    fn diagnostic_page_names_error_and_url() {
        let url = diagnostic_page_url("net::ERR_TIMED_OUT", "https://room.example/live");
        assert!(url.starts_with("data:text/html"));
        assert!(url.contains("net::ERR_TIMED_OUT"));
        assert!(url.contains("https://room.example/live"));
        assert!(url.contains("proxy"));
    }

    #[test]
    fn urlencode_escapes_fragment_breakers() {
        assert_eq!(urlencode("a#b%c"), "a%23b%25c");
        assert_eq!(urlencode("plain"), "plain");
    }
}
