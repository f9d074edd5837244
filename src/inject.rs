//! Fingerprint Injector
//!
//! Delivers an opaque anti-automation payload to a content view at three
//! points: before every new document, after full navigations, and after
//! in-page (SPA) route changes. Delivery is best-effort hardening — every
//! failure path is swallowed, nothing propagates into caller code.

use std::sync::Arc;

use crate::cdp::ViewSession;

/// Default payload: patches the browser surfaces automation checks key on.
/// The injector treats this as an opaque blob; instances may carry their own.
pub const FINGERPRINT_PAYLOAD: &str = r#"
(function() {
  'use strict';

  // navigator.webdriver is the first thing every check looks at
  Object.defineProperty(Object.getPrototypeOf(navigator), 'webdriver', {
      get: () => false,
      configurable: true,
      enumerable: true
  });

  // Real browsers ship a plugin list; headless surfaces ship none
  const fakePlugins = [
    { name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer', description: 'Portable Document Format' },
    { name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai', description: '' },
    { name: 'Native Client', filename: 'internal-nacl-plugin', description: '' }
  ];
  const pluginArray = {
    length: fakePlugins.length,
    item: function(index) { return this[index] || null; },
    namedItem: function(name) {
      for (let i = 0; i < this.length; i++) {
        if (this[i].name === name) return this[i];
      }
      return null;
    },
    refresh: function() {}
  };
  fakePlugins.forEach((plugin, i) => { pluginArray[i] = plugin; });
  Object.defineProperty(navigator, 'plugins', { get: () => pluginArray, configurable: true });

  Object.defineProperty(navigator, 'languages', {
    get: () => ['zh-CN', 'zh', 'en-US', 'en'],
    configurable: true
  });
  Object.defineProperty(navigator, 'platform', { get: () => 'Win32', configurable: true });
  Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 8, configurable: true });
  Object.defineProperty(navigator, 'deviceMemory', { get: () => 8, configurable: true });
  Object.defineProperty(navigator, 'maxTouchPoints', { get: () => 0, configurable: true });

  const screenProps = {
    width: 1920, height: 1080,
    availWidth: 1920, availHeight: 1040,
    colorDepth: 24, pixelDepth: 24
  };
  Object.keys(screenProps).forEach(prop => {
    Object.defineProperty(screen, prop, { get: () => screenProps[prop], configurable: true });
  });

  if (!window.chrome) {
    window.chrome = { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };
  }

  // WebGL vendor/renderer spoof
  const getParameterProxyHandler = {
    apply: function(target, thisArg, args) {
      const param = args[0];
      if (param === 37445) { return 'Google Inc. (NVIDIA)'; }
      if (param === 37446) { return 'ANGLE (NVIDIA, NVIDIA GeForce GTX 1060 Direct3D11 vs_5_0 ps_5_0, D3D11)'; }
      return target.apply(thisArg, args);
    }
  };
  const originalGetParameter = WebGLRenderingContext.prototype.getParameter;
  WebGLRenderingContext.prototype.getParameter = new Proxy(originalGetParameter, getParameterProxyHandler);
  if (typeof WebGL2RenderingContext !== 'undefined') {
    const originalGetParameter2 = WebGL2RenderingContext.prototype.getParameter;
    WebGL2RenderingContext.prototype.getParameter = new Proxy(originalGetParameter2, getParameterProxyHandler);
  }
})();
"#;

/// Best-effort payload delivery for one instance's views
#[derive(Clone)]
pub struct Injector {
    payload: Arc<str>,
}

impl Injector {
    /// Injector carrying the default payload
    pub fn new() -> Self {
        Self {
            payload: Arc::from(FINGERPRINT_PAYLOAD),
        }
    }

    /// Injector carrying a caller-supplied payload
    pub fn with_payload(payload: &str) -> Self {
        Self {
            payload: Arc::from(payload),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Register the payload to run before every new document in the view.
    /// Failures are swallowed — injection never blocks a load.
    pub async fn attach(&self, view: &ViewSession) {
        if let Err(e) = view
            .add_script_to_evaluate_on_new_document(&self.payload)
            .await
        {
            tracing::debug!(
                target_id = view.target_id(),
                error = %e,
                "fingerprint pre-load registration failed"
            );
        }
    }

    /// Re-run the payload after a navigation event (full or in-page).
    /// Fire-and-forget: a torn-down view or script error is ignored.
    pub async fn reinject(&self, view: &ViewSession) {
        if let Err(e) = view.evaluate(&self.payload).await {
            tracing::debug!(
                target_id = view.target_id(),
                error = %e,
                "fingerprint re-injection failed"
            );
        }
    }
}

impl Default for Injector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_payload_covers_core_surfaces() {
        let injector = Injector::new();
        for surface in ["webdriver", "plugins", "languages", "hardwareConcurrency"] {
            assert!(injector.payload().contains(surface));
        }
    }

    #[test]
    fn custom_payload_replaces_default() {
        let injector = Injector::with_payload("console.log('x')");
        assert_eq!(injector.payload(), "console.log('x')");
    }
}
