// mitm_injector::config
//
// Static configuration for the response mutator.  A `Config` is built once
// (from JSON or from the process environment) and handed to every
// `Pipeline`; it is never mutated afterwards.

use std::collections::BTreeSet;
use std::env;

use serde::Deserialize;

use crate::error::Result;

/// Selector used when none is configured.
pub const DEFAULT_SELECTOR: &str = "body";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Bypass the host allow-list.
    pub allow_all: bool,
    /// Substrings matched against the lowercased request host.
    pub allowed_hosts: BTreeSet<String>,
    /// Remove CSP outright instead of threading a nonce into it.
    pub strip_csp: bool,
    /// Markup fragment appended at the insertion point.
    pub inject_html: String,
    /// Script body placed in a nonce-bearing `<script>`.
    pub inject_script: String,
    /// Selector for the injection anchor.
    pub insertion_selector: String,
    /// Create a CSP header when the response has none.
    pub synthesize_csp: bool,
    /// Tag the injected script with `data-injected`.
    pub mark_injected: bool,
    /// Leave documents that already carry the `data-injected` tag alone.
    pub skip_injected: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_all: false,
            allowed_hosts: BTreeSet::new(),
            strip_csp: false,
            inject_html: String::new(),
            inject_script: String::new(),
            insertion_selector: DEFAULT_SELECTOR.to_string(),
            synthesize_csp: false,
            mark_injected: true,
            skip_injected: false,
        }
    }
}

impl Config {
    /// Parse a JSON configuration object.  Unknown keys are ignored, missing
    /// keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config.normalized())
    }

    /// Build a configuration from the process environment:
    ///
    ///   INTERCEPT_DOMAINS  comma separated host substrings; empty = all hosts
    ///   INJECT_HTML        markup fragment
    ///   INJECT_SCRIPT      script body
    ///   INJECT_SELECTOR    insertion selector (default `body`)
    ///   STRIP_CSP          `1`/`true` to strip CSP
    ///   SYNTHESIZE_CSP     `1`/`true` to create a missing CSP header
    ///   MARK_INJECTED      `0`/`false` to disable the injection marker
    ///   SKIP_INJECTED      `1`/`true` to skip already marked documents
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let allowed_hosts: BTreeSet<String> = lookup("INTERCEPT_DOMAINS")
            .unwrap_or_default()
            .split(',')
            .map(str::to_string)
            .collect();

        let config = Config {
            allow_all: false,
            allowed_hosts,
            strip_csp: lookup("STRIP_CSP").map(|v| parse_flag(&v)).unwrap_or(false),
            inject_html: lookup("INJECT_HTML").unwrap_or_default(),
            inject_script: lookup("INJECT_SCRIPT").unwrap_or_default(),
            insertion_selector: lookup("INJECT_SELECTOR")
                .unwrap_or(defaults.insertion_selector),
            synthesize_csp: lookup("SYNTHESIZE_CSP").map(|v| parse_flag(&v)).unwrap_or(false),
            mark_injected: lookup("MARK_INJECTED")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.mark_injected),
            skip_injected: lookup("SKIP_INJECTED").map(|v| parse_flag(&v)).unwrap_or(false),
        }
        .normalized();

        // An empty domain list means "inject everywhere".
        Config {
            allow_all: config.allowed_hosts.is_empty(),
            ..config
        }
    }

    /// Lowercase and trim host entries, drop empty ones, and restore the
    /// default selector if the configured one is blank.
    fn normalized(mut self) -> Self {
        self.allowed_hosts = self
            .allowed_hosts
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if self.insertion_selector.trim().is_empty() {
            self.insertion_selector = DEFAULT_SELECTOR.to_string();
        }
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
