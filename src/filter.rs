// mitm_injector::filter
//
// Eligibility filter.  Pure predicate over host and content type.

use crate::config::Config;

/// Decide whether a response qualifies for mutation.
///
/// `host` is expected to be lowercased already; allow-list entries are
/// matched as plain substrings, so `example.com` also admits
/// `www.example.com`.
pub fn should_mutate(config: &Config, host: &str, content_type: &str) -> bool {
    host_allowed(config, host) && is_html(content_type)
}

pub fn host_allowed(config: &Config, host: &str) -> bool {
    config.allow_all
        || config
            .allowed_hosts
            .iter()
            .any(|allowed| host.contains(allowed.as_str()))
}

pub fn is_html(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/html")
}
