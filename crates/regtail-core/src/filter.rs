//! Relevance filter for Koishi plugin packages.
//!
//! Plugin packages follow the naming convention:
//!
//! - `koishi-plugin-<name>` or `@<scope>/koishi-plugin-<name>` for community plugins
//! - `@koishijs/plugin-<name>` for the first-party scope
//!
//! The feed carries every npm package, almost none of which are plugins, so
//! ids without the `plugin-` trigger are rejected with a substring scan before
//! the full pattern runs.

use std::sync::LazyLock;

use memchr::memmem;
use regex::Regex;

const TRIGGER: &str = "plugin-";
const FIRST_PARTY_PREFIX: &str = "@koishijs/plugin-";
const COMMUNITY_PREFIX: &str = "koishi-plugin-";

static TRIGGER_FINDER: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(TRIGGER));

static PLUGIN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:@[a-z0-9\-~][a-z0-9\-._~]*/)?koishi-|@koishijs/)plugin-[a-z0-9\-._~]+$")
        .expect("plugin pattern is valid")
});

/// Whether `package_id` names a Koishi plugin.
#[must_use]
pub fn is_relevant(package_id: &str) -> bool {
    if TRIGGER_FINDER.find(package_id.as_bytes()).is_none() {
        return false;
    }
    PLUGIN_PATTERN.is_match(package_id)
}

/// Whether `package_id` is a plugin published under the first-party scope.
#[must_use]
pub fn is_first_party(package_id: &str) -> bool {
    package_id.starts_with(FIRST_PARTY_PREFIX) && is_relevant(package_id)
}

/// Plugin name with scope and prefix removed, e.g. `console` for
/// `@koishijs/plugin-console`. `None` for non-plugins.
#[must_use]
pub fn short_name(package_id: &str) -> Option<&str> {
    if !is_relevant(package_id) {
        return None;
    }
    if let Some(rest) = package_id.strip_prefix(FIRST_PARTY_PREFIX) {
        return Some(rest);
    }
    let unscoped = match package_id.split_once('/') {
        Some((_, rest)) => rest,
        None => package_id,
    };
    unscoped.strip_prefix(COMMUNITY_PREFIX)
}
