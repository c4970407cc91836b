//! Child environment construction.
//!
//! Computes the environment for a spawned upstream from tier-based
//! inheritance rules and configuration overrides. The policy is total: for
//! any inputs there is exactly one output, so this module has no error
//! type.
//!
//! Precedence (highest to lowest):
//! 1. Explicit `env` overrides in the server config (bypass all deny rules)
//! 2. Explicit deny rules (server and proxy level, plus the implicit list)
//! 3. Tier 1 variables (unless denied)
//! 4. Tier 2 variables (if the effective mode enables them, unless denied)
//! 5. `extra` variables from config (unless denied and not explicitly allowed)
//! 6. Prefix-matched variables (unless denied)

use std::collections::{BTreeMap, HashSet};

use crate::config::{InheritConfig, ServerConfig};

// ─── Variable Tiers ──────────────────────────────────────────────────────────

/// Baseline variables that most child processes need. Always inherited
/// unless explicitly denied.
pub const TIER1_VARS: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TZ", "TMPDIR", "TEMP", "TMP",
];

/// TLS and CA-bundle variables. Inherited when the effective mode is
/// `tier1+tier2` or `all`.
pub const TIER2_VARS: &[&str] = &[
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
    "REQUESTS_CA_BUNDLE",
    "CURL_CA_BUNDLE",
    "NODE_EXTRA_CA_CERTS",
];

/// Variables never inherited without explicit configuration (httpoxy
/// mitigation).
pub const IMPLICIT_DENYLIST: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "http_proxy",
    "https_proxy",
    "NO_PROXY",
    "no_proxy",
];

// ─── Building ────────────────────────────────────────────────────────────────

/// Build the environment for an upstream from the live parent environment.
///
/// Returns entries in `"KEY=value"` format, sorted by key.
pub fn build_environment(
    server: &ServerConfig,
    proxy_inherit: Option<&InheritConfig>,
) -> Vec<String> {
    let parent: Vec<(String, String)> = std::env::vars().collect();
    build_environment_from(server, proxy_inherit, &parent, cfg!(windows))
}

/// Build the environment from an explicit parent snapshot. Deterministic in
/// its inputs; `case_insensitive` selects the Windows name policy
/// (comparisons on uppercased names, original casing preserved in output).
pub fn build_environment_from(
    server: &ServerConfig,
    proxy_inherit: Option<&InheritConfig>,
    parent: &[(String, String)],
    case_insensitive: bool,
) -> Vec<String> {
    let norm = |key: &str| normalize_key(key, case_insensitive);

    let deny = build_deny_set(server, proxy_inherit, case_insensitive);

    // normalized key -> (original key, value)
    let mut parent_map: BTreeMap<String, (String, String)> = BTreeMap::new();
    for (key, value) in parent {
        if key.is_empty() {
            continue;
        }
        parent_map.insert(norm(key), (key.clone(), value.clone()));
    }

    let mut result: BTreeMap<String, (String, String)> = BTreeMap::new();
    let add_var = |result: &mut BTreeMap<String, (String, String)>, key: &str, allow_denied: bool| {
        let lookup = norm(key);
        if deny.contains(&lookup) && !allow_denied {
            return;
        }
        if let Some(entry) = parent_map.get(&lookup) {
            result.insert(lookup, entry.clone());
        }
    };

    // Tier 1 baseline
    for key in TIER1_VARS {
        add_var(&mut result, key, false);
    }

    // Tier 2 when enabled at either level
    let server_inherit = server.inherit.as_ref();
    let tier2 = server_inherit.is_some_and(|i| i.mode.includes_tier2())
        || proxy_inherit.is_some_and(|i| i.mode.includes_tier2());
    if tier2 {
        for key in TIER2_VARS {
            add_var(&mut result, key, false);
        }
    }

    // Extra variables, server level then proxy level. A denied name is
    // admitted only when the level that listed it set
    // allow_denied_if_explicit.
    if let Some(inherit) = server_inherit {
        for key in &inherit.extra {
            add_var(&mut result, key, inherit.allow_denied_if_explicit);
        }
    }
    if let Some(inherit) = proxy_inherit {
        for key in &inherit.extra {
            add_var(&mut result, key, inherit.allow_denied_if_explicit);
        }
    }

    // Prefix-matched variables
    let mut prefixes = Vec::new();
    if let Some(inherit) = server_inherit {
        prefixes.extend(inherit.prefix.iter().map(|p| norm(p)));
    }
    if let Some(inherit) = proxy_inherit {
        prefixes.extend(inherit.prefix.iter().map(|p| norm(p)));
    }
    if !prefixes.is_empty() {
        for (lookup, entry) in &parent_map {
            if deny.contains(lookup) {
                continue;
            }
            if prefixes.iter().any(|p| lookup.starts_with(p.as_str())) {
                result.insert(lookup.clone(), entry.clone());
            }
        }
    }

    // Explicit overrides last: written verbatim, deny rules do not apply.
    for (key, value) in &server.env {
        result.insert(norm(key), (key.clone(), value.clone()));
    }

    result
        .into_values()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Combined deny set: the implicit denylist plus server- and proxy-level
/// deny rules, normalized.
fn build_deny_set(
    server: &ServerConfig,
    proxy_inherit: Option<&InheritConfig>,
    case_insensitive: bool,
) -> HashSet<String> {
    let mut deny = HashSet::new();
    for key in IMPLICIT_DENYLIST {
        deny.insert(normalize_key(key, case_insensitive));
    }
    if let Some(inherit) = &server.inherit {
        for key in &inherit.deny {
            deny.insert(normalize_key(key, case_insensitive));
        }
    }
    if let Some(inherit) = proxy_inherit {
        for key in &inherit.deny {
            deny.insert(normalize_key(key, case_insensitive));
        }
    }
    deny
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Normalize a variable name for comparison. Case-insensitive platforms
/// (Windows) compare on the uppercased name.
pub fn normalize_key(key: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        key.to_uppercase()
    } else {
        key.to_string()
    }
}

/// Split a `"KEY=value"` entry at the first `=`. Returns `None` for
/// malformed entries (no `=`, or empty key).
pub fn split_env_entry(entry: &str) -> Option<(&str, &str)> {
    match entry.find('=') {
        Some(0) | None => None,
        Some(idx) => Some((&entry[..idx], &entry[idx + 1..])),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
