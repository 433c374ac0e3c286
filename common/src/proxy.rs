// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Effective HTTP proxy policy.
//!
//! The policy is read from the usual environment variables, extended with the
//! cluster's own domains, and can be pushed back into the process environment
//! for the duration of a command through an [`EnvironmentOverlay`].

use serde::{Deserialize, Serialize};
use std::ffi::OsString;

const HTTP_PROXY_VARS: [&str; 2] = ["HTTP_PROXY", "http_proxy"];
const HTTPS_PROXY_VARS: [&str; 2] = ["HTTPS_PROXY", "https_proxy"];
const NO_PROXY_VARS: [&str; 2] = ["NO_PROXY", "no_proxy"];

/// Hosts which never go through the proxy.
const DEFAULT_NO_PROXY: [&str; 2] = ["127.0.0.1", "localhost"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("proxy URL '{url}' is not valid: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    no_proxy: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_proxy: None,
            https_proxy: None,
            no_proxy: DEFAULT_NO_PROXY.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProxyConfig {
    /// Reads the proxy settings of the current process environment.
    pub fn from_env() -> Result<Self, ProxyError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads proxy settings through `lookup`, which maps a variable name to
    /// its value. Upper-case names take precedence over lower-case ones.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProxyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first_set = |names: &[&str]| {
            names
                .iter()
                .filter_map(|name| lookup(name))
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
        };

        let http_proxy = first_set(&HTTP_PROXY_VARS);
        let https_proxy = first_set(&HTTPS_PROXY_VARS);
        for url in http_proxy.iter().chain(https_proxy.iter()) {
            validate_proxy_url(url)?;
        }

        let mut config = ProxyConfig { http_proxy, https_proxy, ..Default::default() };
        if let Some(no_proxy) = first_set(&NO_PROXY_VARS) {
            no_proxy
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .for_each(|entry| config.add_no_proxy(entry));
        }
        Ok(config)
    }

    /// True iff an HTTP or HTTPS proxy is configured.
    pub fn is_enabled(&self) -> bool {
        self.http_proxy.is_some() || self.https_proxy.is_some()
    }

    /// Adds an entry to the no-proxy list. Duplicates are tolerated by every
    /// consumer of the list, so no membership check is made.
    pub fn add_no_proxy(&mut self, entry: impl Into<String>) {
        self.no_proxy.push(entry.into());
    }

    pub fn no_proxy(&self) -> &[String] {
        &self.no_proxy
    }

    /// The no-proxy list in its environment-variable form.
    pub fn no_proxy_string(&self) -> String {
        self.no_proxy.join(",")
    }

    /// Pushes this policy into the process environment.
    ///
    /// Nothing changes when no proxy is configured. The previous values are
    /// restored when the returned overlay is dropped.
    #[must_use = "the environment is restored when the overlay is dropped"]
    pub fn apply_to_environment(&self) -> EnvironmentOverlay {
        let mut overlay = EnvironmentOverlay { saved: Vec::new() };
        if !self.is_enabled() {
            return overlay;
        }

        let no_proxy = self.no_proxy_string();
        let values = [
            (HTTP_PROXY_VARS, self.http_proxy.as_deref()),
            (HTTPS_PROXY_VARS, self.https_proxy.as_deref()),
            (NO_PROXY_VARS, Some(no_proxy.as_str())),
        ];
        for (names, value) in values {
            for name in names {
                overlay.set(name, value);
            }
        }
        overlay
    }
}

/// Derives the proxy policy for a cluster living under `base_domain`.
pub fn resolve_proxy_config(base_domain: &str) -> Result<ProxyConfig, ProxyError> {
    resolve_proxy_config_with(base_domain, |name| std::env::var(name).ok())
}

/// Like [`resolve_proxy_config`], reading variables through `lookup`.
pub fn resolve_proxy_config_with<F>(
    base_domain: &str,
    lookup: F,
) -> Result<ProxyConfig, ProxyError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ProxyConfig::from_lookup(lookup)?;
    if config.is_enabled() {
        config.add_no_proxy(format!(".{base_domain}"));
    }
    Ok(config)
}

fn validate_proxy_url(raw: &str) -> Result<(), ProxyError> {
    let invalid = |reason: String| ProxyError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let url = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "http" {
        return Err(invalid(format!(
            "unsupported scheme '{}', only http:// proxies are supported",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(())
}

/// Proxy variables pushed into the process environment.
///
/// Dropping the overlay restores every variable it touched to its previous
/// value (or unsets it), on success and error paths alike.
#[derive(Debug)]
pub struct EnvironmentOverlay {
    saved: Vec<(&'static str, Option<OsString>)>,
}

impl EnvironmentOverlay {
    fn set(&mut self, name: &'static str, value: Option<&str>) {
        self.saved.push((name, std::env::var_os(name)));
        match value {
            Some(value) => std::env::set_var(name, value),
            None => std::env::remove_var(name),
        }
    }

    /// True if the overlay changed nothing.
    pub fn is_empty(&self) -> bool {
        self.saved.is_empty()
    }
}

impl Drop for EnvironmentOverlay {
    fn drop(&mut self) {
        for (name, previous) in self.saved.drain(..).rev() {
            match previous {
                Some(value) => std::env::set_var(name, value),
                None => std::env::remove_var(name),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    // Tests touching the real process environment must not interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn lookup(
        vars: &[(&str, &str)],
    ) -> impl Fn(&str) -> Option<String> + 'static {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_no_proxy_gets_base_domain_when_enabled() {
        let config = resolve_proxy_config_with(
            "testing",
            lookup(&[("HTTPS_PROXY", "http://proxy.example.com:3128")]),
        )
        .unwrap();
        assert!(config.is_enabled());
        assert_eq!(
            config.https_proxy.as_deref(),
            Some("http://proxy.example.com:3128")
        );
        assert!(config.no_proxy().iter().any(|e| e == ".testing"));
        assert!(config.no_proxy().iter().any(|e| e == "localhost"));
    }

    #[test]
    fn test_disabled_without_proxy_urls() {
        let config = resolve_proxy_config_with(
            "testing",
            lookup(&[("NO_PROXY", "internal.example.com, .corp")]),
        )
        .unwrap();
        assert!(!config.is_enabled());
        assert!(!config.no_proxy().iter().any(|e| e == ".testing"));
        assert!(config.no_proxy().iter().any(|e| e == ".corp"));
    }

    #[test]
    fn test_upper_case_wins_and_blank_is_unset() {
        let config = ProxyConfig::from_lookup(lookup(&[
            ("HTTP_PROXY", "http://upper:8080"),
            ("http_proxy", "http://lower:8080"),
            ("HTTPS_PROXY", "  "),
        ]))
        .unwrap();
        assert_eq!(config.http_proxy.as_deref(), Some("http://upper:8080"));
        assert_eq!(config.https_proxy, None);
    }

    #[test]
    fn test_invalid_proxy_urls_are_rejected() {
        let err = ProxyConfig::from_lookup(lookup(&[(
            "https_proxy",
            "https://secure-proxy:443",
        )]))
        .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidUrl { .. }));

        let err =
            ProxyConfig::from_lookup(lookup(&[("HTTP_PROXY", "not a url")]))
                .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidUrl { .. }));
    }

    #[test]
    fn test_add_no_proxy_appends() {
        let mut config = ProxyConfig::default();
        config.add_no_proxy("192.168.130.11");
        config.add_no_proxy("192.168.130.11");
        assert_eq!(
            config.no_proxy_string(),
            "127.0.0.1,localhost,192.168.130.11,192.168.130.11"
        );
    }

    #[test]
    fn test_overlay_restores_environment() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("HTTP_PROXY", "http://previous:1");
        std::env::remove_var("NO_PROXY");

        let config = resolve_proxy_config_with(
            "testing",
            lookup(&[("HTTP_PROXY", "http://proxy:3128")]),
        )
        .unwrap();
        {
            let overlay = config.apply_to_environment();
            assert!(!overlay.is_empty());
            assert_eq!(std::env::var("HTTP_PROXY").unwrap(), "http://proxy:3128");
            assert!(std::env::var("NO_PROXY").unwrap().ends_with(".testing"));
        }
        assert_eq!(std::env::var("HTTP_PROXY").unwrap(), "http://previous:1");
        assert!(std::env::var("NO_PROXY").is_err());
        std::env::remove_var("HTTP_PROXY");
    }

    #[test]
    fn test_disabled_overlay_is_noop() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("HTTPS_PROXY");
        let overlay = ProxyConfig::default().apply_to_environment();
        assert!(overlay.is_empty());
        assert!(std::env::var("HTTPS_PROXY").is_err());
    }
}
