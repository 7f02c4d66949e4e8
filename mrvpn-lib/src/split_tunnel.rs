use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt::{self, Display};
use std::str::FromStr;

use crate::singbox::RouteRule;

pub const PROXY_OUTBOUND: &str = "proxy";
pub const DIRECT_OUTBOUND: &str = "direct";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Off,
    App,
    Domain,
}

/// Split-tunnel selection as last applied by the UI. `invert` flips the
/// selection to "everything except the listed apps/domains".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitTunnelConfig {
    pub mode: Mode,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub invert: bool,
}

/// Route-rule fragments derived from a split-tunnel selection, together with
/// the `final` outbound the remaining traffic falls through to.
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledRules {
    pub rules: Vec<RouteRule>,
    pub final_outbound: String,
    pub find_process: bool,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown split tunnel mode `{0}`")]
    UnknownMode(String),
}

pub fn compile(config: &SplitTunnelConfig) -> CompiledRules {
    match config.mode {
        Mode::Off => CompiledRules {
            rules: Vec::new(),
            final_outbound: PROXY_OUTBOUND.to_string(),
            find_process: false,
        },
        Mode::App => CompiledRules {
            rules: app_rules(&config.apps, config.invert),
            final_outbound: selected_final(config.invert),
            find_process: true,
        },
        Mode::Domain => CompiledRules {
            rules: domain_rules(&config.domains, config.invert),
            final_outbound: selected_final(config.invert),
            find_process: false,
        },
    }
}

// listed traffic goes to the selected outbound, everything else to `final`
fn selected_outbound(invert: bool) -> String {
    if invert { DIRECT_OUTBOUND } else { PROXY_OUTBOUND }.to_string()
}

fn selected_final(invert: bool) -> String {
    if invert { PROXY_OUTBOUND } else { DIRECT_OUTBOUND }.to_string()
}

fn app_rules(apps: &[String], invert: bool) -> Vec<RouteRule> {
    let names: Vec<String> = apps.iter().filter(|a| !a.trim().is_empty()).map(|a| a.trim().to_string()).collect();
    if names.is_empty() {
        return Vec::new();
    }
    vec![RouteRule {
        process_name: Some(names),
        outbound: selected_outbound(invert),
        ..RouteRule::default()
    }]
}

fn domain_rules(domains: &[String], invert: bool) -> Vec<RouteRule> {
    let mut exact = Vec::new();
    let mut suffixes = Vec::new();
    for raw in domains {
        let Some(sanitized) = sanitize_domain(raw) else {
            continue;
        };
        match sanitized.strip_prefix('.') {
            Some(rest) if !rest.is_empty() => suffixes.push(rest.to_string()),
            Some(_) => {}
            None => {
                exact.push(sanitized.clone());
                suffixes.push(sanitized.clone());
            }
        }
    }
    if exact.is_empty() && suffixes.is_empty() {
        return Vec::new();
    }
    vec![RouteRule {
        domain: if exact.is_empty() { None } else { Some(exact) },
        domain_suffix: if suffixes.is_empty() { None } else { Some(suffixes) },
        outbound: selected_outbound(invert),
        ..RouteRule::default()
    }]
}

/// Strips scheme, path, port and surrounding whitespace from a user-supplied
/// host pattern. Returns `None` when nothing usable remains.
fn sanitize_domain(raw: &str) -> Option<String> {
    let mut s = raw.trim();
    s = s.strip_prefix("https://").or_else(|| s.strip_prefix("http://")).unwrap_or(s);
    if let Some(slash) = s.find('/') {
        s = &s[..slash];
    }
    if let Some(colon) = s.find(':') {
        s = &s[..colon];
    }
    let s = s.trim();
    if s.is_empty() { None } else { Some(s.to_string()) }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Mode::Off),
            "app" => Ok(Mode::App),
            "domain" => Ok(Mode::Domain),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Off => write!(f, "off"),
            Mode::App => write!(f, "app"),
            Mode::Domain => write!(f, "domain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(mode: Mode, apps: &[&str], domains: &[&str], invert: bool) -> SplitTunnelConfig {
        SplitTunnelConfig {
            mode,
            apps: apps.iter().map(|s| s.to_string()).collect(),
            domains: domains.iter().map(|s| s.to_string()).collect(),
            invert,
        }
    }

    #[test]
    fn off_mode_routes_everything_through_the_proxy() {
        let compiled = compile(&config(Mode::Off, &[], &[], false));
        assert!(compiled.rules.is_empty());
        assert_eq!(compiled.final_outbound, PROXY_OUTBOUND);
        assert!(!compiled.find_process);
    }

    #[test]
    fn app_mode_selects_processes_for_the_proxy() {
        let compiled = compile(&config(Mode::App, &["chrome.exe", "firefox.exe"], &[], false));

        assert_eq!(compiled.rules.len(), 1);
        let rule = &compiled.rules[0];
        assert_eq!(
            rule.process_name.as_deref(),
            Some(&["chrome.exe".to_string(), "firefox.exe".to_string()][..])
        );
        assert_eq!(rule.outbound, PROXY_OUTBOUND);
        assert_eq!(compiled.final_outbound, DIRECT_OUTBOUND);
        assert!(compiled.find_process);
    }

    #[test]
    fn inverted_app_mode_sends_selection_direct() {
        let compiled = compile(&config(Mode::App, &["steam.exe"], &[], true));

        assert_eq!(compiled.rules[0].outbound, DIRECT_OUTBOUND);
        assert_eq!(compiled.final_outbound, PROXY_OUTBOUND);
    }

    #[test]
    fn empty_app_list_emits_no_rule() {
        let compiled = compile(&config(Mode::App, &[], &[], false));
        assert!(compiled.rules.is_empty());
        assert_eq!(compiled.final_outbound, DIRECT_OUTBOUND);
        assert!(compiled.find_process);
    }

    #[test]
    fn domain_mode_derives_exact_and_suffix_entries() {
        let compiled = compile(&config(Mode::Domain, &[], &[".ads.net", "example.com"], false));

        assert_eq!(compiled.rules.len(), 1);
        let rule = &compiled.rules[0];
        assert_eq!(rule.domain.as_deref(), Some(&["example.com".to_string()][..]));
        assert_eq!(
            rule.domain_suffix.as_deref(),
            Some(&["ads.net".to_string(), "example.com".to_string()][..])
        );
        assert_eq!(rule.outbound, PROXY_OUTBOUND);
        assert_eq!(compiled.final_outbound, DIRECT_OUTBOUND);
        assert!(!compiled.find_process);
    }

    #[rstest]
    #[case("https://example.com/path/page", "example.com")]
    #[case("http://example.com:8080", "example.com")]
    #[case("  example.com  ", "example.com")]
    #[case("example.com:443/x", "example.com")]
    fn sanitizes_host_patterns(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sanitize_domain(raw).as_deref(), Some(expected));
    }

    #[test]
    fn unusable_domain_entries_are_skipped() {
        let compiled = compile(&config(Mode::Domain, &[], &["  ", "https://"], false));
        assert!(compiled.rules.is_empty());
    }

    #[test]
    fn mode_parses_from_wire_strings() {
        assert_eq!("app".parse::<Mode>().unwrap(), Mode::App);
        assert!(matches!("tcp".parse::<Mode>(), Err(Error::UnknownMode(_))));
    }
}
