//! Query name validation and threat classification

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{SecurityAction, SecurityCheckResult, SecurityEvent, ThreatLevel};
use crate::dns::buffer::{MAX_LABEL_LENGTH, MAX_NAME_LENGTH};
use crate::dns::protocol::{normalize_name, DnsPacket};

/// Longest name accepted in presentation form, without the trailing dot
pub const MAX_PRESENTATION_LENGTH: usize = MAX_NAME_LENGTH - 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub enabled: bool,
    /// Blocked names. An entry of the form `*.example.com` blocks the name
    /// and everything below it.
    pub blocklist: Vec<String>,
    pub suspicious_tlds: Vec<String>,
    pub max_subdomain_depth: usize,
    /// Mean Shannon entropy, in bits per character, above which subdomain
    /// labels look like encoded payload
    pub entropy_threshold: f64,
    /// Label length that, combined with high entropy, suggests tunneling
    pub tunnel_label_length: usize,
    /// Drop suspected tunneling queries instead of only reporting them
    pub block_tunneling: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            enabled: true,
            blocklist: Vec::new(),
            suspicious_tlds: ["tk", "ml", "ga", "cf", "gq", "top", "xyz", "zip", "mov"]
                .iter()
                .map(|tld| tld.to_string())
                .collect(),
            max_subdomain_depth: 10,
            entropy_threshold: 3.5,
            tunnel_label_length: 20,
            block_tunneling: false,
        }
    }
}

/// Shannon entropy of `label` in bits per character.
pub fn shannon_entropy(label: &str) -> f64 {
    if label.is_empty() {
        return 0.0;
    }

    let mut counts = [0usize; 256];
    for &b in label.as_bytes() {
        counts[b as usize] += 1;
    }

    let len = label.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn valid_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '*'
}

/// Checks question names against structural limits, a blocklist and a set
/// of heuristics
pub struct QueryValidator {
    config: ValidatorConfig,
    exact: HashSet<String>,
    wildcards: Vec<String>,
}

impl QueryValidator {
    pub fn new(config: ValidatorConfig) -> QueryValidator {
        let mut exact = HashSet::new();
        let mut wildcards = Vec::new();

        for entry in &config.blocklist {
            match entry.strip_prefix("*.") {
                Some(suffix) => wildcards.push(normalize_name(suffix)),
                None => {
                    exact.insert(normalize_name(entry));
                }
            }
        }

        QueryValidator {
            config,
            exact,
            wildcards,
        }
    }

    /// The blocklist entry matching `name`, if any.
    pub fn blocklist_match(&self, name: &str) -> Option<String> {
        let name = normalize_name(name);

        if self.exact.contains(&name) {
            return Some(name);
        }

        self.wildcards
            .iter()
            .find(|suffix| {
                name == **suffix
                    || (name.len() > suffix.len()
                        && name.ends_with(suffix.as_str())
                        && name.as_bytes()[name.len() - suffix.len() - 1] == b'.')
            })
            .map(|suffix| format!("*.{}", suffix))
    }

    /// Validates every question in `packet` and returns the most severe
    /// outcome.
    pub fn validate(&self, packet: &DnsPacket) -> SecurityCheckResult {
        if !self.config.enabled {
            return SecurityCheckResult::allow();
        }

        let mut result = SecurityCheckResult::allow();
        for question in &packet.questions {
            let check = self.validate_name(&question.name);
            if !check.allowed {
                return check;
            }
            if check.threat_level > result.threat_level {
                result.threat_level = check.threat_level;
                result.reason = check.reason;
            }
            result.events.extend(check.events);
        }

        result
    }

    pub fn validate_name(&self, raw_name: &str) -> SecurityCheckResult {
        let trimmed = raw_name.strip_suffix('.').unwrap_or(raw_name);

        if trimmed.len() > MAX_PRESENTATION_LENGTH {
            return SecurityCheckResult::deny(
                SecurityAction::FormErr,
                format!("name of {} octets is too long", trimmed.len()),
                ThreatLevel::Low,
                vec![SecurityEvent::MalformedName {
                    name: trimmed.to_string(),
                    reason: "name too long".to_string(),
                }],
            );
        }

        let labels: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('.').collect()
        };

        if let Some(label) = labels.iter().find(|l| l.len() > MAX_LABEL_LENGTH) {
            return SecurityCheckResult::deny(
                SecurityAction::FormErr,
                format!("label of {} octets is too long", label.len()),
                ThreatLevel::Low,
                vec![SecurityEvent::MalformedName {
                    name: trimmed.to_string(),
                    reason: "label too long".to_string(),
                }],
            );
        }

        let name = trimmed.to_lowercase();
        let mut events = Vec::new();

        let mut flag = |pattern: &str| {
            events.push(SecurityEvent::SuspiciousPattern {
                name: name.clone(),
                pattern: pattern.to_string(),
            })
        };

        if labels.iter().any(|l| l.is_empty()) {
            flag("consecutive dots");
        }
        if labels.iter().any(|l| l.starts_with('-') || l.ends_with('-')) {
            flag("hyphen at label edge");
        }
        if labels.iter().any(|l| !l.chars().all(valid_label_char)) {
            flag("invalid characters");
        }
        if let Some(tld) = labels.last() {
            let tld = tld.to_lowercase();
            if self.config.suspicious_tlds.iter().any(|s| *s == tld) {
                flag("suspicious tld");
            }
        }
        if labels.len() > self.config.max_subdomain_depth {
            flag("excessive depth");
        }

        let pattern_count = events.len();

        let tunneling = self.tunneling_entropy(&labels);
        if let Some(entropy) = tunneling {
            events.push(SecurityEvent::TunnelingSuspected {
                name: name.clone(),
                entropy,
            });
        }

        let blocked = self.blocklist_match(&name);
        if let Some(ref rule) = blocked {
            events.push(SecurityEvent::BlocklistMatch {
                name: name.clone(),
                rule: rule.clone(),
            });
        }

        let threat_level = match (blocked.is_some(), tunneling.is_some(), pattern_count) {
            (true, true, _) => ThreatLevel::Critical,
            (true, _, n) if n >= 2 => ThreatLevel::Critical,
            (true, _, _) => ThreatLevel::High,
            (false, true, _) => ThreatLevel::Medium,
            (false, false, n) if n >= 2 => ThreatLevel::Medium,
            (false, false, 1) => ThreatLevel::Low,
            _ => ThreatLevel::None,
        };

        if let Some(rule) = blocked {
            return SecurityCheckResult::deny(
                SecurityAction::Drop,
                format!("{} matches blocklist entry {}", name, rule),
                threat_level,
                events,
            );
        }

        if tunneling.is_some() && self.config.block_tunneling {
            return SecurityCheckResult::deny(
                SecurityAction::Drop,
                format!("{} looks like DNS tunneling", name),
                threat_level,
                events,
            );
        }

        SecurityCheckResult {
            allowed: true,
            action: SecurityAction::Allow,
            reason: if events.is_empty() {
                None
            } else {
                Some(format!("{} flagged", name))
            },
            threat_level,
            events,
        }
    }

    /// Mean entropy of the labels below the registered domain when it
    /// exceeds the threshold and one of them is unusually long.
    fn tunneling_entropy(&self, labels: &[&str]) -> Option<f64> {
        if labels.len() <= 2 {
            return None;
        }

        let subdomain = &labels[..labels.len() - 2];
        let non_empty: Vec<&str> = subdomain.iter().copied().filter(|l| !l.is_empty()).collect();
        if non_empty.is_empty() {
            return None;
        }

        let mean = non_empty
            .iter()
            .map(|l| shannon_entropy(&l.to_lowercase()))
            .sum::<f64>()
            / non_empty.len() as f64;

        let long_label = non_empty
            .iter()
            .any(|l| l.len() > self.config.tunnel_label_length);

        if mean > self.config.entropy_threshold && long_label {
            Some(mean)
        } else {
            None
        }
    }
}
