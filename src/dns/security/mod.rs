//! DNS Security Module
//!
//! Per-client rate limiting, query validation with threat classification and
//! response rate limiting, combined behind a single `SecurityManager`.

pub mod manager;
pub mod rate_limiter;
pub mod rrl;
pub mod validator;

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

pub use manager::{SecurityConfig, SecurityManager, SecurityMetrics};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use rrl::{ResponseRateLimiter, RrlAction, RrlConfig};
pub use validator::{QueryValidator, ValidatorConfig};


/// Threat level assigned to a query
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum ThreatLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

/// Security action to take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityAction {
    /// Process the request
    Allow,
    /// Discard the request without any response
    Drop,
    /// Answer with FORMERR
    FormErr,
}

impl SecurityAction {
    pub fn as_str(&self) -> &'static str {
        match *self {
            SecurityAction::Allow => "allow",
            SecurityAction::Drop => "drop",
            SecurityAction::FormErr => "formerr",
        }
    }
}

/// Security event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SecurityEvent {
    ClientRateLimited {
        client_ip: IpAddr,
        queries: usize,
    },
    ClientBlocked {
        client_ip: IpAddr,
        blocked_for_secs: u64,
    },
    MalformedName {
        name: String,
        reason: String,
    },
    SuspiciousPattern {
        name: String,
        pattern: String,
    },
    BlocklistMatch {
        name: String,
        rule: String,
    },
    TunnelingSuspected {
        name: String,
        entropy: f64,
    },
}

impl SecurityEvent {
    pub fn kind(&self) -> &'static str {
        match *self {
            SecurityEvent::ClientRateLimited { .. } => "rate_limited",
            SecurityEvent::ClientBlocked { .. } => "client_blocked",
            SecurityEvent::MalformedName { .. } => "malformed_name",
            SecurityEvent::SuspiciousPattern { .. } => "suspicious_pattern",
            SecurityEvent::BlocklistMatch { .. } => "blocklist",
            SecurityEvent::TunnelingSuspected { .. } => "tunneling",
        }
    }
}

/// Security check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityCheckResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Action to take if blocked
    pub action: SecurityAction,
    /// Reason for blocking (if applicable)
    pub reason: Option<String>,
    /// Threat level detected
    pub threat_level: ThreatLevel,
    /// Security events triggered
    pub events: Vec<SecurityEvent>,
}

impl SecurityCheckResult {
    pub fn allow() -> SecurityCheckResult {
        SecurityCheckResult {
            allowed: true,
            action: SecurityAction::Allow,
            reason: None,
            threat_level: ThreatLevel::None,
            events: Vec::new(),
        }
    }

    pub fn deny(
        action: SecurityAction,
        reason: String,
        threat_level: ThreatLevel,
        events: Vec<SecurityEvent>,
    ) -> SecurityCheckResult {
        SecurityCheckResult {
            allowed: false,
            action,
            reason: Some(reason),
            threat_level,
            events,
        }
    }
}
