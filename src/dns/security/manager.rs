//! Security Manager combining the per-query security gates

use std::net::IpAddr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{
    QueryValidator, RateLimitConfig, RateLimiter, ResponseRateLimiter, RrlAction, RrlConfig,
    SecurityCheckResult, SecurityEvent, ThreatLevel, ValidatorConfig,
};
use crate::dns::metrics::SECURITY_EVENTS;
use crate::dns::protocol::DnsPacket;

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub rate_limiting: RateLimitConfig,
    pub validation: ValidatorConfig,
    pub rrl: RrlConfig,
    pub log_security_events: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            enabled: true,
            rate_limiting: RateLimitConfig::default(),
            validation: ValidatorConfig::default(),
            rrl: RrlConfig::default(),
            log_security_events: true,
        }
    }
}

/// Security metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityMetrics {
    pub total_queries: u64,
    pub rate_limited: u64,
    pub validation_rejected: u64,
    pub flagged_queries: u64,
    pub rrl_dropped: u64,
    pub rrl_slipped: u64,
    /// Highest threat level seen since startup
    pub threat_level: ThreatLevel,
    pub tracked_clients: usize,
    pub blocked_clients: usize,
}

pub struct SecurityManager {
    config: SecurityConfig,
    rate_limiter: RateLimiter,
    validator: QueryValidator,
    rrl: ResponseRateLimiter,
    metrics: RwLock<SecurityMetrics>,
}

impl SecurityManager {
    pub fn new(config: SecurityConfig) -> Self {
        SecurityManager {
            rate_limiter: RateLimiter::new(config.rate_limiting.clone()),
            validator: QueryValidator::new(config.validation.clone()),
            rrl: ResponseRateLimiter::new(config.rrl.clone()),
            metrics: RwLock::new(SecurityMetrics::default()),
            config,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn validator(&self) -> &QueryValidator {
        &self.validator
    }

    /// Runs an incoming request through the rate limiter and the validator.
    pub fn check_request(&self, packet: &DnsPacket, client_ip: IpAddr) -> SecurityCheckResult {
        if !self.config.enabled {
            return SecurityCheckResult::allow();
        }

        self.metrics.write().total_queries += 1;

        let rate_limit_result = self.rate_limiter.check(client_ip);
        if !rate_limit_result.allowed {
            self.metrics.write().rate_limited += 1;
            self.record(&rate_limit_result, client_ip);
            return rate_limit_result;
        }

        let validation_result = self.validator.validate(packet);
        {
            let mut metrics = self.metrics.write();
            if !validation_result.allowed {
                metrics.validation_rejected += 1;
            } else if validation_result.threat_level > ThreatLevel::None {
                metrics.flagged_queries += 1;
            }
            if validation_result.threat_level > metrics.threat_level {
                metrics.threat_level = validation_result.threat_level;
            }
        }
        self.record(&validation_result, client_ip);

        validation_result
    }

    /// Applies response rate limiting to an outgoing response.
    pub fn check_response(&self, response: &DnsPacket, client_ip: IpAddr) -> RrlAction {
        if !self.config.enabled {
            return RrlAction::Allow;
        }

        let action = self.rrl.check_response(client_ip, response);
        match action {
            RrlAction::Drop => self.metrics.write().rrl_dropped += 1,
            RrlAction::Slip => self.metrics.write().rrl_slipped += 1,
            RrlAction::Allow => {}
        }

        action
    }

    /// Discards idle client and RRL state.
    pub fn cleanup(&self) -> usize {
        self.rate_limiter.cleanup() + self.rrl.cleanup()
    }

    pub fn get_metrics(&self) -> SecurityMetrics {
        let mut metrics = self.metrics.read().clone();
        metrics.tracked_clients = self.rate_limiter.client_count();
        metrics.blocked_clients = self.rate_limiter.blocked_client_count();
        metrics
    }

    fn record(&self, result: &SecurityCheckResult, client_ip: IpAddr) {
        for event in &result.events {
            SECURITY_EVENTS
                .with_label_values(&[
                    event.kind(),
                    result.threat_level.as_str(),
                    result.action.as_str(),
                ])
                .inc();

            if !self.config.log_security_events {
                continue;
            }

            match *event {
                SecurityEvent::BlocklistMatch { ref name, ref rule } => {
                    log::warn!("{} queried blocked name {} ({})", client_ip, name, rule)
                }
                SecurityEvent::TunnelingSuspected { ref name, entropy } => log::warn!(
                    "{} sent possible tunneling query {} (entropy {:.2})",
                    client_ip,
                    name,
                    entropy
                ),
                _ => log::info!("Security event from {}: {:?}", client_ip, event),
            }
        }
    }
}
