//! Two independent rate-limiting layers.
//!
//! `HttpRateLimitConfig`/`rate_limit_middleware` is the ambient per-IP
//! HTTP throttle guarding the whole surface before auth runs, unchanged
//! in role from the teacher's `governor`-based middleware. `AgentRateLimiter`
//! is the bespoke per-(agent, channel, tier) token bucket required on the
//! hub's internal frame-handling path; it never goes through the HTTP
//! middleware stack and is read/written from a `DashMap` so a slow agent
//! never blocks another agent's check.

use crate::constants::{RATE_LIMIT_BACKOFF_CURVE_SECS, RATE_LIMIT_QUIET_WINDOW_SECS};
use crate::models::AgentId;
use crate::{AgentComError, Result};
use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use dashmap::{DashMap, DashSet};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, net::SocketAddr, num::NonZeroU32, sync::Arc, time::Instant};
use tracing::warn;

pub const REQUESTS_PER_MINUTE: u32 = 60;
pub const TASK_REQUESTS_PER_MINUTE: u32 = 10;

#[derive(Clone)]
pub struct HttpRateLimitConfig {
    pub general_limiter: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    pub task_limiter: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl HttpRateLimitConfig {
    pub fn new() -> Self {
        let general_quota = Quota::per_minute(NonZeroU32::new(REQUESTS_PER_MINUTE).unwrap());
        let task_quota = Quota::per_minute(NonZeroU32::new(TASK_REQUESTS_PER_MINUTE).unwrap());
        Self {
            general_limiter: Arc::new(GovernorLimiter::direct(general_quota)),
            task_limiter: Arc::new(GovernorLimiter::direct(task_quota)),
        }
    }
}

impl Default for HttpRateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::State(config): axum::extract::State<HttpRateLimitConfig>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = request.uri().path();
    let is_task_write = path.starts_with("/api/tasks") && request.method() == "POST";

    let check = if is_task_write {
        config.task_limiter.check()
    } else {
        config.general_limiter.check()
    };

    if check.is_err() {
        warn!("HTTP rate limit exceeded for {}", addr.ip());
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(request).await)
}

pub fn extract_client_ip(request: &Request) -> String {
    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        if let Ok(ip_str) = forwarded_for.to_str() {
            if let Some(first_ip) = ip_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.to_string();
        }
    }
    "unknown".to_string()
}

fn backoff_for(violation_count: u32) -> u64 {
    let idx = (violation_count as usize).saturating_sub(1).min(RATE_LIMIT_BACKOFF_CURVE_SECS.len() - 1);
    RATE_LIMIT_BACKOFF_CURVE_SECS[idx]
}

/// Per-(agent, channel, tier) capacity/refill override, set by the admin
/// API. A field left `None` falls back to the caller-supplied default.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateOverride {
    pub capacity: Option<f64>,
    pub refill_per_sec: Option<f64>,
}

/// Outcome of a `Check` call. `Deny` is represented as `Err` so existing
/// `.is_err()`/`.is_ok()` call sites keep working without change; `Allow`
/// and `Warn` are both `Ok` so a caller that only cares about admission
/// doesn't have to match on the decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allow { remaining: f64 },
    Warn { remaining: f64 },
    Exempt,
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    consecutive_violations: u32,
    last_violation: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub channel: String,
    pub tier: String,
    pub tokens: f64,
    pub capacity: f64,
    pub consecutive_violations: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRateStatus {
    pub agent_id: AgentId,
    pub whitelisted: bool,
    #[serde(rename = "override")]
    pub override_: Option<RateOverride>,
    pub buckets: Vec<BucketStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemRateSummary {
    pub tracked_agents: usize,
    pub whitelisted_agents: usize,
    pub overridden_agents: usize,
    pub total_buckets: usize,
}

/// Lock-free token bucket table keyed on `(agent_id, channel, tier)`.
/// Each entry lazily refills based on elapsed monotonic time rather than
/// a background tick, so a dormant bucket costs nothing until it's
/// touched again. `overrides`/`whitelist` back the admin surface in
/// spec §4.6: a whitelisted agent always gets `Exempt` without touching
/// its buckets, and an override replaces the caller-supplied
/// capacity/refill for that agent until removed.
#[derive(Default)]
pub struct AgentRateLimiter {
    buckets: DashMap<(AgentId, String, String), Bucket>,
    overrides: DashMap<AgentId, RateOverride>,
    whitelist: DashSet<AgentId>,
}

impl AgentRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks and consumes one token for `(agent_id, channel, tier)`,
    /// creating the bucket on first use. A whitelisted agent short-
    /// circuits to `Exempt` before any bucket is touched. Returns
    /// `AgentComError::RateLimited` with the backoff the caller should
    /// honor before retrying when the bucket is empty.
    pub fn check(
        &self,
        agent_id: &AgentId,
        channel: &str,
        tier: &str,
        capacity: f64,
        refill_per_sec: f64,
    ) -> Result<RateDecision> {
        if self.whitelist.contains(agent_id) {
            return Ok(RateDecision::Exempt);
        }

        let (capacity, refill_per_sec) = match self.overrides.get(agent_id) {
            Some(o) => (o.capacity.unwrap_or(capacity), o.refill_per_sec.unwrap_or(refill_per_sec)),
            None => (capacity, refill_per_sec),
        };

        let key = (agent_id.clone(), channel.to_string(), tier.to_string());
        let mut entry = self.buckets.entry(key).or_insert_with(|| Bucket {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
            consecutive_violations: 0,
            last_violation: None,
        });

        let now = Instant::now();
        let elapsed = now.saturating_duration_since(entry.last_refill).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * entry.refill_per_sec).min(entry.capacity);
        entry.last_refill = now;
        entry.capacity = capacity;
        entry.refill_per_sec = refill_per_sec;

        if let Some(last_violation) = entry.last_violation {
            if now.saturating_duration_since(last_violation).as_secs() > RATE_LIMIT_QUIET_WINDOW_SECS {
                entry.consecutive_violations = 0;
            }
        }

        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            let remaining = entry.tokens;
            if entry.capacity > 0.0 && remaining < entry.capacity * 0.2 {
                Ok(RateDecision::Warn { remaining })
            } else {
                Ok(RateDecision::Allow { remaining })
            }
        } else {
            entry.consecutive_violations += 1;
            entry.last_violation = Some(now);
            let retry_after_secs = backoff_for(entry.consecutive_violations);
            Err(AgentComError::RateLimited {
                message: format!("rate limit exceeded for {channel}"),
                retry_after_secs,
            })
        }
    }

    /// Drops buckets that have seen no activity for `idle_secs`,
    /// bounding the table's memory use as agents disconnect for good.
    pub fn prune_dormant(&self, idle_secs: i64) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, b| {
            now.saturating_duration_since(b.last_refill).as_secs() as i64 <= idle_secs
        });
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Sets or replaces the capacity/refill override for `agent_id` and
    /// resets its buckets so the new limits take effect immediately.
    pub fn set_override(&self, agent_id: &AgentId, override_: RateOverride) {
        self.overrides.insert(agent_id.clone(), override_);
        self.reset_buckets_for(agent_id);
    }

    pub fn remove_override(&self, agent_id: &AgentId) {
        self.overrides.remove(agent_id);
        self.reset_buckets_for(agent_id);
    }

    /// Replaces the whole exempt whitelist, resetting buckets for every
    /// agent added to it.
    pub fn update_whitelist(&self, agent_ids: Vec<AgentId>) {
        self.whitelist.clear();
        for id in &agent_ids {
            self.whitelist.insert(id.clone());
            self.reset_buckets_for(id);
        }
    }

    pub fn add_to_whitelist(&self, agent_id: &AgentId) {
        self.whitelist.insert(agent_id.clone());
        self.reset_buckets_for(agent_id);
    }

    pub fn remove_from_whitelist(&self, agent_id: &AgentId) {
        self.whitelist.remove(agent_id);
        self.reset_buckets_for(agent_id);
    }

    pub fn is_whitelisted(&self, agent_id: &AgentId) -> bool {
        self.whitelist.contains(agent_id)
    }

    fn reset_buckets_for(&self, agent_id: &AgentId) {
        self.buckets.retain(|(id, _, _), _| id != agent_id);
    }

    /// Per-agent snapshot of whitelist/override state and every live
    /// bucket, for the admin `AgentRateStatus` endpoint.
    pub fn agent_rate_status(&self, agent_id: &AgentId) -> AgentRateStatus {
        let buckets = self
            .buckets
            .iter()
            .filter(|entry| &entry.key().0 == agent_id)
            .map(|entry| {
                let (_, channel, tier) = entry.key();
                BucketStatus {
                    channel: channel.clone(),
                    tier: tier.clone(),
                    tokens: entry.value().tokens,
                    capacity: entry.value().capacity,
                    consecutive_violations: entry.value().consecutive_violations,
                }
            })
            .collect();

        AgentRateStatus {
            agent_id: agent_id.clone(),
            whitelisted: self.whitelist.contains(agent_id),
            override_: self.overrides.get(agent_id).map(|r| *r),
            buckets,
        }
    }

    /// System-wide snapshot for the admin dashboard.
    pub fn system_rate_summary(&self) -> SystemRateSummary {
        let tracked: HashSet<AgentId> = self.buckets.iter().map(|e| e.key().0.clone()).collect();
        SystemRateSummary {
            tracked_agents: tracked.len(),
            whitelisted_agents: self.whitelist.len(),
            overridden_agents: self.overrides.len(),
            total_buckets: self.buckets.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_rate_limit_config_allows_initial_requests() {
        let config = HttpRateLimitConfig::new();
        assert!(config.general_limiter.check().is_ok());
        assert!(config.task_limiter.check().is_ok());
    }

    #[test]
    fn test_agent_bucket_exhausts_then_refuses() {
        let limiter = AgentRateLimiter::new();
        let agent = "agent-1".to_string();

        for _ in 0..3 {
            assert!(limiter.check(&agent, "default", "standard", 3.0, 0.0).is_ok());
        }
        let result = limiter.check(&agent, "default", "standard", 3.0, 0.0);
        assert!(result.is_err());
    }

    #[test]
    fn test_backoff_curve_escalates_with_consecutive_violations() {
        let limiter = AgentRateLimiter::new();
        let agent = "agent-1".to_string();
        limiter.check(&agent, "c", "t", 0.0, 0.0).unwrap_err();
        let second = match limiter.check(&agent, "c", "t", 0.0, 0.0) {
            Err(AgentComError::RateLimited { retry_after_secs, .. }) => retry_after_secs,
            _ => panic!("expected rate limited"),
        };
        assert!(second >= RATE_LIMIT_BACKOFF_CURVE_SECS[0]);
    }

    #[test]
    fn test_prune_dormant_removes_idle_buckets() {
        let limiter = AgentRateLimiter::new();
        limiter.check(&"agent-1".to_string(), "c", "t", 5.0, 1.0).unwrap();
        assert_eq!(limiter.len(), 1);
        let removed = limiter.prune_dormant(-1);
        assert_eq!(removed, 1);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_remaining_below_20_percent_returns_warn() {
        let limiter = AgentRateLimiter::new();
        let agent = "agent-1".to_string();
        // capacity 5, no refill: tokens go 5 -> 4 -> 3 -> 2 -> 1 -> 0.
        // 20% of 5 is 1.0, so the 4th check (remaining 1.0) is still
        // Allow and the 5th (remaining 0.0) crosses into Warn.
        for _ in 0..3 {
            assert!(matches!(
                limiter.check(&agent, "c", "t", 5.0, 0.0).unwrap(),
                RateDecision::Allow { .. }
            ));
        }
        assert!(matches!(
            limiter.check(&agent, "c", "t", 5.0, 0.0).unwrap(),
            RateDecision::Allow { remaining } if remaining == 1.0
        ));
        assert!(matches!(
            limiter.check(&agent, "c", "t", 5.0, 0.0).unwrap(),
            RateDecision::Warn { remaining } if remaining == 0.0
        ));
    }

    #[test]
    fn test_whitelisted_agent_is_always_exempt() {
        let limiter = AgentRateLimiter::new();
        let agent = "agent-1".to_string();
        limiter.add_to_whitelist(&agent);
        for _ in 0..10 {
            assert_eq!(limiter.check(&agent, "c", "t", 1.0, 0.0).unwrap(), RateDecision::Exempt);
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_override_replaces_default_capacity_and_resets_bucket() {
        let limiter = AgentRateLimiter::new();
        let agent = "agent-1".to_string();
        limiter.check(&agent, "c", "t", 1.0, 0.0).unwrap();
        assert!(limiter.check(&agent, "c", "t", 1.0, 0.0).is_err());

        limiter.set_override(&agent, RateOverride { capacity: Some(10.0), refill_per_sec: Some(0.0) });
        // bucket was reset, so the override's higher capacity applies immediately
        assert!(limiter.check(&agent, "c", "t", 1.0, 0.0).is_ok());
        let status = limiter.agent_rate_status(&agent);
        assert_eq!(status.buckets[0].capacity, 10.0);
    }

    #[test]
    fn test_system_rate_summary_counts_tracked_agents() {
        let limiter = AgentRateLimiter::new();
        limiter.check(&"agent-1".to_string(), "c", "t", 5.0, 0.0).unwrap();
        limiter.add_to_whitelist(&"agent-2".to_string());
        let summary = limiter.system_rate_summary();
        assert_eq!(summary.tracked_agents, 1);
        assert_eq!(summary.whitelisted_agents, 1);
    }
}
