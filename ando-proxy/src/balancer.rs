//! Load balancer (C6). No teacher counterpart beyond a bare `lb_type`
//! string field and `Upstream::first_node()`. All strategies filter
//! against the passive outlier detector's (and, transitively, the active
//! health prober's) `healthy` flag before selecting a target.

use crate::outlier::PassiveOutlierDetector;
use ando_core::canary::{CanaryGroup, CanaryStrategy};
use ando_core::error::AndoError;
use ando_core::upstream::Upstream;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Targets eligible for selection: `(addr, weight)` pairs already filtered
/// down to the healthy set by the caller.
type HealthyTargets<'a> = Vec<(&'a str, u32)>;

fn healthy_targets<'a>(upstream: &'a Upstream, upstream_id: &str, outlier: &PassiveOutlierDetector) -> HealthyTargets<'a> {
    upstream
        .nodes
        .iter()
        .filter(|(addr, _)| outlier.is_healthy(upstream_id, addr))
        .map(|(addr, weight)| (addr.as_str(), *weight))
        .collect()
}

pub trait LoadBalancer: Send + Sync {
    /// Select a target address for `upstream`. `client_key` is used by
    /// strategies that need request affinity (IP hash, canary percentage).
    fn select(
        &self,
        upstream_id: &str,
        upstream: &Upstream,
        outlier: &PassiveOutlierDetector,
        client_key: &str,
    ) -> Result<String, AndoError>;
}

// ── Round robin ──────────────────────────────────────────────────────

/// Counters keyed per upstream id — a single shared instance can serve
/// every round-robin upstream in a worker without their sequences
/// interfering with each other.
#[derive(Default)]
pub struct RoundRobin {
    counters: DashMap<String, AtomicUsize>,
}

impl LoadBalancer for RoundRobin {
    fn select(
        &self,
        upstream_id: &str,
        upstream: &Upstream,
        outlier: &PassiveOutlierDetector,
        _client_key: &str,
    ) -> Result<String, AndoError> {
        let targets = healthy_targets(upstream, upstream_id, outlier);
        if targets.is_empty() {
            return Err(AndoError::NoHealthyTarget(upstream_id.to_string()));
        }
        let counter = self.counters.entry(upstream_id.to_string()).or_default();
        let idx = counter.fetch_add(1, Ordering::Relaxed) % targets.len();
        Ok(targets[idx].0.to_string())
    }
}

// ── Smooth weighted round robin ──────────────────────────────────────

/// Classic smooth weighted round-robin: each target carries a
/// `current_weight` that accumulates its configured weight every pick;
/// the highest `current_weight` is selected and then decremented by the
/// sum of all weights. Produces an evenly-interleaved sequence rather
/// than clumping picks of the heaviest target together.
pub struct SmoothWeighted {
    current_weights: DashMap<(String, String), i64>,
}

impl SmoothWeighted {
    pub fn new() -> Self {
        Self { current_weights: DashMap::new() }
    }
}

impl Default for SmoothWeighted {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for SmoothWeighted {
    fn select(
        &self,
        upstream_id: &str,
        upstream: &Upstream,
        outlier: &PassiveOutlierDetector,
        _client_key: &str,
    ) -> Result<String, AndoError> {
        let targets = healthy_targets(upstream, upstream_id, outlier);
        if targets.is_empty() {
            return Err(AndoError::NoHealthyTarget(upstream_id.to_string()));
        }
        let total: i64 = targets.iter().map(|(_, w)| *w as i64).sum();

        let mut best: Option<(&str, i64)> = None;
        for (addr, weight) in &targets {
            let key = (upstream_id.to_string(), addr.to_string());
            let mut cw = self.current_weights.entry(key).or_insert(0);
            *cw += *weight as i64;
            if best.is_none_or(|(_, bw)| *cw > bw) {
                best = Some((addr, *cw));
            }
        }

        let (chosen, _) = best.expect("targets is non-empty");
        let key = (upstream_id.to_string(), chosen.to_string());
        if let Some(mut cw) = self.current_weights.get_mut(&key) {
            *cw -= total;
        }
        Ok(chosen.to_string())
    }
}

// ── IP hash ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct IpHash;

impl LoadBalancer for IpHash {
    fn select(
        &self,
        upstream_id: &str,
        upstream: &Upstream,
        outlier: &PassiveOutlierDetector,
        client_key: &str,
    ) -> Result<String, AndoError> {
        let targets = healthy_targets(upstream, upstream_id, outlier);
        if targets.is_empty() {
            return Err(AndoError::NoHealthyTarget(upstream_id.to_string()));
        }
        let mut hasher = DefaultHasher::new();
        client_key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % targets.len();
        Ok(targets[idx].0.to_string())
    }
}

// ── Canary ────────────────────────────────────────────────────────────

/// Delegates to the matched `CanaryGroup`'s strategy. `Weighted` reuses
/// `SmoothWeighted` over the group's version upstreams; `Percentage`
/// hashes the client key mod 10,000 buckets; `Header`/`Cookie` match a
/// version directly off a request field, falling back to the first
/// version if absent.
pub struct Canary {
    weighted: SmoothWeighted,
    version_rr: RoundRobin,
}

impl Canary {
    pub fn new() -> Self {
        Self { weighted: SmoothWeighted::new(), version_rr: RoundRobin::default() }
    }

    /// `header_or_cookie_value` is the value of the configured header/cookie
    /// name, already extracted by the caller (proxy-level, not plugin-level,
    /// since the balancer has no access to raw request headers). Returns
    /// `(upstream_id, addr)` so the caller can report the outcome back to
    /// the outlier detector against the version's own upstream id.
    pub fn select_for_group(
        &self,
        group: &CanaryGroup,
        upstreams: &std::collections::HashMap<String, Upstream>,
        outlier: &PassiveOutlierDetector,
        client_key: &str,
        header_or_cookie_value: Option<&str>,
    ) -> Result<(String, String), AndoError> {
        match &group.strategy {
            CanaryStrategy::Weighted => {
                let synthetic = Upstream {
                    id: Some(group.group_id.clone()),
                    name: None,
                    nodes: group
                        .versions
                        .iter()
                        .map(|v| (v.upstream_id.clone(), v.weight.unwrap_or(1)))
                        .collect(),
                    lb_type: "roundrobin".to_string(),
                    health_check: None,
                    connect_timeout_ms: None,
                    read_timeout_ms: None,
                    write_timeout_ms: None,
                    pass_host: "pass".to_string(),
                    upstream_host: None,
                    retries: 1,
                    desc: None,
                    labels: Default::default(),
                };
                let version_id = self.weighted.select(&group.group_id, &synthetic, outlier, client_key)?;
                self.resolve_version(&version_id, group, upstreams, outlier, client_key)
            }
            CanaryStrategy::Percentage => {
                let mut hasher = DefaultHasher::new();
                client_key.hash(&mut hasher);
                let bucket = (hasher.finish() % 10_000) as f64 / 100.0;
                let mut cumulative = 0.0;
                for v in &group.versions {
                    cumulative += v.percentage.unwrap_or(0.0);
                    if bucket < cumulative {
                        return self.resolve_version(&v.upstream_id, group, upstreams, outlier, client_key);
                    }
                }
                let last = group.versions.last().ok_or_else(|| AndoError::NoHealthyTarget(group.group_id.clone()))?;
                self.resolve_version(&last.upstream_id, group, upstreams, outlier, client_key)
            }
            CanaryStrategy::Header { .. } | CanaryStrategy::Cookie { .. } => {
                let matched = header_or_cookie_value
                    .and_then(|v| group.versions.iter().find(|ver| ver.version == v))
                    .or_else(|| group.versions.first());
                match matched {
                    Some(v) => self.resolve_version(&v.upstream_id, group, upstreams, outlier, client_key),
                    None => Err(AndoError::NoHealthyTarget(group.group_id.clone())),
                }
            }
        }
    }

    fn resolve_version(
        &self,
        upstream_id: &str,
        group: &CanaryGroup,
        upstreams: &std::collections::HashMap<String, Upstream>,
        outlier: &PassiveOutlierDetector,
        client_key: &str,
    ) -> Result<(String, String), AndoError> {
        let upstream = upstreams
            .get(upstream_id)
            .ok_or_else(|| AndoError::UpstreamNotFound(upstream_id.to_string()))?;
        let addr = self
            .version_rr
            .select(upstream_id, upstream, outlier, client_key)
            .map_err(|_| AndoError::NoHealthyTarget(group.group_id.clone()))?;
        Ok((upstream_id.to_string(), addr))
    }
}

impl Default for Canary {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn upstream(nodes: &[(&str, u32)]) -> Upstream {
        Upstream {
            id: Some("u1".into()),
            name: None,
            nodes: nodes.iter().map(|(a, w)| (a.to_string(), *w)).collect(),
            lb_type: "roundrobin".into(),
            health_check: None,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            write_timeout_ms: None,
            pass_host: "pass".into(),
            upstream_host: None,
            retries: 1,
            desc: None,
            labels: HashMap::new(),
        }
    }

    #[test]
    fn round_robin_cycles_through_targets() {
        let lb = RoundRobin::default();
        let ups = upstream(&[("a", 1), ("b", 1)]);
        let outlier = PassiveOutlierDetector::default();
        let picks: Vec<String> = (0..4).map(|_| lb.select("u1", &ups, &outlier, "x").unwrap()).collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn round_robin_no_healthy_targets_errors() {
        let lb = RoundRobin::default();
        let ups = upstream(&[("a", 1)]);
        let outlier = PassiveOutlierDetector::default();
        outlier.record_request("u1", "a", None, true, true);
        outlier.record_request("u1", "a", None, true, true);
        outlier.record_request("u1", "a", None, true, true);
        outlier.record_request("u1", "a", None, true, true);
        outlier.record_request("u1", "a", None, true, true);
        assert!(matches!(lb.select("u1", &ups, &outlier, "x"), Err(AndoError::NoHealthyTarget(_))));
    }

    #[test]
    fn smooth_weighted_respects_ratio_over_many_picks() {
        let lb = SmoothWeighted::new();
        let ups = upstream(&[("a", 3), ("b", 1)]);
        let outlier = PassiveOutlierDetector::default();
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..400 {
            let pick = lb.select("u1", &ups, &outlier, "x").unwrap();
            *counts.entry(pick).or_insert(0) += 1;
        }
        let a = *counts.get("a").unwrap() as f64;
        let b = *counts.get("b").unwrap() as f64;
        assert!((a / b - 3.0).abs() < 0.2, "expected ~3:1 ratio, got {a}:{b}");
    }

    #[test]
    fn ip_hash_is_stable_for_same_key() {
        let lb = IpHash;
        let ups = upstream(&[("a", 1), ("b", 1), ("c", 1)]);
        let outlier = PassiveOutlierDetector::default();
        let first = lb.select("u1", &ups, &outlier, "1.2.3.4").unwrap();
        for _ in 0..10 {
            assert_eq!(lb.select("u1", &ups, &outlier, "1.2.3.4").unwrap(), first);
        }
    }

    // E3: canary 80/20 distribution
    #[test]
    fn canary_percentage_distributes_approximately() {
        let group = CanaryGroup {
            group_id: "g1".into(),
            strategy: CanaryStrategy::Percentage,
            versions: vec![
                ando_core::canary::VersionSpec {
                    version: "stable".into(),
                    upstream_id: "u-stable".into(),
                    weight: None,
                    percentage: Some(80.0),
                },
                ando_core::canary::VersionSpec {
                    version: "canary".into(),
                    upstream_id: "u-canary".into(),
                    weight: None,
                    percentage: Some(20.0),
                },
            ],
            desc: None,
        };
        let mut upstreams = HashMap::new();
        upstreams.insert("u-stable".to_string(), upstream(&[("10.0.0.1:80", 1)]));
        upstreams.insert("u-canary".to_string(), upstream(&[("10.0.0.2:80", 1)]));
        let outlier = PassiveOutlierDetector::default();
        let canary = Canary::new();

        let mut stable = 0;
        let mut canary_count = 0;
        for i in 0..1000 {
            let key = format!("client-{i}");
            let (_, addr) = canary.select_for_group(&group, &upstreams, &outlier, &key, None).unwrap();
            if addr == "10.0.0.1:80" {
                stable += 1;
            } else {
                canary_count += 1;
            }
        }
        let ratio = stable as f64 / canary_count as f64;
        assert!((ratio - 4.0).abs() < 1.0, "expected ~80/20 split, got {stable}/{canary_count}");
    }

    #[test]
    fn canary_header_strategy_falls_back_to_first_version() {
        let group = CanaryGroup {
            group_id: "g1".into(),
            strategy: CanaryStrategy::Header { name: "x-version".into() },
            versions: vec![
                ando_core::canary::VersionSpec {
                    version: "stable".into(),
                    upstream_id: "u-stable".into(),
                    weight: None,
                    percentage: None,
                },
                ando_core::canary::VersionSpec {
                    version: "canary".into(),
                    upstream_id: "u-canary".into(),
                    weight: None,
                    percentage: None,
                },
            ],
            desc: None,
        };
        let mut upstreams = HashMap::new();
        upstreams.insert("u-stable".to_string(), upstream(&[("10.0.0.1:80", 1)]));
        upstreams.insert("u-canary".to_string(), upstream(&[("10.0.0.2:80", 1)]));
        let outlier = PassiveOutlierDetector::default();
        let canary = Canary::new();

        let (_, addr) = canary.select_for_group(&group, &upstreams, &outlier, "x", None).unwrap();
        assert_eq!(addr, "10.0.0.1:80", "no header value present must fall back to first version");

        let (_, addr) = canary.select_for_group(&group, &upstreams, &outlier, "x", Some("canary")).unwrap();
        assert_eq!(addr, "10.0.0.2:80");
    }
}
