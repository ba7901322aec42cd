//! Small Kubernetes helpers shared by the controllers
//!
//! Finalizer list edits, Node health inspection, LoadBalancer address
//! lookup, duration parsing and random name generation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use rand::distributions::{Distribution, Uniform};
use serde::Serialize;

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Error;

/// Label selector matching control-plane Nodes
pub const CONTROL_PLANE_SELECTOR: &str = "node-role.kubernetes.io/control-plane=true";

/// Create a client from the in-cluster or local kubeconfig
///
/// Connection failures are retried a few times; a freshly scheduled operator
/// pod can start before its service account token is mounted.
pub async fn create_client() -> Result<Client, Error> {
    retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "create_client",
        |_| true,
        || async { Client::try_default().await },
    )
    .await
    .map_err(Error::from)
}

// =============================================================================
// Finalizers
// =============================================================================

/// Check whether `meta` carries `finalizer`
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Finalizer list with `finalizer` appended, or `None` if it is already present
pub fn finalizers_with(meta: &ObjectMeta, finalizer: &str) -> Option<Vec<String>> {
    if has_finalizer(meta, finalizer) {
        return None;
    }
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_string());
    Some(finalizers)
}

/// Finalizer list with every occurrence of `finalizer` removed
pub fn finalizers_without(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().filter(|s| *s != finalizer).cloned().collect())
        .unwrap_or_default()
}

/// Merge patch replacing the finalizer list
pub fn finalizer_patch(finalizers: &[String]) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    })
}

/// Merge patch replacing the status subresource
pub fn status_patch<S: Serialize>(status: &S) -> serde_json::Value {
    serde_json::json!({ "status": status })
}

// =============================================================================
// Nodes and Services
// =============================================================================

/// Health of a cluster member as reported by its `Ready` condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeHealth {
    /// `Ready` is `True`
    Ready,
    /// `Ready` is `False` or `Unknown`, or missing
    NotReady {
        /// When the condition last changed, if reported
        since: Option<DateTime<Utc>>,
    },
}

/// Inspect a Node's `Ready` condition
pub fn node_health(node: &Node) -> NodeHealth {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"));

    match ready {
        Some(c) if c.status == "True" => NodeHealth::Ready,
        Some(c) => NodeHealth::NotReady {
            since: c.last_transition_time.as_ref().map(|t| t.0),
        },
        None => NodeHealth::NotReady { since: None },
    }
}

/// Time left before an unhealthy member has been unhealthy for `wait`
///
/// Returns `Duration::ZERO` once the wait has elapsed. A `since` in the
/// future counts as no time elapsed.
pub fn remaining_unhealthy_wait(
    since: DateTime<Utc>,
    wait: Duration,
    now: DateTime<Utc>,
) -> Duration {
    let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
    wait.saturating_sub(elapsed)
}

/// External address of a LoadBalancer Service (IP preferred over hostname)
pub fn load_balancer_address(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| {
            i.ip.clone()
                .filter(|ip| !ip.is_empty())
                .or_else(|| i.hostname.clone().filter(|h| !h.is_empty()))
        })
}

// =============================================================================
// Durations
// =============================================================================

/// Parse a duration string such as `30s`, `10m`, `1h30m` or `1h0m0s`
///
/// Units are `ms`, `s`, `m` and `h`; components may repeat in any order and
/// are summed. A bare `0` is accepted.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration '{s}'"))?;
        if digits == 0 {
            return Err(format!("expected a number in duration '{s}'"));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in duration '{s}'"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(format!("unknown unit '{other}' in duration '{s}'")),
        };
        rest = &rest[unit_len..];

        total = Duration::try_from_secs_f64(value * seconds_per_unit)
            .ok()
            .and_then(|component| total.checked_add(component))
            .ok_or_else(|| format!("duration out of range '{s}'"))?;
    }
    Ok(total)
}

// =============================================================================
// Random names
// =============================================================================

/// Random string of `len` lowercase ASCII letters
pub fn random_lowercase(len: usize) -> String {
    let letters = Uniform::new_inclusive(b'a', b'z');
    let mut rng = rand::thread_rng();
    (0..len).map(|_| letters.sample(&mut rng) as char).collect()
}

/// Random string of `len` mixed-case ASCII letters
pub fn random_letters(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let index = Uniform::new(0, ALPHABET.len());
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[index.sample(&mut rng)] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, NodeCondition, NodeStatus, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn node_with_ready(status: &str, since: Option<DateTime<Utc>>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    last_transition_time: since.map(Time),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn parses_simple_and_compound_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1h0m0s").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("1h-5m").is_err());
    }

    #[test]
    fn out_of_range_durations_are_errors() {
        let huge = parse_duration("99999999999999999999999h").unwrap_err();
        assert!(huge.contains("out of range"));
        let overflowing =
            parse_duration("18000000000000000000s18000000000000000000s").unwrap_err();
        assert!(overflowing.contains("out of range"));
    }

    #[test]
    fn finalizer_edits_are_idempotent() {
        let mut meta = ObjectMeta::default();
        let added = finalizers_with(&meta, "a/b").unwrap();
        assert_eq!(added, vec!["a/b"]);

        meta.finalizers = Some(added);
        assert!(has_finalizer(&meta, "a/b"));
        assert_eq!(finalizers_with(&meta, "a/b"), None);

        meta.finalizers = Some(vec!["other".into(), "a/b".into()]);
        assert_eq!(finalizers_without(&meta, "a/b"), vec!["other"]);
        assert!(finalizers_without(&ObjectMeta::default(), "a/b").is_empty());
    }

    #[test]
    fn ready_node_is_healthy() {
        assert_eq!(node_health(&node_with_ready("True", None)), NodeHealth::Ready);
    }

    #[test]
    fn not_ready_node_reports_transition_time() {
        let since = Utc::now();
        assert_eq!(
            node_health(&node_with_ready("Unknown", Some(since))),
            NodeHealth::NotReady { since: Some(since) }
        );
        assert_eq!(
            node_health(&Node::default()),
            NodeHealth::NotReady { since: None }
        );
    }

    #[test]
    fn remaining_wait_counts_down_to_zero() {
        let now = Utc::now();
        let wait = Duration::from_secs(600);

        let since = now - chrono::Duration::seconds(240);
        assert_eq!(
            remaining_unhealthy_wait(since, wait, now),
            Duration::from_secs(360)
        );

        let since = now - chrono::Duration::seconds(900);
        assert_eq!(remaining_unhealthy_wait(since, wait, now), Duration::ZERO);

        let clock_skew = now + chrono::Duration::seconds(30);
        assert_eq!(remaining_unhealthy_wait(clock_skew, wait, now), wait);
    }

    #[test]
    fn load_balancer_address_prefers_ip() {
        let svc = |ip: Option<&str>, hostname: Option<&str>| Service {
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: ip.map(String::from),
                        hostname: hostname.map(String::from),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            load_balancer_address(&svc(Some("1.2.3.4"), Some("lb.example"))).as_deref(),
            Some("1.2.3.4")
        );
        assert_eq!(
            load_balancer_address(&svc(None, Some("lb.example"))).as_deref(),
            Some("lb.example")
        );
        assert_eq!(load_balancer_address(&Service::default()), None);
    }

    #[test]
    fn random_strings_have_requested_shape() {
        let suffix = random_lowercase(8);
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));

        let password = random_letters(16);
        assert_eq!(password.len(), 16);
        assert!(password.chars().all(|c| c.is_ascii_alphabetic()));
    }
}
