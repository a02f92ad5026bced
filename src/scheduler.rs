//! Watch-driven reconciliation loop
//!
//! Consumes a server-filtered watch over pods that declared our scheduler
//! name and have no node assigned, and drives each arrival through the
//! placement pipeline: parse annotation, resolve ordinal, resolve physical
//! node, bind. The server-side field selector keeps the loop stateless -
//! already-placed pods never reach us.
//!
//! Stream lifecycle is a small state machine: a normal stream end (the
//! periodic watch timeout) is a refresh and resets the retry counter; a 410
//! cursor expiry restarts the stream immediately without counting; any other
//! error backs off exponentially with jitter and, after a bounded number of
//! consecutive failures, terminates the process for external restart.

use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assignment::{ordinal_from_name, parse_assignment_map, Assignment, ParsePolicy};
use crate::binding::{dispatch_binding, BindingIntent};
use crate::node::resolve_physical_node;
use crate::{Error, Result, SCHEDULER_NAME, SCHEDULING_MAP_ANNOTATION};

/// Pause between stream teardown and reopen, so sustained API unavailability
/// does not turn into a tight failure loop
const REOPEN_PAUSE: Duration = Duration::from_millis(100);

/// Tunables for the watch loop
#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    /// Scheduler name pods must declare to be picked up
    pub scheduler_name: String,
    /// Consecutive watch failures tolerated before terminating
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Server-side watch timeout; each expiry is a periodic stream refresh
    pub watch_timeout_secs: u32,
    /// Malformed-line policy for annotation parsing
    pub parse_policy: ParsePolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scheduler_name: SCHEDULER_NAME.to_string(),
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            watch_timeout_secs: 290,
            parse_policy: ParsePolicy::default(),
        }
    }
}

/// Compute the backoff delay for the given consecutive-failure count.
///
/// `min(base * 2^attempt, cap)`, a pure function of the attempt count so it
/// is testable without real time. Jitter is added separately by
/// [`jittered`].
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(32) as i32);
    Duration::from_secs_f64(exp.min(cap.as_secs_f64()))
}

/// Add uniform jitter in `[0, 1)` seconds to a backoff delay
pub fn jittered(delay: Duration) -> Duration {
    delay + Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0))
}

/// Consecutive-failure counter with a fixed budget.
///
/// Successful event processing resets the counter, so only unbroken runs of
/// failures escalate to termination.
#[derive(Debug)]
pub struct RetryBudget {
    attempts: u32,
    max: u32,
}

impl RetryBudget {
    /// Create a budget allowing `max` consecutive failures
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    /// Record a failure; returns false once the budget is exhausted
    pub fn record_failure(&mut self) -> bool {
        self.attempts += 1;
        self.attempts < self.max
    }

    /// Reset after successful event processing
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Current consecutive-failure count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// What to do about a failed watch pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureAction {
    /// Cursor expired: reopen immediately, no backoff, no counting
    RestartNow,
    /// Transient failure: back off, then reopen
    Backoff,
    /// Budget exhausted: stop and propagate a fatal error
    Terminate,
}

/// Classify a watch-pass failure against the retry budget.
///
/// Cursor expiry resets the counter outright: the stream position going
/// stale says nothing about API health, so prior failures stop counting
/// toward escalation.
pub fn classify_failure(budget: &mut RetryBudget, err: &Error) -> FailureAction {
    if err.is_cursor_expired() {
        budget.reset();
        FailureAction::RestartNow
    } else if budget.record_failure() {
        FailureAction::Backoff
    } else {
        FailureAction::Terminate
    }
}

/// Resolve the assignment that applies to this pod, from its own annotation.
///
/// Every "no data" stage (missing annotation, unparseable map, unresolvable
/// ordinal, ordinal absent from the map) is logged and yields `None` - the
/// pod stays unscheduled pending a future event or operator intervention.
pub fn resolve_assignment(pod: &Pod, policy: ParsePolicy) -> Option<Assignment> {
    let name = pod.metadata.name.as_deref()?;
    let raw = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SCHEDULING_MAP_ANNOTATION))?;

    let map = parse_assignment_map(raw, policy);
    if map.is_empty() {
        warn!(pod = %name, "No valid entries in scheduling map");
        return None;
    }

    let Some(ordinal) = ordinal_from_name(name) else {
        warn!(pod = %name, "Could not determine replica ordinal from pod name");
        return None;
    };

    match map.get(&ordinal) {
        Some(assignment) => Some(assignment.clone()),
        None => {
            warn!(pod = %name, ordinal, "No scheduling assignment for this ordinal");
            None
        }
    }
}

/// Run the full placement pipeline for one observed pod.
///
/// Stage failures here are not stream failures: the original event was
/// delivered fine, the pod just cannot be placed right now. Everything is
/// logged and the loop moves on.
async fn process_pod(client: &Client, config: &ReconcilerConfig, pod: &Pod) {
    let Some(name) = pod.metadata.name.clone() else {
        return;
    };
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    let Some(assignment) = resolve_assignment(pod, config.parse_policy) else {
        return;
    };

    info!(
        pod = %name,
        ordinal = assignment.ordinal,
        logical_node = %assignment.logical_node,
        "Processing pod with GPU scheduling assignment"
    );

    let physical_node = match resolve_physical_node(client, &assignment.logical_node).await {
        Ok(Some(node)) => node,
        Ok(None) => {
            error!(
                pod = %name,
                logical_node = %assignment.logical_node,
                "Could not map logical node to a physical node"
            );
            return;
        }
        Err(e) => {
            error!(pod = %name, error = %e, "Node listing failed during resolution");
            return;
        }
    };

    let intent = BindingIntent {
        pod_name: name.clone(),
        namespace,
        target_node: physical_node,
        device_set: assignment.device_set,
    };

    if let Err(e) = dispatch_binding(client, &intent).await {
        error!(pod = %name, error = %e, "Failed to bind pod");
    }
}

/// Why a watch pass ended without error
enum Pass {
    /// Stream reached its periodic timeout; reopen with a fresh list
    Refreshed,
    /// Shutdown was requested
    Cancelled,
}

/// One list-then-watch cycle over unscheduled opted-in pods.
///
/// The initial list replays pods that were already pending when the stream
/// opened (or while it was down), matching watch semantics where existing
/// objects arrive as ADDED events.
async fn watch_pass(
    pods: &Api<Pod>,
    client: &Client,
    config: &ReconcilerConfig,
    budget: &mut RetryBudget,
    cancel: &CancellationToken,
) -> Result<Pass> {
    let selector = format!("spec.schedulerName={},spec.nodeName=", config.scheduler_name);

    let initial = pods.list(&ListParams::default().fields(&selector)).await?;
    let resource_version = initial
        .metadata
        .resource_version
        .unwrap_or_else(|| "0".to_string());

    for pod in &initial.items {
        if cancel.is_cancelled() {
            return Ok(Pass::Cancelled);
        }
        info!(pod = ?pod.metadata.name, "Pending pod to schedule");
        process_pod(client, config, pod).await;
        budget.reset();
    }

    let wp = WatchParams::default()
        .fields(&selector)
        .timeout(config.watch_timeout_secs);
    let mut stream = pods.watch(&wp, &resource_version).await?.boxed();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(Pass::Cancelled),
            event = stream.try_next() => event?,
        };

        match event {
            Some(WatchEvent::Added(pod)) => {
                info!(pod = ?pod.metadata.name, "New pod to schedule");
                process_pod(client, config, &pod).await;
                budget.reset();
            }
            Some(WatchEvent::Modified(_) | WatchEvent::Deleted(_) | WatchEvent::Bookmark(_)) => {
                // Only ADDED drives placement; the field selector already
                // removes pods once they are bound.
            }
            Some(WatchEvent::Error(resp)) => {
                return Err(Error::Kube(kube::Error::Api(resp)));
            }
            None => return Ok(Pass::Refreshed),
        }
    }
}

/// Run the scheduler until cancelled or the retry budget is exhausted.
///
/// Returns `Ok(())` on cooperative shutdown and
/// [`Error::RetriesExhausted`] when consecutive watch failures hit the
/// configured maximum; the process owner is expected to restart us.
pub async fn run(client: Client, config: ReconcilerConfig, cancel: CancellationToken) -> Result<()> {
    info!(scheduler = %config.scheduler_name, "Starting GPU scheduler watch loop");

    let pods: Api<Pod> = Api::all(client.clone());
    let mut budget = RetryBudget::new(config.max_retries);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        debug!(attempt = budget.attempts() + 1, "Opening watch stream");

        match watch_pass(&pods, &client, &config, &mut budget, &cancel).await {
            Ok(Pass::Cancelled) => break,
            Ok(Pass::Refreshed) => {
                debug!("Watch stream reached refresh boundary, reopening");
                budget.reset();
            }
            Err(e) => match classify_failure(&mut budget, &e) {
                FailureAction::RestartNow => {
                    warn!(error = %e, "Watch cursor expired, restarting from a fresh list");
                }
                FailureAction::Backoff => {
                    let delay = jittered(backoff_delay(
                        budget.attempts(),
                        config.base_delay,
                        config.max_delay,
                    ));
                    warn!(
                        error = %e,
                        attempt = budget.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Watch failed, backing off before reopening"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                FailureAction::Terminate => {
                    error!(
                        attempts = budget.attempts(),
                        error = %e,
                        "Watch retry budget exhausted, stopping"
                    );
                    return Err(Error::RetriesExhausted {
                        attempts: budget.attempts(),
                        last: e.to_string(),
                    });
                }
            },
        }

        tokio::time::sleep(REOPEN_PAUSE).await;
    }

    info!("Scheduler watch loop stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use kube::core::ErrorResponse;
    use std::collections::BTreeMap;

    fn annotated_pod(name: &str, map: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(BTreeMap::from([(
                    SCHEDULING_MAP_ANNOTATION.to_string(),
                    map.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn gone() -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "too old resource version".to_string(),
            reason: "Expired".to_string(),
            code: 410,
        }))
    }

    fn transient() -> Error {
        Error::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "internal error".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(backoff_delay(1, base, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, base, cap), Duration::from_secs(4));
        assert_eq!(backoff_delay(5, base, cap), Duration::from_secs(32));
        assert_eq!(backoff_delay(6, base, cap), Duration::from_secs(60));
        assert_eq!(backoff_delay(30, base, cap), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_one_second() {
        let base = Duration::from_secs(2);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d < base + Duration::from_secs(1));
        }
    }

    #[test]
    fn five_consecutive_failures_terminate() {
        let mut budget = RetryBudget::new(5);
        let err = transient();
        for _ in 0..4 {
            assert_eq!(classify_failure(&mut budget, &err), FailureAction::Backoff);
        }
        assert_eq!(classify_failure(&mut budget, &err), FailureAction::Terminate);
        assert_eq!(budget.attempts(), 5);
    }

    #[test]
    fn cursor_expiry_never_increments_the_counter() {
        let mut budget = RetryBudget::new(5);
        for _ in 0..20 {
            assert_eq!(
                classify_failure(&mut budget, &gone()),
                FailureAction::RestartNow
            );
        }
        assert_eq!(budget.attempts(), 0);
    }

    #[test]
    fn cursor_expiry_resets_prior_failures() {
        let mut budget = RetryBudget::new(5);
        let err = transient();
        for _ in 0..4 {
            classify_failure(&mut budget, &err);
        }
        assert_eq!(budget.attempts(), 4);
        assert_eq!(
            classify_failure(&mut budget, &gone()),
            FailureAction::RestartNow
        );
        assert_eq!(budget.attempts(), 0);
        // The next stretch of failures gets the full budget again
        assert_eq!(classify_failure(&mut budget, &err), FailureAction::Backoff);
        assert_eq!(budget.attempts(), 1);
    }

    #[test]
    fn success_resets_escalation() {
        // Escalation only triggers on consecutive failures: a processed
        // event between failures starts the count over.
        let mut budget = RetryBudget::new(5);
        let err = transient();
        for _ in 0..4 {
            assert_eq!(classify_failure(&mut budget, &err), FailureAction::Backoff);
        }
        budget.reset();
        assert_eq!(classify_failure(&mut budget, &err), FailureAction::Backoff);
        assert_eq!(budget.attempts(), 1);
    }

    #[test]
    fn resolves_assignment_for_matching_ordinal() {
        let pod = annotated_pod("my-app-0", "0=node1:0,1\n1=node2:2");
        let assignment = resolve_assignment(&pod, ParsePolicy::default()).unwrap();
        assert_eq!(assignment.logical_node, "node1");
        assert_eq!(assignment.device_set, "0,1");
    }

    #[test]
    fn no_assignment_when_ordinal_missing_from_map() {
        let pod = annotated_pod("my-app-7", "0=node1:0,1");
        assert!(resolve_assignment(&pod, ParsePolicy::default()).is_none());
    }

    #[test]
    fn no_assignment_for_unresolvable_name() {
        let pod = annotated_pod("no-index", "0=node1:0,1");
        assert!(resolve_assignment(&pod, ParsePolicy::default()).is_none());
    }

    #[test]
    fn no_assignment_without_annotation() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("my-app-0".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(resolve_assignment(&pod, ParsePolicy::default()).is_none());
    }

    #[test]
    fn config_defaults_match_contract() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.scheduler_name, SCHEDULER_NAME);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
    }
}
