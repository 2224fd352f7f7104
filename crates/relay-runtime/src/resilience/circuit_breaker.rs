//! Circuit breaker to prevent cascade failures.
//!
//! When a model keeps failing for an agent, its circuit opens and the
//! executor skips it (falling back to the next candidate) until the
//! cooldown ends. The first call after the cooldown is a single trial:
//! success closes the circuit, failure re-opens it.
//!
//! Circuits are keyed by `(agent, model, tenant)`. Each key has its own
//! lock, so concurrent callers on different keys never contend.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use relay_core::{BreakerSettings, ExecutionRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Identity of one circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakerKey {
    pub agent: String,
    pub model: String,
    pub tenant: Option<String>,
}

impl BreakerKey {
    pub fn new(agent: impl Into<String>, model: impl Into<String>, tenant: Option<&str>) -> Self {
        Self {
            agent: agent.into(),
            model: model.into(),
            tenant: tenant.map(str::to_string),
        }
    }

    /// Key for one candidate model of a request.
    ///
    /// The tenant is part of the key only with tenant isolation on.
    pub fn for_request(request: &ExecutionRequest, model: &str, settings: &BreakerSettings) -> Self {
        let tenant = if settings.tenant_isolation {
            request.tenant_id()
        } else {
            None
        };
        Self::new(request.agent(), model, tenant)
    }
}

impl fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent, self.model)?;
        if let Some(tenant) = &self.tenant {
            write!(f, "@{}", tenant)?;
        }
        Ok(())
    }
}

/// Observable state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Rejecting calls until the cooldown ends
    Open,

    /// Cooldown over; the next call (or the one in flight) is the trial
    HalfOpen,
}

/// Answer to "may I call this model now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed
    Allowed,

    /// Cooldown over; this caller holds the single trial
    Trial,

    /// Circuit open
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// State change caused by recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Closed -> open after reaching the error threshold
    Opened { error_count: u32, cooldown: Duration },

    /// Failed trial, open again for a fresh cooldown
    Reopened { cooldown: Duration },

    /// Successful trial
    Closed,
}

/// Snapshot of one circuit for the administrative API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub key: BreakerKey,
    pub state: CircuitState,
    pub error_count: u32,
    pub threshold: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub trial_in_flight: bool,
}

#[derive(Debug)]
struct Entry {
    settings: BreakerSettings,
    open: bool,
    error_count: u32,
    window_start: Option<Instant>,
    cooldown_until: Option<Instant>,
    trial_started: Option<Instant>,
}

impl Entry {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            open: false,
            error_count: 0,
            window_start: None,
            cooldown_until: None,
            trial_started: None,
        }
    }

    fn threshold(&self) -> u32 {
        self.settings.errors.max(1)
    }

    fn open_for(&mut self, now: Instant, cooldown: Duration) {
        self.open = true;
        self.cooldown_until = Some(now + cooldown);
        self.trial_started = None;
    }

    fn close(&mut self) {
        self.open = false;
        self.error_count = 0;
        self.window_start = None;
        self.cooldown_until = None;
        self.trial_started = None;
    }

    fn state(&self, now: Instant) -> CircuitState {
        match (self.open, self.cooldown_until) {
            (false, _) => CircuitState::Closed,
            (true, Some(until)) if now < until => CircuitState::Open,
            (true, _) => CircuitState::HalfOpen,
        }
    }
}

/// Circuit breaker store shared by every execution.
pub struct CircuitBreaker {
    circuits: RwLock<HashMap<BreakerKey, Arc<Mutex<Entry>>>>,
    defaults: BreakerSettings,
}

impl CircuitBreaker {
    /// Create a store whose circuits use `defaults` unless a request overrides them.
    pub fn new(defaults: BreakerSettings) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            defaults,
        }
    }

    /// Default settings.
    pub fn defaults(&self) -> &BreakerSettings {
        &self.defaults
    }

    /// Settings that apply to a request.
    pub fn settings_for(&self, request: &ExecutionRequest) -> BreakerSettings {
        request
            .circuit_breaker()
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    fn entry(&self, key: &BreakerKey, settings: Option<&BreakerSettings>) -> Arc<Mutex<Entry>> {
        if let Some(entry) = self.circuits.read().get(key) {
            if let Some(settings) = settings {
                entry.lock().settings = settings.clone();
            }
            return entry.clone();
        }

        let settings = settings.cloned().unwrap_or_else(|| self.defaults.clone());
        self.circuits
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Entry::new(settings))))
            .clone()
    }

    /// Ask whether a call may go through.
    ///
    /// Once the cooldown has passed, exactly one caller gets
    /// [`Admission::Trial`]; others stay rejected until the trial reports,
    /// or until one cooldown has passed without a report.
    pub fn check(&self, key: &BreakerKey, settings: &BreakerSettings) -> Admission {
        let entry = self.entry(key, Some(settings));
        let mut entry = entry.lock();
        let now = Instant::now();

        if !entry.open {
            return Admission::Allowed;
        }

        if let Some(until) = entry.cooldown_until {
            if now < until {
                return Admission::Rejected {
                    retry_after: until - now,
                };
            }
        }

        if let Some(started) = entry.trial_started {
            let elapsed = now.duration_since(started);
            if elapsed < entry.settings.cooldown {
                return Admission::Rejected {
                    retry_after: entry.settings.cooldown - elapsed,
                };
            }
            tracing::debug!(circuit = %key, "Abandoned trial expired");
        }

        entry.trial_started = Some(now);
        tracing::info!(circuit = %key, "Circuit half-open, allowing trial call");
        Admission::Trial
    }

    /// Record a successful call.
    pub fn record_success(&self, key: &BreakerKey) -> Option<Transition> {
        let entry = self.entry(key, None);
        let mut entry = entry.lock();

        if entry.open {
            // Only the trial may close an open circuit
            if entry.trial_started.is_none() {
                return None;
            }
            entry.close();
            tracing::info!(circuit = %key, "Circuit closed after successful trial");
            return Some(Transition::Closed);
        }

        entry.error_count = 0;
        entry.window_start = None;
        None
    }

    /// Record a failed call (once per exhausted candidate model).
    pub fn record_failure(&self, key: &BreakerKey) -> Option<Transition> {
        let entry = self.entry(key, None);
        let mut entry = entry.lock();
        let now = Instant::now();
        let cooldown = entry.settings.cooldown;

        if entry.open {
            if entry.trial_started.is_none() {
                return None;
            }
            entry.open_for(now, cooldown);
            tracing::warn!(circuit = %key, cooldown_secs = cooldown.as_secs(), "Circuit reopened after failed trial");
            return Some(Transition::Reopened { cooldown });
        }

        match entry.window_start {
            Some(start) if now.duration_since(start) <= entry.settings.within => {
                entry.error_count += 1;
            }
            _ => {
                entry.window_start = Some(now);
                entry.error_count = 1;
            }
        }

        if entry.error_count >= entry.threshold() {
            entry.open_for(now, cooldown);
            tracing::warn!(
                circuit = %key,
                errors = entry.error_count,
                cooldown_secs = cooldown.as_secs(),
                "Circuit opened after repeated failures"
            );
            return Some(Transition::Opened {
                error_count: entry.error_count,
                cooldown,
            });
        }

        None
    }

    /// Open a circuit regardless of its error count.
    ///
    /// Uses the circuit's own cooldown when `cooldown` is `None`.
    pub fn force_open(&self, key: &BreakerKey, cooldown: Option<Duration>) {
        let entry = self.entry(key, None);
        let mut entry = entry.lock();
        let cooldown = cooldown.unwrap_or(entry.settings.cooldown);
        entry.error_count = entry.error_count.max(entry.threshold());
        entry.open_for(Instant::now(), cooldown);
        tracing::warn!(circuit = %key, cooldown_secs = cooldown.as_secs(), "Circuit forced open");
    }

    /// Close a circuit and clear its counters.
    pub fn force_close(&self, key: &BreakerKey) {
        let entry = self.entry(key, None);
        entry.lock().close();
        tracing::info!(circuit = %key, "Circuit forced closed");
    }

    /// Forget every circuit.
    pub fn reset_all(&self) {
        self.circuits.write().clear();
        tracing::info!("All circuits reset");
    }

    /// Current state of a circuit.
    pub fn state(&self, key: &BreakerKey) -> CircuitState {
        match self.circuits.read().get(key) {
            Some(entry) => entry.lock().state(Instant::now()),
            None => CircuitState::Closed,
        }
    }

    /// Snapshot of one circuit, if it has been used.
    pub fn status(&self, key: &BreakerKey) -> Option<BreakerStatus> {
        let entry = self.circuits.read().get(key).cloned()?;
        let entry = entry.lock();
        Some(Self::snapshot(key, &entry))
    }

    /// Snapshots of every known circuit, ordered by key.
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let circuits: Vec<_> = self
            .circuits
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut statuses: Vec<_> = circuits
            .iter()
            .map(|(key, entry)| Self::snapshot(key, &entry.lock()))
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    fn snapshot(key: &BreakerKey, entry: &Entry) -> BreakerStatus {
        let now = Instant::now();
        let cooldown_until = entry
            .cooldown_until
            .filter(|_| entry.open)
            .map(|until| wall_clock(now, until));

        BreakerStatus {
            key: key.clone(),
            state: entry.state(now),
            error_count: entry.error_count,
            threshold: entry.threshold(),
            cooldown_until,
            trial_in_flight: entry.open && entry.trial_started.is_some(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

/// Wall-clock time of a monotonic instant.
pub(crate) fn wall_clock(now: Instant, at: Instant) -> DateTime<Utc> {
    let wall = Utc::now();
    let offset = |d: Duration| chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero());
    if at >= now {
        wall + offset(at - now)
    } else {
        wall - offset(now - at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(errors: u32, within: u64, cooldown: u64) -> BreakerSettings {
        BreakerSettings::new(errors, Duration::from_secs(within), Duration::from_secs(cooldown))
    }

    fn key() -> BreakerKey {
        BreakerKey::new("triage", "gpt-4o", Some("acme"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.check(&key(), cb.defaults()), Admission::Allowed);
        assert_eq!(cb.state(&key()), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold() {
        let cb = CircuitBreaker::new(settings(3, 60, 300));
        let s = cb.defaults().clone();
        cb.check(&key(), &s);

        assert_eq!(cb.record_failure(&key()), None);
        assert_eq!(cb.record_failure(&key()), None);
        assert!(matches!(
            cb.record_failure(&key()),
            Some(Transition::Opened { error_count: 3, .. })
        ));

        assert!(matches!(cb.check(&key(), &s), Admission::Rejected { .. }));
        assert_eq!(cb.state(&key()), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_outside_window_resets_count() {
        let cb = CircuitBreaker::new(settings(2, 10, 300));
        let s = cb.defaults().clone();
        cb.check(&key(), &s);

        cb.record_failure(&key());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.record_failure(&key()), None);
        assert_eq!(cb.status(&key()).unwrap().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let cb = CircuitBreaker::new(settings(3, 60, 300));
        cb.check(&key(), cb.defaults());

        cb.record_failure(&key());
        cb.record_failure(&key());
        cb.record_success(&key());

        cb.record_failure(&key());
        cb.record_failure(&key());
        assert_eq!(cb.state(&key()), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_cooldown() {
        let cb = CircuitBreaker::new(settings(1, 60, 30));
        let s = cb.defaults().clone();
        cb.check(&key(), &s);
        cb.record_failure(&key());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.state(&key()), CircuitState::HalfOpen);
        assert_eq!(cb.check(&key(), &s), Admission::Trial);
        // Second caller waits for the trial to report
        assert!(matches!(cb.check(&key(), &s), Admission::Rejected { .. }));
        assert!(cb.status(&key()).unwrap().trial_in_flight);

        assert_eq!(cb.record_success(&key()), Some(Transition::Closed));
        assert_eq!(cb.check(&key(), &s), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = CircuitBreaker::new(settings(1, 60, 30));
        let s = cb.defaults().clone();
        cb.check(&key(), &s);
        cb.record_failure(&key());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cb.check(&key(), &s), Admission::Trial);
        assert!(matches!(cb.record_failure(&key()), Some(Transition::Reopened { .. })));

        match cb.check(&key(), &s) {
            Admission::Rejected { retry_after } => assert_eq!(retry_after, Duration::from_secs(30)),
            other => panic!("Expected rejection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_expires() {
        let cb = CircuitBreaker::new(settings(1, 60, 30));
        let s = cb.defaults().clone();
        cb.check(&key(), &s);
        cb.record_failure(&key());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.check(&key(), &s), Admission::Trial);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cb.check(&key(), &s), Admission::Trial);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenants_are_independent() {
        let cb = CircuitBreaker::new(settings(1, 60, 300));
        let s = cb.defaults().clone();
        let acme = BreakerKey::new("triage", "gpt-4o", Some("acme"));
        let globex = BreakerKey::new("triage", "gpt-4o", Some("globex"));

        cb.check(&acme, &s);
        cb.record_failure(&acme);

        assert!(!cb.check(&acme, &s).is_allowed());
        assert!(cb.check(&globex, &s).is_allowed());
    }

    #[test]
    fn test_key_without_tenant_isolation() {
        let request = ExecutionRequest::builder("triage", "gpt-4o")
            .tenant("acme")
            .build()
            .unwrap();

        let isolated = BreakerKey::for_request(&request, "gpt-4o", &BreakerSettings::default());
        assert_eq!(isolated.to_string(), "triage/gpt-4o@acme");

        let shared = BreakerSettings {
            tenant_isolation: false,
            ..BreakerSettings::default()
        };
        assert_eq!(
            BreakerKey::for_request(&request, "gpt-4o", &shared).to_string(),
            "triage/gpt-4o"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admin_operations() {
        let cb = CircuitBreaker::new(settings(5, 60, 300));
        let s = cb.defaults().clone();

        cb.force_open(&key(), Some(Duration::from_secs(10)));
        assert!(!cb.check(&key(), &s).is_allowed());
        let status = cb.status(&key()).unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.cooldown_until.is_some());
        assert_eq!(status.error_count, 5);

        cb.force_close(&key());
        assert_eq!(cb.check(&key(), &s), Admission::Allowed);

        cb.force_open(&key(), None);
        cb.reset_all();
        assert!(cb.statuses().is_empty());
        assert_eq!(cb.state(&key()), CircuitState::Closed);
    }

    async fn fail_concurrently(cb: &Arc<CircuitBreaker>, tasks: usize) -> Vec<Option<Transition>> {
        let handles: Vec<_> = (0..tasks)
            .map(|_| {
                let cb = cb.clone();
                tokio::spawn(async move { cb.record_failure(&key()) })
            })
            .collect();

        let mut transitions = Vec::with_capacity(tasks);
        for handle in handles {
            transitions.push(handle.await.unwrap());
        }
        transitions
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_all_counted() {
        let cb = Arc::new(CircuitBreaker::new(settings(100, 60, 300)));
        cb.check(&key(), cb.defaults());

        let transitions = fail_concurrently(&cb, 40).await;

        assert!(transitions.iter().all(Option::is_none));
        let status = cb.status(&key()).unwrap();
        assert_eq!(status.error_count, 40);
        assert_eq!(status.state, CircuitState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_once() {
        let cb = Arc::new(CircuitBreaker::new(settings(5, 60, 300)));
        cb.check(&key(), cb.defaults());

        let transitions = fail_concurrently(&cb, 40).await;

        let opened: Vec<_> = transitions
            .iter()
            .filter(|t| matches!(t, Some(Transition::Opened { .. })))
            .collect();
        assert_eq!(opened.len(), 1);
        assert!(matches!(opened[0], Some(Transition::Opened { error_count: 5, .. })));
        assert_eq!(cb.state(&key()), CircuitState::Open);
        assert_eq!(cb.status(&key()).unwrap().error_count, 5);
    }
}
