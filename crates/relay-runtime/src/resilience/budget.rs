//! Cost budget management for agent calls.
//!
//! The ledger keeps cumulative cost, tokens and executions per
//! `(scope, period, bucket)`. Buckets are derived from the wall clock
//! (`2025-03-09` daily, `2025-03` monthly), so a new day or month starts
//! from zero without any reset job.
//!
//! Before a call, the executor [`reserve`](BudgetLedger::reserve)s the
//! projected cost on every applicable entry. Realized spend is committed
//! through the [`Reservation`] as attempts complete; dropping the
//! reservation releases whatever was held but not spent.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use relay_core::{BudgetConfig, BudgetPeriod, BudgetScope, Enforcement, TokenUsage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Slack for float noise when comparing against a limit.
const EPSILON: f64 = 1e-9;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct LedgerKey {
    scope: BudgetScope,
    period: BudgetPeriod,
    bucket: String,
}

#[derive(Debug, Default)]
struct LedgerEntry {
    cost: f64,
    tokens: u64,
    executions: u64,
    reserved: f64,
    soft_cap_alerted: bool,
    over_limit_alerted: bool,
}

/// Kind of budget warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Crossed `soft_cap_percentage` of a limit
    SoftCap,

    /// Went over a limit under soft enforcement
    OverLimit,
}

/// A warning raised by a check, reservation or commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetWarning {
    pub kind: WarningKind,
    pub scope: BudgetScope,
    pub period: BudgetPeriod,
    pub limit: f64,
    pub current: f64,
}

/// A hard-enforced limit that a call would exceed.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{scope} {period} budget exceeded: {current:.4} spent + {projected:.4} projected > limit {limit:.4}")]
pub struct BudgetDenial {
    pub scope: BudgetScope,
    pub period: BudgetPeriod,
    pub limit: f64,
    /// Spent plus held by in-flight reservations
    pub current: f64,
    pub projected: f64,
}

impl BudgetDenial {
    /// What is left under the limit.
    pub fn remaining(&self) -> f64 {
        (self.limit - self.current).max(0.0)
    }
}

/// Result of a read-only budget check.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub reason: Option<String>,
    pub warnings: Vec<BudgetWarning>,
}

/// Snapshot of one ledger entry for the administrative API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub scope: BudgetScope,
    pub period: BudgetPeriod,
    pub bucket: String,
    pub limit: Option<f64>,
    pub enforcement: Enforcement,
    pub cumulative_cost: f64,
    pub cumulative_tokens: u64,
    pub cumulative_executions: u64,
    pub reserved: f64,
    pub remaining: Option<f64>,
}

/// Budget ledger shared by every execution.
pub struct BudgetLedger {
    config: BudgetConfig,
    entries: RwLock<HashMap<LedgerKey, Arc<Mutex<LedgerEntry>>>>,
    clock: Clock,
}

impl BudgetLedger {
    /// Create a ledger using the system clock.
    pub fn new(config: BudgetConfig) -> Self {
        Self::with_clock(config, Utc::now)
    }

    /// Create a ledger with an injected wall clock.
    pub fn with_clock<F>(config: BudgetConfig, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            clock: Arc::new(clock),
        }
    }

    /// Budget configuration.
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn keys(&self, scopes: &[BudgetScope]) -> Vec<LedgerKey> {
        let now = (self.clock)();
        let mut keys: Vec<LedgerKey> = scopes
            .iter()
            .flat_map(|scope| {
                BudgetPeriod::ALL.into_iter().map(move |period| LedgerKey {
                    scope: scope.clone(),
                    period,
                    bucket: period.bucket(now),
                })
            })
            .collect();
        // Fixed lock order across callers
        keys.sort();
        keys.dedup();
        keys
    }

    fn entry(&self, key: &LedgerKey) -> Arc<Mutex<LedgerEntry>> {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }
        self.entries
            .write()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn entries_for(&self, scopes: &[BudgetScope]) -> Vec<(LedgerKey, Arc<Mutex<LedgerEntry>>)> {
        self.keys(scopes)
            .into_iter()
            .map(|key| {
                let entry = self.entry(&key);
                (key, entry)
            })
            .collect()
    }

    fn limit(&self, key: &LedgerKey) -> Option<f64> {
        self.config.limit(&key.scope, key.period)
    }

    /// Check whether a call projected to cost `projected` may proceed.
    ///
    /// Read-only: nothing is held and warnings are not marked as raised.
    pub fn check(&self, scopes: &[BudgetScope], projected: f64) -> BudgetCheck {
        let mut check = BudgetCheck {
            allowed: true,
            ..Default::default()
        };

        for (key, entry) in self.entries_for(scopes) {
            let mut entry = entry.lock();
            match evaluate(&self.config, &key, &mut entry, projected, false) {
                Ok(warnings) => check.warnings.extend(warnings),
                Err(denial) => {
                    check.allowed = false;
                    check.reason = Some(denial.to_string());
                    return check;
                }
            }
        }

        check
    }

    /// Check and hold `projected` on every applicable entry, atomically.
    ///
    /// A denial holds nothing.
    pub fn reserve(&self, scopes: &[BudgetScope], projected: f64) -> Result<Reservation, BudgetDenial> {
        let projected = projected.max(0.0);
        let entries = self.entries_for(scopes);
        let warnings = hold(&self.config, &entries, projected)?;

        Ok(Reservation {
            ledger_entries: entries,
            held: projected,
            warnings,
            config: self.config.clone(),
        })
    }

    /// Add realized spend to every applicable entry.
    pub fn commit(&self, scopes: &[BudgetScope], cost: f64, usage: &TokenUsage) -> Vec<BudgetWarning> {
        let entries = self.entries_for(scopes);
        apply_commit(&self.config, &entries, cost, usage, 0.0)
    }

    /// Snapshots of a scope for the current daily and monthly buckets.
    pub fn status(&self, scope: &BudgetScope) -> Vec<BudgetStatus> {
        self.entries_for(std::slice::from_ref(scope))
            .into_iter()
            .map(|(key, entry)| {
                let entry = entry.lock();
                let limit = self.limit(&key);
                BudgetStatus {
                    remaining: limit.map(|l| (l - entry.cost).max(0.0)),
                    scope: key.scope,
                    period: key.period,
                    bucket: key.bucket,
                    limit,
                    enforcement: self.config.enforcement,
                    cumulative_cost: entry.cost,
                    cumulative_tokens: entry.tokens,
                    cumulative_executions: entry.executions,
                    reserved: entry.reserved,
                }
            })
            .collect()
    }

    /// Spend left under a scope's limit for the current bucket.
    ///
    /// `None` when the scope has no limit for that period.
    pub fn remaining(&self, scope: &BudgetScope, period: BudgetPeriod) -> Option<f64> {
        self.status(scope)
            .into_iter()
            .find(|s| s.period == period)
            .and_then(|s| s.remaining)
    }

    /// Drop every entry.
    pub fn reset(&self) {
        self.entries.write().clear();
        tracing::info!("Budget ledger reset");
    }
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

/// Evaluate one entry for a prospective spend.
///
/// Returns a denial under hard enforcement, otherwise the warnings to
/// raise. Warnings are deduplicated per entry when `mark` is set.
fn evaluate(
    config: &BudgetConfig,
    key: &LedgerKey,
    entry: &mut LedgerEntry,
    projected: f64,
    mark: bool,
) -> Result<Vec<BudgetWarning>, BudgetDenial> {
    let mut warnings = Vec::new();
    let enforcement = config.enforcement;
    let Some(limit) = config.limit(&key.scope, key.period) else {
        return Ok(warnings);
    };
    if enforcement == Enforcement::None {
        return Ok(warnings);
    }

    let current = entry.cost + entry.reserved;
    let total = current + projected;

    if total > limit + EPSILON {
        if enforcement == Enforcement::Hard {
            return Err(BudgetDenial {
                scope: key.scope.clone(),
                period: key.period,
                limit,
                current,
                projected,
            });
        }
        if !entry.over_limit_alerted {
            entry.over_limit_alerted = mark;
            warnings.push(BudgetWarning {
                kind: WarningKind::OverLimit,
                scope: key.scope.clone(),
                period: key.period,
                limit,
                current: total,
            });
        }
    }

    if let Some(pct) = config.soft_cap_percentage {
        let cap = limit * pct / 100.0;
        if total >= cap - EPSILON && !entry.soft_cap_alerted {
            entry.soft_cap_alerted = mark;
            warnings.push(BudgetWarning {
                kind: WarningKind::SoftCap,
                scope: key.scope.clone(),
                period: key.period,
                limit,
                current: total,
            });
        }
    }

    Ok(warnings)
}

/// Check and hold `projected` on every entry, atomically.
///
/// All entry locks are taken (in key order) before anything is held, so
/// two concurrent callers cannot both fit under a limit only one fits
/// under. A denial holds nothing.
fn hold(
    config: &BudgetConfig,
    entries: &[(LedgerKey, Arc<Mutex<LedgerEntry>>)],
    projected: f64,
) -> Result<Vec<BudgetWarning>, BudgetDenial> {
    let mut guards: Vec<_> = entries.iter().map(|(key, entry)| (key, entry.lock())).collect();

    for (key, guard) in guards.iter_mut() {
        evaluate(config, key, guard, projected, false)?;
    }

    let mut warnings = Vec::new();
    for (key, guard) in guards.iter_mut() {
        // Cannot fail: the same entries passed above under the same locks
        if let Ok(found) = evaluate(config, key, guard, projected, true) {
            warnings.extend(found);
        }
        guard.reserved += projected;
    }

    Ok(warnings)
}

fn apply_commit(
    config: &BudgetConfig,
    entries: &[(LedgerKey, Arc<Mutex<LedgerEntry>>)],
    cost: f64,
    usage: &TokenUsage,
    release: f64,
) -> Vec<BudgetWarning> {
    let cost = cost.max(0.0);
    let mut warnings = Vec::new();

    for (key, entry) in entries {
        let mut entry = entry.lock();
        entry.cost += cost;
        entry.tokens += u64::from(usage.total());
        entry.executions += 1;
        entry.reserved = (entry.reserved - release).max(0.0);

        if config.enforcement == Enforcement::None {
            continue;
        }
        let Some(limit) = config.limit(&key.scope, key.period) else {
            continue;
        };
        let total = entry.cost + entry.reserved;

        if config.enforcement == Enforcement::Soft && total > limit + EPSILON && !entry.over_limit_alerted {
            entry.over_limit_alerted = true;
            warnings.push(BudgetWarning {
                kind: WarningKind::OverLimit,
                scope: key.scope.clone(),
                period: key.period,
                limit,
                current: total,
            });
        }
        if let Some(pct) = config.soft_cap_percentage {
            if total >= limit * pct / 100.0 - EPSILON && !entry.soft_cap_alerted {
                entry.soft_cap_alerted = true;
                warnings.push(BudgetWarning {
                    kind: WarningKind::SoftCap,
                    scope: key.scope.clone(),
                    period: key.period,
                    limit,
                    current: total,
                });
            }
        }
    }

    warnings
}

/// Projected cost held on the ledger for one execution.
pub struct Reservation {
    ledger_entries: Vec<(LedgerKey, Arc<Mutex<LedgerEntry>>)>,
    held: f64,
    warnings: Vec<BudgetWarning>,
    config: BudgetConfig,
}

impl Reservation {
    /// Warnings raised when the reservation was made.
    pub fn warnings(&self) -> &[BudgetWarning] {
        &self.warnings
    }

    /// Amount still held.
    pub fn held(&self) -> f64 {
        self.held
    }

    /// Make sure at least `projected` is held for the next provider call.
    ///
    /// Tops the hold up under the same per-entry locks as
    /// [`BudgetLedger::reserve`]. A denial leaves the hold unchanged.
    pub fn ensure(&mut self, projected: f64) -> Result<Vec<BudgetWarning>, BudgetDenial> {
        let missing = projected.max(0.0) - self.held;
        if missing <= 0.0 {
            return Ok(Vec::new());
        }
        let warnings = hold(&self.config, &self.ledger_entries, missing)?;
        self.held += missing;
        Ok(warnings)
    }

    /// Commit the spend of one realized provider call.
    ///
    /// The spend is taken out of the hold first, so committed cost is never
    /// counted twice.
    pub fn commit(&mut self, cost: f64, usage: &TokenUsage) -> Vec<BudgetWarning> {
        let release = cost.max(0.0).min(self.held);
        self.held -= release;
        apply_commit(&self.config, &self.ledger_entries, cost, usage, release)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.held <= 0.0 {
            return;
        }
        for (_, entry) in &self.ledger_entries {
            let mut entry = entry.lock();
            entry.reserved = (entry.reserved - self.held).max(0.0);
        }
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("entries", &self.ledger_entries.len())
            .field("held", &self.held)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use relay_core::BudgetLimits;

    fn global() -> Vec<BudgetScope> {
        vec![BudgetScope::Global]
    }

    #[test]
    fn test_hard_limit_denies_before_spend() {
        let ledger = BudgetLedger::new(BudgetConfig::hard_global(Some(10.0), None));
        ledger.commit(&global(), 9.999, &TokenUsage::default());

        let check = ledger.check(&global(), 0.01);
        assert!(!check.allowed);
        assert!(check.reason.unwrap().contains("global daily"));

        let denial = ledger.reserve(&global(), 0.01).unwrap_err();
        assert_eq!(denial.scope, BudgetScope::Global);
        assert!((denial.remaining() - 0.001).abs() < 1e-9);

        // Denied calls commit nothing
        let status = ledger.status(&BudgetScope::Global);
        assert!((status[0].cumulative_cost - 9.999).abs() < 1e-9);
        assert_eq!(status[0].reserved, 0.0);
    }

    #[test]
    fn test_exact_fit_is_allowed() {
        let ledger = BudgetLedger::new(BudgetConfig::hard_global(Some(1.0), None));
        ledger.commit(&global(), 0.7, &TokenUsage::default());
        assert!(ledger.reserve(&global(), 0.3).is_ok());
    }

    #[test]
    fn test_reservation_holds_then_releases() {
        let ledger = BudgetLedger::new(BudgetConfig::hard_global(Some(1.0), None));

        let first = ledger.reserve(&global(), 0.6).unwrap();
        assert!(ledger.reserve(&global(), 0.6).is_err());

        drop(first);
        assert!(ledger.reserve(&global(), 0.6).is_ok());
    }

    #[test]
    fn test_commit_consumes_hold() {
        let ledger = BudgetLedger::new(BudgetConfig::hard_global(Some(1.0), None));

        let mut reservation = ledger.reserve(&global(), 0.5).unwrap();
        reservation.commit(0.2, &TokenUsage::new(10, 5));
        assert!((reservation.held() - 0.3).abs() < 1e-9);

        let status = &ledger.status(&BudgetScope::Global)[0];
        assert!((status.cumulative_cost - 0.2).abs() < 1e-9);
        assert!((status.reserved - 0.3).abs() < 1e-9);
        assert_eq!(status.cumulative_tokens, 15);
        assert_eq!(status.cumulative_executions, 1);

        drop(reservation);
        assert_eq!(ledger.status(&BudgetScope::Global)[0].reserved, 0.0);
        let remaining = ledger.remaining(&BudgetScope::Global, BudgetPeriod::Daily).unwrap();
        assert!((remaining - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_soft_enforcement_warns_once() {
        let config = BudgetConfig {
            enforcement: Enforcement::Soft,
            global: BudgetLimits {
                daily: Some(1.0),
                monthly: None,
            },
            ..Default::default()
        };
        let ledger = BudgetLedger::new(config);
        ledger.commit(&global(), 1.0, &TokenUsage::default());

        let first = ledger.reserve(&global(), 0.5).unwrap();
        assert_eq!(first.warnings().len(), 1);
        assert_eq!(first.warnings()[0].kind, WarningKind::OverLimit);

        let second = ledger.reserve(&global(), 0.5).unwrap();
        assert!(second.warnings().is_empty());
    }

    #[test]
    fn test_soft_cap_warning_under_hard_enforcement() {
        let config = BudgetConfig {
            soft_cap_percentage: Some(80.0),
            ..BudgetConfig::hard_global(Some(10.0), None)
        };
        let ledger = BudgetLedger::new(config);

        assert!(ledger.reserve(&global(), 5.0).unwrap().warnings().is_empty());

        ledger.commit(&global(), 7.5, &TokenUsage::default());
        let reservation = ledger.reserve(&global(), 1.0).unwrap();
        assert_eq!(reservation.warnings()[0].kind, WarningKind::SoftCap);
        assert_eq!(reservation.warnings()[0].period, BudgetPeriod::Daily);
    }

    #[test]
    fn test_scopes_are_independent() {
        let config = BudgetConfig {
            enforcement: Enforcement::Hard,
            tenant_default: Some(BudgetLimits {
                daily: Some(1.0),
                monthly: None,
            }),
            ..Default::default()
        };
        let ledger = BudgetLedger::new(config);
        let acme = vec![BudgetScope::Global, BudgetScope::Tenant("acme".into())];
        let globex = vec![BudgetScope::Global, BudgetScope::Tenant("globex".into())];

        ledger.commit(&acme, 1.0, &TokenUsage::default());
        assert!(ledger.reserve(&acme, 0.1).is_err());
        assert!(ledger.reserve(&globex, 0.1).is_ok());
    }

    #[test]
    fn test_new_bucket_starts_empty() {
        let now = Arc::new(Mutex::new(
            DateTime::parse_from_rfc3339("2025-03-09T23:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ));
        let clock = now.clone();
        let ledger = BudgetLedger::with_clock(BudgetConfig::hard_global(Some(1.0), None), move || {
            *clock.lock()
        });

        ledger.commit(&global(), 1.0, &TokenUsage::default());
        assert!(ledger.reserve(&global(), 0.5).is_err());

        *now.lock() = DateTime::parse_from_rfc3339("2025-03-10T00:00:01Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(ledger.reserve(&global(), 0.5).is_ok());
        assert_eq!(ledger.status(&BudgetScope::Global)[0].bucket, "2025-03-10");
    }

    #[test]
    fn test_no_enforcement_tracks_only() {
        let ledger = BudgetLedger::default();
        ledger.commit(&global(), 100.0, &TokenUsage::default());
        assert!(ledger.check(&global(), 100.0).allowed);
        assert_eq!(ledger.remaining(&BudgetScope::Global, BudgetPeriod::Daily), None);
    }

    #[test]
    fn test_ensure_tops_up_hold_under_limit() {
        let ledger = BudgetLedger::new(BudgetConfig::hard_global(Some(1.0), None));
        let mut reservation = ledger.reserve(&global(), 0.5).unwrap();

        reservation.commit(0.5, &TokenUsage::default());
        assert_eq!(reservation.held(), 0.0);

        // Second attempt still fits
        reservation.ensure(0.5).unwrap();
        assert!((reservation.held() - 0.5).abs() < 1e-9);
        reservation.commit(0.5, &TokenUsage::default());

        // Third would push the scope past its limit
        let denial = reservation.ensure(0.5).unwrap_err();
        assert_eq!(denial.scope, BudgetScope::Global);
        assert_eq!(reservation.held(), 0.0);

        let status = &ledger.status(&BudgetScope::Global)[0];
        assert!((status.cumulative_cost - 1.0).abs() < 1e-9);
        assert_eq!(status.reserved, 0.0);
        assert_eq!(status.cumulative_executions, 2);
    }

    #[test]
    fn test_ensure_keeps_a_sufficient_hold() {
        let ledger = BudgetLedger::new(BudgetConfig::hard_global(Some(1.0), None));
        let mut reservation = ledger.reserve(&global(), 0.8).unwrap();

        assert!(reservation.ensure(0.3).unwrap().is_empty());
        assert!((reservation.held() - 0.8).abs() < 1e-9);
        assert!((ledger.status(&BudgetScope::Global)[0].reserved - 0.8).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_spend_respects_hard_limit() {
        let ledger = Arc::new(BudgetLedger::new(BudgetConfig::hard_global(Some(1.0), None)));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    let Ok(mut reservation) = ledger.reserve(&global(), 0.1) else {
                        return false;
                    };
                    tokio::task::yield_now().await;
                    reservation.commit(0.1, &TokenUsage::new(10, 5));
                    true
                })
            })
            .collect();

        let mut admitted = 0u64;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        let status = &ledger.status(&BudgetScope::Global)[0];
        assert!(admitted <= 10);
        assert!(status.cumulative_cost <= 1.0 + EPSILON);
        assert_eq!(status.cumulative_executions, admitted);
        assert_eq!(status.cumulative_tokens, admitted * 15);
        assert_eq!(status.reserved, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_lose_no_updates() {
        let ledger = Arc::new(BudgetLedger::default());
        let scopes = vec![BudgetScope::Global, BudgetScope::Agent("writer".into())];

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let ledger = ledger.clone();
                let scopes = scopes.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        ledger.commit(&scopes, 0.25, &TokenUsage::new(3, 1));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        for scope in &scopes {
            let status = &ledger.status(scope)[0];
            assert_eq!(status.cumulative_executions, 1000);
            assert_eq!(status.cumulative_tokens, 4000);
            assert!((status.cumulative_cost - 250.0).abs() < 1e-9);
        }
    }

    proptest! {
        #[test]
        fn prop_hard_limit_never_exceeded(
            calls in prop::collection::vec(
                (0.0f64..0.5, prop::collection::vec(0.0f64..=1.0, 1..6)),
                1..40,
            )
        ) {
            let ledger = BudgetLedger::new(BudgetConfig::hard_global(Some(2.0), None));

            // Each call retries while the ledger keeps admitting attempts
            for (projected, attempts) in calls {
                let Ok(mut reservation) = ledger.reserve(&global(), projected) else {
                    continue;
                };
                for spent_fraction in attempts {
                    if reservation.ensure(projected).is_err() {
                        break;
                    }
                    reservation.commit(projected * spent_fraction, &TokenUsage::default());
                    let status = &ledger.status(&BudgetScope::Global)[0];
                    prop_assert!(status.cumulative_cost <= 2.0 + EPSILON);
                }
            }
            prop_assert_eq!(ledger.status(&BudgetScope::Global)[0].reserved, 0.0);
        }

        #[test]
        fn prop_overspend_blocks_further_attempts(
            calls in prop::collection::vec(
                (0.01f64..0.5, prop::collection::vec(0.0f64..3.0, 1..6)),
                1..40,
            )
        ) {
            let ledger = BudgetLedger::new(BudgetConfig::hard_global(Some(2.0), None));

            for (projected, attempts) in calls {
                let Ok(mut reservation) = ledger.reserve(&global(), projected) else {
                    let status = &ledger.status(&BudgetScope::Global)[0];
                    prop_assert!(status.cumulative_cost + projected > 2.0 - EPSILON);
                    continue;
                };
                for spent_multiple in attempts {
                    let before = ledger.status(&BudgetScope::Global)[0].cumulative_cost;
                    if reservation.ensure(projected).is_err() {
                        prop_assert!(before + projected > 2.0 - EPSILON);
                        break;
                    }
                    // Spend above the projection is recorded, never hidden
                    let spent = projected * spent_multiple;
                    reservation.commit(spent, &TokenUsage::default());
                    let after = ledger.status(&BudgetScope::Global)[0].cumulative_cost;
                    prop_assert!((after - before - spent).abs() < 1e-9);
                    // An admitted attempt overshoots by at most its own excess
                    prop_assert!(after <= 2.0 + (spent - projected).max(0.0) + EPSILON);
                }
            }
        }
    }
}
