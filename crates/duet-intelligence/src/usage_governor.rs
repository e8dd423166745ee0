//! The single budget authority.
//!
//! Every agent call goes through two phases: [`UsageGovernor::reserve`]
//! before dispatch and [`UsageGovernor::commit`] after it. A reservation
//! that is dropped without being committed releases what it held, so a
//! cancelled or abandoned call leaves the ledger as it found it.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use duet_core::config::BudgetConfig;
use duet_core::types::{SessionId, TokenUsage};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::ledger::{Ledger, LedgerEntry, LedgerError, LedgerKey, LedgerStore};
use crate::pricing::RateTable;

// ---------------------------------------------------------------------------
// Scopes and limits
// ---------------------------------------------------------------------------

/// A counter family. Session scope never rolls over; daily and monthly
/// scopes roll at UTC calendar boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Session(SessionId),
    Daily,
    Monthly,
}

impl Scope {
    /// Narrowest first.
    pub fn chain(session: &SessionId) -> [Scope; 3] {
        [Scope::Session(session.clone()), Scope::Daily, Scope::Monthly]
    }

    pub fn slug(&self) -> String {
        match self {
            Scope::Session(id) => format!("session-{id}"),
            Scope::Daily => "daily".into(),
            Scope::Monthly => "monthly".into(),
        }
    }

    pub fn period(&self, now: DateTime<Utc>) -> String {
        match self {
            Scope::Session(_) => "lifetime".into(),
            Scope::Daily => now.format("%Y-%m-%d").to_string(),
            Scope::Monthly => now.format("%Y-%m").to_string(),
        }
    }

    fn key(&self, now: DateTime<Utc>) -> LedgerKey {
        (self.slug(), self.period(now))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Session(id) => write!(f, "session {id}"),
            Scope::Daily => f.write_str("daily"),
            Scope::Monthly => f.write_str("monthly"),
        }
    }
}

/// Hard limits for one scope. An unset field never gates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeLimit {
    pub max_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
}

impl ScopeLimit {
    pub fn is_configured(&self) -> bool {
        self.max_tokens.is_some() || self.max_cost_usd.is_some()
    }

    /// Highest utilisation across configured dimensions, in percent.
    pub fn percentage(&self, tokens: u64, cost_usd: f64) -> Option<f64> {
        let token_pct = self.max_tokens.map(|max| pct(tokens as f64, max as f64));
        let cost_pct = self.max_cost_usd.map(|max| pct(cost_usd, max));
        match (token_pct, cost_pct) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Why `(tokens, cost)` plus `extra` would break this limit, if it would.
    fn violation(&self, entry: &LedgerEntry, extra_tokens: u64, extra_cost: f64) -> Option<String> {
        if let Some(max) = self.max_tokens {
            if entry.tokens >= max {
                return Some(format!("token limit reached ({} of {max})", entry.tokens));
            }
            let projected = entry.projected_tokens() + extra_tokens;
            if projected > max {
                return Some(format!(
                    "would exceed token limit ({} + {extra_tokens} > {max})",
                    entry.projected_tokens()
                ));
            }
        }
        if let Some(max) = self.max_cost_usd {
            if entry.cost_usd >= max {
                return Some(format!(
                    "cost limit reached (${:.4} of ${max:.4})",
                    entry.cost_usd
                ));
            }
            let projected = entry.projected_cost_usd() + extra_cost;
            if projected > max {
                return Some(format!(
                    "would exceed cost limit (${:.4} + ${extra_cost:.4} > ${max:.4})",
                    entry.projected_cost_usd()
                ));
            }
        }
        None
    }
}

fn pct(used: f64, max: f64) -> f64 {
    if max <= 0.0 {
        // A zero limit is always fully used.
        return 100.0;
    }
    used * 100.0 / max
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimits {
    pub session: ScopeLimit,
    pub daily: ScopeLimit,
    pub monthly: ScopeLimit,
    pub warning_threshold_pct: f64,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self::from_config(&BudgetConfig::default())
    }
}

impl BudgetLimits {
    pub fn from_config(cfg: &BudgetConfig) -> Self {
        Self {
            session: ScopeLimit {
                max_tokens: cfg.session_max_tokens,
                max_cost_usd: cfg.session_max_cost_usd,
            },
            daily: ScopeLimit {
                max_tokens: cfg.daily_max_tokens,
                max_cost_usd: cfg.daily_max_cost_usd,
            },
            monthly: ScopeLimit {
                max_tokens: cfg.monthly_max_tokens,
                max_cost_usd: cfg.monthly_max_cost_usd,
            },
            warning_threshold_pct: cfg.warning_threshold_pct,
        }
    }

    pub fn for_scope(&self, scope: &Scope) -> ScopeLimit {
        match scope {
            Scope::Session(_) => self.session,
            Scope::Daily => self.daily,
            Scope::Monthly => self.monthly,
        }
    }
}

// ---------------------------------------------------------------------------
// Public value types
// ---------------------------------------------------------------------------

/// What a caller expects a call to consume.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEstimate {
    pub model: String,
    pub usage: TokenUsage,
}

impl UsageEstimate {
    pub fn new(model: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            model: model.into(),
            usage: TokenUsage::new(input_tokens, output_tokens),
        }
    }
}

/// A denied reservation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{scope} budget exceeded: {reason}")]
pub struct BudgetDenied {
    pub scope: Scope,
    pub reason: String,
}

/// What a committed call was charged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageCharge {
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

impl UsageCharge {
    pub fn add(&mut self, other: UsageCharge) {
        self.usage.add(other.usage);
        self.cost_usd += other.cost_usd;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStatus {
    pub scope: Scope,
    pub period: String,
    pub used_tokens: u64,
    pub used_cost_usd: f64,
    pub requests: u64,
    pub limit: ScopeLimit,
    /// `None` when the scope has no configured limit.
    pub percentage: Option<f64>,
}

/// Per-session view across every scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub session: UsageStatus,
    pub daily: UsageStatus,
    pub monthly: UsageStatus,
    /// The narrowest scope with a configured limit.
    pub gating_scope: Option<Scope>,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UsageEvent {
    Warning {
        scope: Scope,
        period: String,
        percentage: f64,
    },
    LimitReached {
        scope: Scope,
        period: String,
    },
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A settable clock for period-rollover tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

/// Estimated usage held against every scope until committed.
///
/// Dropping an uncommitted reservation releases it.
#[must_use = "a reservation is released as soon as it is dropped"]
pub struct Reservation {
    ledger: Arc<Mutex<Ledger>>,
    session: SessionId,
    keys: Vec<LedgerKey>,
    model: String,
    tokens: u64,
    cost_usd: f64,
    settled: bool,
}

impl Reservation {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.tokens
    }

    pub fn estimated_cost_usd(&self) -> f64 {
        self.cost_usd
    }

    fn release_in(&self, ledger: &mut Ledger) {
        for key in &self.keys {
            ledger.entry_mut(key).release(self.tokens, self.cost_usd);
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("session", &self.session)
            .field("model", &self.model)
            .field("tokens", &self.tokens)
            .field("cost_usd", &self.cost_usd)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut ledger = lock(&self.ledger);
        self.release_in(&mut ledger);
        debug!(session_id = %self.session, tokens = self.tokens, "reservation released");
    }
}

// ---------------------------------------------------------------------------
// UsageGovernor
// ---------------------------------------------------------------------------

pub struct UsageGovernor {
    limits: BudgetLimits,
    rates: RateTable,
    ledger: Arc<Mutex<Ledger>>,
    store: Option<LedgerStore>,
    /// Serializes ledger file writes; never held together with `ledger`
    /// across I/O.
    writer: Mutex<()>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<UsageEvent>,
}

impl UsageGovernor {
    /// An in-memory governor.
    pub fn new(limits: BudgetLimits, rates: RateTable) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            limits,
            rates,
            ledger: Arc::new(Mutex::new(Ledger::default())),
            store: None,
            writer: Mutex::new(()),
            clock: Arc::new(SystemClock),
            events,
        }
    }

    /// Persist counters under `dir`, loading whatever is already there.
    pub fn with_persistence(mut self, dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let store = LedgerStore::new(dir);
        let entries = store.load_all()?;
        info!(entries = entries.len(), dir = %store.dir().display(), "usage ledger loaded");
        self.ledger = Arc::new(Mutex::new(Ledger::from_entries(entries)));
        self.store = Some(store);
        Ok(self)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UsageEvent> {
        self.events.subscribe()
    }

    /// Cost of `usage` on `model` per the rate table.
    pub fn cost_of(&self, model: &str, usage: TokenUsage) -> f64 {
        self.rates.cost(model, usage)
    }

    /// Deny when any configured limit in the session's chain is already
    /// fully used. Consumes nothing.
    pub fn check(&self, session: &SessionId) -> Result<(), BudgetDenied> {
        let now = self.clock.now();
        let ledger = lock(&self.ledger);
        for scope in Scope::chain(session) {
            let limit = self.limits.for_scope(&scope);
            if !limit.is_configured() {
                continue;
            }
            let key = scope.key(now);
            let empty = LedgerEntry::new(key.0.clone(), key.1.clone());
            let entry = ledger.get(&key).unwrap_or(&empty);
            let exhausted = limit.max_tokens.is_some_and(|max| entry.tokens >= max)
                || limit.max_cost_usd.is_some_and(|max| entry.cost_usd >= max);
            if exhausted {
                let reason = format!(
                    "limit reached for period {} ({} tokens, ${:.4})",
                    key.1, entry.tokens, entry.cost_usd
                );
                warn!(session_id = %session, scope = %scope, %reason, "budget pre-check denied");
                return Err(BudgetDenied { scope, reason });
            }
        }
        Ok(())
    }

    /// Atomically test `estimate` against every configured limit in the
    /// session's chain and, if all admit it, hold it against each scope.
    pub fn reserve(
        &self,
        session: &SessionId,
        estimate: &UsageEstimate,
    ) -> Result<Reservation, BudgetDenied> {
        let now = self.clock.now();
        let tokens = estimate.usage.total();
        let cost_usd = self.rates.cost(&estimate.model, estimate.usage);
        let scopes = Scope::chain(session);

        let mut ledger = lock(&self.ledger);
        for scope in &scopes {
            let limit = self.limits.for_scope(scope);
            if !limit.is_configured() {
                continue;
            }
            let entry = ledger.entry_mut(&scope.key(now));
            if let Some(reason) = limit.violation(entry, tokens, cost_usd) {
                warn!(
                    session_id = %session,
                    scope = %scope,
                    model = %estimate.model,
                    %reason,
                    "reservation denied"
                );
                return Err(BudgetDenied {
                    scope: scope.clone(),
                    reason,
                });
            }
        }

        let keys: Vec<LedgerKey> = scopes.iter().map(|s| s.key(now)).collect();
        for key in &keys {
            let entry = ledger.entry_mut(key);
            entry.reserved_tokens += tokens;
            entry.reserved_cost_usd += cost_usd;
        }
        drop(ledger);

        debug!(session_id = %session, model = %estimate.model, tokens, cost_usd, "usage reserved");
        Ok(Reservation {
            ledger: Arc::clone(&self.ledger),
            session: session.clone(),
            keys,
            model: estimate.model.clone(),
            tokens,
            cost_usd,
            settled: false,
        })
    }

    /// Replace the reservation with what the call actually consumed.
    pub fn commit(&self, mut reservation: Reservation, actual: TokenUsage) -> UsageCharge {
        reservation.settled = true;
        let now = self.clock.now();
        let cost_usd = self.rates.cost(&reservation.model, actual);
        let charge = UsageCharge {
            usage: actual,
            cost_usd,
        };

        let mut ledger = lock(&self.ledger);
        reservation.release_in(&mut ledger);

        let mut keys = Vec::with_capacity(3);
        for scope in Scope::chain(&reservation.session) {
            let key = scope.key(now);
            let entry = ledger.entry_mut(&key);
            entry.tokens += actual.total();
            entry.cost_usd += cost_usd;
            entry.requests += 1;
            self.emit_threshold_events(&scope, entry);
            keys.push(key);
        }
        drop(ledger);

        self.persist(&keys);

        debug!(
            session_id = %reservation.session,
            model = %reservation.model,
            input_tokens = actual.input_tokens,
            output_tokens = actual.output_tokens,
            cost_usd,
            "usage committed"
        );
        charge
    }

    pub fn status(&self, scope: &Scope) -> UsageStatus {
        let now = self.clock.now();
        let key = scope.key(now);
        let ledger = lock(&self.ledger);
        let limit = self.limits.for_scope(scope);
        let (tokens, cost, requests) = ledger
            .get(&key)
            .map(|e| (e.tokens, e.cost_usd, e.requests))
            .unwrap_or((0, 0.0, 0));
        UsageStatus {
            scope: scope.clone(),
            period: key.1,
            used_tokens: tokens,
            used_cost_usd: cost,
            requests,
            limit,
            percentage: limit.percentage(tokens, cost),
        }
    }

    /// Every scope for `session`, with the headline percentage taken from
    /// the narrowest configured limit.
    pub fn summary(&self, session: &SessionId) -> UsageSummary {
        let [s, d, m] = Scope::chain(session);
        let session_status = self.status(&s);
        let daily = self.status(&d);
        let monthly = self.status(&m);
        let gating = [&session_status, &daily, &monthly]
            .into_iter()
            .find(|st| st.limit.is_configured());
        UsageSummary {
            gating_scope: gating.map(|st| st.scope.clone()),
            percentage: gating.and_then(|st| st.percentage),
            session: session_status,
            daily,
            monthly,
        }
    }

    /// Write the current state of `keys` to disk. Snapshots are taken under
    /// the writer lock, so whichever commit writes last writes the newest
    /// counters.
    fn persist(&self, keys: &[LedgerKey]) {
        let Some(store) = &self.store else {
            return;
        };
        let _writer = lock(&self.writer);
        let snapshots: Vec<LedgerEntry> = {
            let ledger = lock(&self.ledger);
            keys.iter().filter_map(|k| ledger.get(k).cloned()).collect()
        };
        for entry in &snapshots {
            if let Err(err) = store.save(entry) {
                warn!(scope = %entry.scope, period = %entry.period, error = %err, "failed to persist usage");
            }
        }
    }

    fn emit_threshold_events(&self, scope: &Scope, entry: &mut LedgerEntry) {
        let limit = self.limits.for_scope(scope);
        let Some(percentage) = limit.percentage(entry.tokens, entry.cost_usd) else {
            return;
        };
        if percentage >= 100.0 && !entry.exhausted {
            entry.exhausted = true;
            entry.warned = true;
            warn!(scope = %scope, period = %entry.period, percentage, "usage limit reached");
            let _ = self.events.send(UsageEvent::LimitReached {
                scope: scope.clone(),
                period: entry.period.clone(),
            });
        } else if percentage >= self.limits.warning_threshold_pct && !entry.warned {
            entry.warned = true;
            warn!(scope = %scope, period = %entry.period, percentage, "usage warning threshold crossed");
            let _ = self.events.send(UsageEvent::Warning {
                scope: scope.clone(),
                period: entry.period.clone(),
                percentage,
            });
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
