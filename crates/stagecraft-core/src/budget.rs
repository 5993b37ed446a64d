//! Budget ledger: admission-time accounting against per-kind ceilings.
//!
//! `BudgetLedger` is the only structure mutated by concurrently running
//! stages. Every mutation happens under one mutex so a reservation is
//! checked and applied in a single step. Cloning produces a shared view of
//! the same ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use stagecraft_types::budget::{
    BudgetCeilings, BudgetLine, BudgetSnapshot, ResourceKind, Usage,
};
use thiserror::Error;

/// Share of a ceiling at which a one-time warning is logged.
const WARNING_PERCENT: u64 = 80;

/// A reservation that would push consumption past a ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("budget exhausted for {kind}: requested {requested}, remaining {remaining}")]
pub struct BudgetExhausted {
    pub kind: ResourceKind,
    pub requested: u64,
    pub remaining: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    lines: BTreeMap<ResourceKind, BudgetLine>,
    warned: BTreeSet<ResourceKind>,
}

impl LedgerState {
    fn line(&mut self, kind: ResourceKind) -> &mut BudgetLine {
        self.lines.entry(kind).or_default()
    }

    fn check(&self, kind: ResourceKind, amount: u64) -> Result<(), BudgetExhausted> {
        let line = self.lines.get(&kind).copied().unwrap_or_default();
        match line.ceiling {
            Some(ceiling) if line.consumed.saturating_add(amount) > ceiling => {
                Err(BudgetExhausted {
                    kind,
                    requested: amount,
                    remaining: ceiling.saturating_sub(line.consumed),
                })
            }
            _ => Ok(()),
        }
    }

    fn warn_on_threshold(&mut self, kind: ResourceKind) {
        let line = self.lines.get(&kind).copied().unwrap_or_default();
        if let Some(ceiling) = line.ceiling {
            let threshold = ceiling.saturating_mul(WARNING_PERCENT) / 100;
            if ceiling > 0 && line.consumed >= threshold && self.warned.insert(kind) {
                tracing::warn!(
                    kind = %kind,
                    consumed = line.consumed,
                    ceiling,
                    "budget above {WARNING_PERCENT}% of ceiling"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BudgetLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl BudgetLedger {
    pub fn new(ceilings: &BudgetCeilings) -> Self {
        let mut state = LedgerState::default();
        for kind in ResourceKind::ALL {
            state.lines.insert(
                kind,
                BudgetLine {
                    consumed: 0,
                    ceiling: ceilings.get(kind),
                },
            );
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Rebuild a ledger from a persisted snapshot.
    pub fn from_snapshot(snapshot: &BudgetSnapshot) -> Self {
        let state = LedgerState {
            lines: snapshot.lines.clone(),
            warned: BTreeSet::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check `consumed + amount <= ceiling` and, on success, consume `amount`.
    /// On refusal nothing is consumed.
    pub fn reserve(&self, kind: ResourceKind, amount: u64) -> bool {
        let mut state = self.lock();
        if state.check(kind, amount).is_err() {
            return false;
        }
        let line = state.line(kind);
        line.consumed = line.consumed.saturating_add(amount);
        state.warn_on_threshold(kind);
        true
    }

    /// Reserve every kind in `estimates` or none of them.
    pub fn try_reserve_all(&self, estimates: &Usage) -> Result<(), BudgetExhausted> {
        let mut state = self.lock();
        for (&kind, &amount) in estimates {
            state.check(kind, amount)?;
        }
        for (&kind, &amount) in estimates {
            let line = state.line(kind);
            line.consumed = line.consumed.saturating_add(amount);
            state.warn_on_threshold(kind);
        }
        Ok(())
    }

    /// Reconcile an estimate with the measured cost. A negative `delta`
    /// refunds; consumption never drops below zero.
    pub fn record_actual(&self, kind: ResourceKind, delta: i64) {
        let mut state = self.lock();
        let line = state.line(kind);
        line.consumed = if delta >= 0 {
            line.consumed.saturating_add(delta as u64)
        } else {
            line.consumed.saturating_sub(delta.unsigned_abs())
        };
        state.warn_on_threshold(kind);
    }

    /// Replace the reservation `reserved` with the measured `actual`, per kind.
    pub fn reconcile(&self, reserved: &Usage, actual: &Usage) {
        let kinds: BTreeSet<ResourceKind> = reserved.keys().chain(actual.keys()).copied().collect();
        let mut state = self.lock();
        for kind in kinds {
            let held = reserved.get(&kind).copied().unwrap_or(0);
            let used = actual.get(&kind).copied().unwrap_or(0);
            if used == held {
                continue;
            }
            let line = state.line(kind);
            line.consumed = if used > held {
                line.consumed.saturating_add(used - held)
            } else {
                line.consumed.saturating_sub(held - used)
            };
            state.warn_on_threshold(kind);
        }
    }

    /// Release a reservation without any consumption.
    pub fn release(&self, reserved: &Usage) {
        self.reconcile(reserved, &Usage::new());
    }

    /// Remaining headroom for `kind`; `None` when unlimited.
    pub fn remaining(&self, kind: ResourceKind) -> Option<u64> {
        self.lock()
            .lines
            .get(&kind)
            .copied()
            .unwrap_or_default()
            .remaining()
    }

    pub fn consumed(&self, kind: ResourceKind) -> u64 {
        self.lock().lines.get(&kind).map(|l| l.consumed).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            lines: self.lock().lines.clone(),
        }
    }
}
