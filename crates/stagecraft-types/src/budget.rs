//! Budget accounting types.
//!
//! Amounts are unsigned integers in the unit of their resource kind: tokens,
//! micro-units of currency, and milliseconds of wall-clock time.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A finite resource tracked by the budget ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Tokens,
    CostMicros,
    TimeMs,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Tokens,
        ResourceKind::CostMicros,
        ResourceKind::TimeMs,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Tokens => "tokens",
            ResourceKind::CostMicros => "cost_micros",
            ResourceKind::TimeMs => "time_ms",
        };
        write!(f, "{s}")
    }
}

/// Per-kind amounts: estimates declared by a stage or usage reported by a task.
pub type Usage = BTreeMap<ResourceKind, u64>;

/// Merge `other` into `into`, summing amounts per kind.
pub fn add_usage(into: &mut Usage, other: &Usage) {
    for (kind, amount) in other {
        let total = into.entry(*kind).or_insert(0);
        *total = total.saturating_add(*amount);
    }
}

/// Configured ceilings. `None` means the kind is tracked but unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCeilings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_micros: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,
}

impl BudgetCeilings {
    pub fn get(&self, kind: ResourceKind) -> Option<u64> {
        match kind {
            ResourceKind::Tokens => self.tokens,
            ResourceKind::CostMicros => self.cost_micros,
            ResourceKind::TimeMs => self.time_ms,
        }
    }

    /// Field-wise override: values set in `other` win.
    pub fn overridden_by(&self, other: &BudgetCeilings) -> BudgetCeilings {
        BudgetCeilings {
            tokens: other.tokens.or(self.tokens),
            cost_micros: other.cost_micros.or(self.cost_micros),
            time_ms: other.time_ms.or(self.time_ms),
        }
    }
}

/// Consumed-so-far and ceiling for one resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLine {
    pub consumed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<u64>,
}

impl BudgetLine {
    /// Remaining headroom; `None` when unlimited.
    pub fn remaining(&self) -> Option<u64> {
        self.ceiling.map(|c| c.saturating_sub(self.consumed))
    }
}

/// Point-in-time copy of the whole ledger, persisted with the run record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub lines: BTreeMap<ResourceKind, BudgetLine>,
}

impl BudgetSnapshot {
    pub fn consumed(&self, kind: ResourceKind) -> u64 {
        self.lines.get(&kind).map(|l| l.consumed).unwrap_or(0)
    }
}
