//! Per-Run Token Budget Guard
//!
//! Cumulative token counter with a hard ceiling. Every model call's usage is
//! recorded here; crossing the ceiling is a terminal error for the run.
//!
//! The counter only ever grows. A resumed run seeds it from the usage
//! persisted with the pipeline state so completed stages are not charged
//! twice and are not forgotten either.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::ai::provider::TokenUsage;
use crate::constants::budget as budget_constants;

// =============================================================================
// Error Types
// =============================================================================

/// Ceiling crossed after recording a stage's usage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetExceeded {
    /// Stage whose call pushed the counter over
    pub stage: String,
    pub ceiling: u64,
    /// Cumulative value after the offending call was added
    pub consumed: u64,
}

impl std::fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Token budget exceeded in {}: {}/{}",
            self.stage, self.consumed, self.ceiling
        )
    }
}

impl std::error::Error for BudgetExceeded {}

// =============================================================================
// Cumulative Usage
// =============================================================================

/// Sum of every model call so far in a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CumulativeUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u32,
    pub cost_usd: f64,
}

impl CumulativeUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// New value with one more call folded in
    pub fn plus(self, usage: &TokenUsage, cost_usd: f64) -> Self {
        Self {
            input_tokens: self.input_tokens + usage.input_tokens as u64,
            output_tokens: self.output_tokens + usage.output_tokens as u64,
            calls: self.calls + 1,
            cost_usd: self.cost_usd + cost_usd,
        }
    }

    pub fn merge(self, other: &CumulativeUsage) -> Self {
        Self {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            calls: self.calls + other.calls,
            cost_usd: self.cost_usd + other.cost_usd,
        }
    }
}

// =============================================================================
// Token Budget Guard
// =============================================================================

#[derive(Debug)]
pub struct TokenBudgetGuard {
    ceiling: u64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    calls: AtomicU32,
    warning_threshold: f64,
    critical_threshold: f64,
    warning_emitted: AtomicBool,
    critical_emitted: AtomicBool,
}

impl TokenBudgetGuard {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            calls: AtomicU32::new(0),
            warning_threshold: budget_constants::WARNING_THRESHOLD,
            critical_threshold: budget_constants::CRITICAL_THRESHOLD,
            warning_emitted: AtomicBool::new(false),
            critical_emitted: AtomicBool::new(false),
        }
    }

    /// Guard for a resumed run, seeded with what was already spent
    pub fn resume(ceiling: u64, spent: &CumulativeUsage) -> Self {
        let guard = Self::new(ceiling);
        guard
            .input_tokens
            .store(spent.input_tokens, Ordering::Relaxed);
        guard
            .output_tokens
            .store(spent.output_tokens, Ordering::Relaxed);
        guard.calls.store(spent.calls, Ordering::Relaxed);
        // Thresholds already crossed were reported by the earlier process
        let util = guard.utilization();
        guard
            .warning_emitted
            .store(util >= guard.warning_threshold, Ordering::Relaxed);
        guard
            .critical_emitted
            .store(util >= guard.critical_threshold, Ordering::Relaxed);
        guard
    }

    /// Add one call's usage, then check the ceiling.
    ///
    /// The usage stays counted even when this returns an error.
    pub fn record(&self, stage: &str, usage: &TokenUsage) -> Result<(), BudgetExceeded> {
        self.input_tokens
            .fetch_add(usage.input_tokens as u64, Ordering::SeqCst);
        self.output_tokens
            .fetch_add(usage.output_tokens as u64, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::Relaxed);

        let consumed = self.consumed();
        self.check_thresholds(consumed);

        if consumed > self.ceiling {
            tracing::error!(
                stage,
                consumed,
                ceiling = self.ceiling,
                "Token budget exceeded, aborting run"
            );
            return Err(BudgetExceeded {
                stage: stage.to_string(),
                ceiling: self.ceiling,
                consumed,
            });
        }
        Ok(())
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn consumed(&self) -> u64 {
        self.input_tokens.load(Ordering::SeqCst) + self.output_tokens.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.consumed())
    }

    pub fn utilization(&self) -> f64 {
        if self.ceiling == 0 {
            return 0.0;
        }
        self.consumed() as f64 / self.ceiling as f64
    }

    fn check_thresholds(&self, consumed: u64) {
        let util = if self.ceiling == 0 {
            1.0
        } else {
            consumed as f64 / self.ceiling as f64
        };
        if util >= self.critical_threshold && !self.critical_emitted.swap(true, Ordering::Relaxed) {
            self.warning_emitted.store(true, Ordering::Relaxed);
            tracing::error!(
                consumed,
                ceiling = self.ceiling,
                "CRITICAL: Token budget at critical threshold"
            );
        } else if util >= self.warning_threshold
            && !self.warning_emitted.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                consumed,
                ceiling = self.ceiling,
                "Token budget approaching limit"
            );
        }
    }

    pub fn stats(&self) -> BudgetStats {
        let consumed = self.consumed();
        let utilization = self.utilization();
        BudgetStats {
            ceiling: self.ceiling,
            consumed,
            remaining: self.remaining(),
            calls: self.calls.load(Ordering::Relaxed),
            utilization,
            is_warning: utilization >= self.warning_threshold,
            is_critical: utilization >= self.critical_threshold,
        }
    }
}

pub type SharedBudget = Arc<TokenBudgetGuard>;

// =============================================================================
// Budget Statistics
// =============================================================================

#[derive(Debug, Clone)]
pub struct BudgetStats {
    pub ceiling: u64,
    pub consumed: u64,
    pub remaining: u64,
    pub calls: u32,
    pub utilization: f64,
    pub is_warning: bool,
    pub is_critical: bool,
}

impl BudgetStats {
    pub fn summary(&self) -> String {
        let status = if self.is_critical {
            " [CRITICAL]"
        } else if self.is_warning {
            " [WARNING]"
        } else {
            ""
        };
        format!(
            "Budget: {}/{} ({:.1}%){} | Remaining: {} | Calls: {}",
            self.consumed,
            self.ceiling,
            self.utilization * 100.0,
            status,
            self.remaining,
            self.calls
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
