//! Run Metrics Collection
//!
//! Aggregates model call counts, tokens, latency and estimated cost per
//! report run, broken down by stage.
//!
//! ## Usage
//!
//! ```ignore
//! let metrics = MetricsCollector::new("report-123");
//! metrics.record_call("briefing", &usage, cost_usd, latency_ms);
//! println!("{}", metrics.summary().display());
//! ```

use crate::ai::provider::TokenUsage;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

// =============================================================================
// Metrics Collector
// =============================================================================

/// Metrics for one report run.
///
/// Counters are atomic; the per-stage table sits behind a RwLock.
pub struct MetricsCollector {
    report_id: String,
    start_time: Instant,
    api_calls: AtomicU32,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    total_latency_ms: AtomicU64,
    /// Stored as microdollars for atomic ops
    total_cost_micros: AtomicU64,
    stages: RwLock<Vec<StageMetrics>>,
}

/// Metrics for one stage
#[derive(Debug, Clone, Default)]
pub struct StageMetrics {
    pub name: String,
    pub api_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub cost_usd: f64,
}

/// Summary statistics for a run
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub report_id: String,
    pub total_duration_ms: u64,
    pub api_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub avg_latency_ms: f64,
    pub total_cost_usd: f64,
    pub stages: Vec<StageMetrics>,
}

impl MetricsCollector {
    pub fn new(report_id: impl Into<String>) -> Self {
        Self {
            report_id: report_id.into(),
            start_time: Instant::now(),
            api_calls: AtomicU32::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            total_cost_micros: AtomicU64::new(0),
            stages: RwLock::new(Vec::new()),
        }
    }

    /// Record one model call attributed to `stage`
    pub fn record_call(&self, stage: &str, usage: &TokenUsage, cost_usd: f64, latency_ms: u64) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(usage.input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(usage.output_tokens as u64, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency_ms, Ordering::Relaxed);
        let cost_micros = (cost_usd * 1_000_000.0).round() as u64;
        self.total_cost_micros
            .fetch_add(cost_micros, Ordering::Relaxed);

        let mut stages = self.stages.write().unwrap_or_else(|poisoned| {
            tracing::error!("Metrics stages RwLock poisoned, recovering");
            poisoned.into_inner()
        });
        let entry = match stages.iter().position(|s| s.name == stage) {
            Some(idx) => &mut stages[idx],
            None => {
                stages.push(StageMetrics {
                    name: stage.to_string(),
                    ..Default::default()
                });
                let last = stages.len() - 1;
                &mut stages[last]
            }
        };
        entry.api_calls += 1;
        entry.input_tokens += usage.input_tokens as u64;
        entry.output_tokens += usage.output_tokens as u64;
        entry.latency_ms += latency_ms;
        entry.cost_usd += cost_usd;
    }

    pub fn snapshot(&self) -> MetricsSummary {
        let api_calls = self.api_calls.load(Ordering::Relaxed);
        let input_tokens = self.input_tokens.load(Ordering::Relaxed);
        let output_tokens = self.output_tokens.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        let total_cost_micros = self.total_cost_micros.load(Ordering::Relaxed);

        let avg_latency = if api_calls > 0 {
            total_latency as f64 / api_calls as f64
        } else {
            0.0
        };

        let stages = self
            .stages
            .read()
            .unwrap_or_else(|poisoned| {
                tracing::error!("Metrics stages RwLock poisoned on read, recovering");
                poisoned.into_inner()
            })
            .clone();

        MetricsSummary {
            report_id: self.report_id.clone(),
            total_duration_ms: self.start_time.elapsed().as_millis() as u64,
            api_calls,
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            avg_latency_ms: avg_latency,
            total_cost_usd: total_cost_micros as f64 / 1_000_000.0,
            stages,
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        self.snapshot()
    }
}

impl MetricsSummary {
    /// Format summary for display
    pub fn display(&self) -> String {
        let mut out = format!(
            "Report: {}\n\
             Duration: {:.1}s\n\
             API Calls: {}\n\
             Tokens: {} (input: {}, output: {})\n\
             Avg Latency: {:.0}ms\n\
             Estimated Cost: ${:.4}",
            self.report_id,
            self.total_duration_ms as f64 / 1000.0,
            self.api_calls,
            self.total_tokens,
            self.input_tokens,
            self.output_tokens,
            self.avg_latency_ms,
            self.total_cost_usd
        );
        for stage in &self.stages {
            out.push_str(&format!(
                "\n  {:<20} calls={} tokens={} cost=${:.4}",
                stage.name,
                stage.api_calls,
                stage.input_tokens + stage.output_tokens,
                stage.cost_usd
            ));
        }
        out
    }
}

pub type SharedMetrics = Arc<MetricsCollector>;

pub fn create_shared_metrics(report_id: impl Into<String>) -> SharedMetrics {
    Arc::new(MetricsCollector::new(report_id))
}

// =============================================================================
// Tests
// =============================================================================
