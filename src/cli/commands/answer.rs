//! Answer Command
//!
//! Store a clarification answer. A run parked with `--wait` in another
//! process picks it up on its next storage poll; a detached run continues
//! on `resume` (or immediately with `--resume`). Answers after the deadline
//! are rejected and the report is marked expired.

use std::path::PathBuf;

use crate::cli::commands::print_outcome;
use crate::cli::ui::Output;
use crate::cli::util::{CommandContext, load_retriever};
use crate::pipeline::{self, WaitMode};
use crate::types::{ReportId, Result};

pub async fn run(
    ctx: &CommandContext,
    report_id: &str,
    answer: &str,
    resume: bool,
    corpus: Option<PathBuf>,
) -> Result<()> {
    let out = Output::new();
    let report_id = ReportId::new(report_id);

    // No in-process waiter here; a late reply expires the report
    pipeline::record_answer(ctx.db.as_ref(), &report_id, answer, false).await?;
    out.success(&format!("Answer recorded for report {}", report_id));

    if resume {
        let orchestrator = ctx.orchestrator(load_retriever(corpus.as_deref())?, WaitMode::Detach)?;
        let outcome = orchestrator.resume(&report_id).await?;
        print_outcome(&out, &outcome);
    }
    Ok(())
}
