//! Resume Command
//!
//! Continue a persisted report at its first unsettled stage.

use std::path::PathBuf;

use crate::cli::commands::print_outcome;
use crate::cli::ui::Output;
use crate::cli::util::{CommandContext, load_retriever};
use crate::pipeline::WaitMode;
use crate::types::{ReportId, Result};

pub async fn run(
    ctx: &CommandContext,
    report_id: &str,
    corpus: Option<PathBuf>,
    wait: bool,
) -> Result<()> {
    let out = Output::new();
    let wait_mode = if wait { WaitMode::Block } else { WaitMode::Detach };
    let orchestrator = ctx.orchestrator(load_retriever(corpus.as_deref())?, wait_mode)?;

    let outcome = orchestrator.resume(&ReportId::new(report_id)).await?;
    print_outcome(&out, &outcome);
    Ok(())
}
