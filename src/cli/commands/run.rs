//! Run Command
//!
//! Start a new report from text (or `@file`) plus optional images.
//!
//! Usage:
//!   reportloom run --input "..." [--image sketch.png]... [--report-id ID] [--corpus corpus.json] [--wait]

use std::path::PathBuf;

use crate::ai::ImageAttachment;
use crate::cli::commands::print_outcome;
use crate::cli::ui::Output;
use crate::cli::util::{CommandContext, load_retriever, read_input};
use crate::pipeline::{ReportTrigger, WaitMode};
use crate::types::{ReportId, Result};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub input: String,
    pub images: Vec<PathBuf>,
    pub report_id: Option<String>,
    pub corpus: Option<PathBuf>,
    /// Block on the clarification gate instead of returning
    pub wait: bool,
    pub account_id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
}

pub async fn run(ctx: &CommandContext, options: RunOptions) -> Result<()> {
    let out = Output::new();

    let user_input = read_input(&options.input)?;
    let images = options
        .images
        .iter()
        .map(|path| ImageAttachment::from_path(path))
        .collect::<Result<Vec<_>>>()?;

    let report_id = options
        .report_id
        .map(ReportId::new)
        .unwrap_or_else(ReportId::generate);
    let conversation_id = options
        .conversation_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let retriever = load_retriever(options.corpus.as_deref())?;
    let wait_mode = if options.wait {
        WaitMode::Block
    } else {
        WaitMode::Detach
    };
    let orchestrator = ctx.orchestrator(retriever, wait_mode)?;

    out.info(&format!("Starting report {}", report_id));
    let outcome = orchestrator
        .start(ReportTrigger {
            conversation_id,
            report_id,
            account_id: options.account_id,
            user_id: options.user_id,
            user_input,
            images,
        })
        .await?;

    print_outcome(&out, &outcome);
    Ok(())
}
