pub mod answer;
pub mod config;
pub mod expire;
pub mod resume;
pub mod run;
pub mod status;

use crate::cli::ui::Output;
use crate::pipeline::{RunOutcome, StageName};

/// Print where a run stopped
pub(crate) fn print_outcome(out: &Output, outcome: &RunOutcome) {
    let state = outcome.state();
    let report_id = state.report_id();
    match outcome {
        RunOutcome::Completed(state) => {
            out.success(&format!("Report {} complete", report_id));
            if let Some(report) = &state.outputs.report_synthesis {
                out.field("Title", &report.title);
            }
        }
        RunOutcome::Failed { kind, .. } => {
            out.error(&format!("Report {} failed ({})", report_id, kind));
            out.field("Message", kind.user_message());
        }
        RunOutcome::AwaitingClarification {
            question, deadline, ..
        } => {
            out.warning(&format!("Report {} needs clarification", report_id));
            out.field("Question", question);
            out.field("Deadline", &deadline.to_rfc3339());
            out.info(&format!(
                "Answer with: reportloom answer {} \"<your answer>\"",
                report_id
            ));
        }
    }

    let skipped: Vec<&str> = state.skipped_stages.iter().map(StageName::as_str).collect();
    if !skipped.is_empty() {
        out.field("Skipped", &skipped.join(", "));
    }
    out.field(
        "Usage",
        &format!(
            "{} tokens over {} calls (${:.4})",
            state.usage.total(),
            state.usage.calls,
            state.usage.cost_usd
        ),
    );
}
