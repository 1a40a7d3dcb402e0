//! Status Command
//!
//! Display the poll view of one report.

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::pipeline::ReportSink;
use crate::types::{LoomError, ReportId, Result};

pub async fn run(ctx: &CommandContext, report_id: &str, format: &str) -> Result<()> {
    let report_id = ReportId::new(report_id);
    let view = ctx
        .db
        .report_status(&report_id)
        .await?
        .ok_or_else(|| LoomError::NotFound(format!("report {}", report_id)))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&view)?),
        "yaml" => print!("{}", serde_yaml::to_string(&view)?),
        "text" => Output::new().status(&view),
        other => {
            return Err(LoomError::Config(format!(
                "Invalid format '{}'. Valid values: text, json, yaml",
                other
            )));
        }
    }
    Ok(())
}
