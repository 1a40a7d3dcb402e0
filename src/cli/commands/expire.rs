//! Expire Command
//!
//! Fail every report whose clarification deadline has passed.

use chrono::Utc;

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::pipeline::expire_overdue;
use crate::types::Result;

pub async fn run(ctx: &CommandContext) -> Result<()> {
    let out = Output::new();
    let expired = expire_overdue(ctx.db.as_ref(), Utc::now()).await?;

    if expired.is_empty() {
        out.info("No overdue clarification waits");
    } else {
        out.warning(&format!("Expired {} report(s)", expired.len()));
        for report_id in &expired {
            println!("  {}", report_id);
        }
    }
    Ok(())
}
