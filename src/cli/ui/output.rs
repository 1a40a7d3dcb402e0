use console::style;

use crate::pipeline::{ReportStatus, ReportStatusView};

pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", style("✓").green(), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red(), message);
    }

    pub fn warning(&self, message: &str) {
        println!("{} {}", style("⚠").yellow(), message);
    }

    pub fn info(&self, message: &str) {
        println!("{} {}", style("ℹ").blue(), message);
    }

    pub fn header(&self, message: &str) {
        println!("\n{}", style(message).bold().underlined());
    }

    pub fn section(&self, message: &str) {
        println!("\n{}", style(message).bold());
        println!("{}", "─".repeat(40));
    }

    pub fn field(&self, label: &str, value: &str) {
        println!("  {:<14} {}", style(label).dim(), value);
    }

    /// Human-readable status block
    pub fn status(&self, view: &ReportStatusView) {
        self.header(&format!("Report {}", view.report_id));
        self.field("Status", &status_label(view.status));
        if let Some(step) = &view.current_step {
            self.field("Step", step);
        }
        self.field("Progress", &format!("{}%", view.percent_complete));
        self.field(
            "Usage",
            &format!("{} tokens (${:.4})", view.total_tokens, view.cost_usd),
        );
        self.field("Updated", &view.updated_at);

        if let Some(question) = &view.clarification_question {
            self.section("Clarification needed");
            println!("{}", question);
            println!(
                "\nAnswer with: reportloom answer {} \"<your answer>\"",
                view.report_id
            );
        }
        if let Some(message) = &view.error_message {
            self.section("Error");
            println!("{}", message);
        }
        if let Some(report) = &view.report {
            self.section(&report.title);
            println!("{}\n", report.executive_summary);
            println!("{}", report.body_markdown);
            if !report.recommendations.is_empty() {
                self.section("Recommendations");
                for (i, rec) in report.recommendations.iter().enumerate() {
                    println!("{}. {}", i + 1, rec);
                }
            }
        }
    }
}

fn status_label(status: ReportStatus) -> String {
    let label = status.as_str();
    match status {
        ReportStatus::Complete => style(label).green().to_string(),
        ReportStatus::Failed => style(label).red().to_string(),
        ReportStatus::Clarifying => style(label).yellow().to_string(),
        ReportStatus::Processing => style(label).cyan().to_string(),
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}
