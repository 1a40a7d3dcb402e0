//! Prompt Builder
//!
//! Standardized system-instruction construction for model stages.
//!
//! ## Layout
//!
//! 1. **Role**: who the model is for this stage
//! 2. **Objectives**: numbered goals
//! 3. **Focus**: restrictions that keep the output on task
//! 4. **Anti-patterns**: explicit wrong/right pairs
//! 5. **Output schema**: the JSON shape the stage decoder expects

/// Prompt section types
#[derive(Debug, Clone)]
pub enum PromptSection {
    Role { expertise: String, task: String },
    Objectives(Vec<String>),
    Text {
        header: Option<String>,
        content: String,
    },
    Focus {
        target: String,
        restrictions: Vec<String>,
    },
    AntiPatterns { bad: Vec<String>, good: Vec<String> },
    /// JSON output contract; always rendered last
    Schema(String),
}

/// Builder for stage system instructions
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    sections: Vec<PromptSection>,
    schema: Option<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn role(mut self, expertise: &str, task: &str) -> Self {
        self.sections.push(PromptSection::Role {
            expertise: expertise.to_string(),
            task: task.to_string(),
        });
        self
    }

    pub fn objectives(mut self, objectives: &[&str]) -> Self {
        self.sections.push(PromptSection::Objectives(
            objectives.iter().map(|o| o.to_string()).collect(),
        ));
        self
    }

    /// Add text section with header
    pub fn section(mut self, header: &str, content: &str) -> Self {
        self.sections.push(PromptSection::Text {
            header: Some(header.to_string()),
            content: content.to_string(),
        });
        self
    }

    pub fn text(mut self, content: &str) -> Self {
        self.sections.push(PromptSection::Text {
            header: None,
            content: content.to_string(),
        });
        self
    }

    pub fn focus(mut self, target: &str, restrictions: &[&str]) -> Self {
        self.sections.push(PromptSection::Focus {
            target: target.to_string(),
            restrictions: restrictions.iter().map(|r| r.to_string()).collect(),
        });
        self
    }

    pub fn anti_patterns(mut self, bad: &[&str], good: &[&str]) -> Self {
        self.sections.push(PromptSection::AntiPatterns {
            bad: bad.iter().map(|b| b.to_string()).collect(),
            good: good.iter().map(|g| g.to_string()).collect(),
        });
        self
    }

    /// Set the JSON output schema (replaces any earlier one)
    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.trim().to_string());
        self
    }

    /// Build the final prompt string
    pub fn build(self) -> String {
        let mut prompt = String::new();

        let schema = self.schema.map(PromptSection::Schema);
        for section in self.sections.into_iter().chain(schema) {
            match section {
                PromptSection::Role { expertise, task } => {
                    prompt.push_str("<ROLE>\n");
                    prompt.push_str(&format!(
                        "You are an expert {} specializing in {}.\n",
                        expertise, task
                    ));
                    prompt.push_str("</ROLE>\n\n");
                }
                PromptSection::Objectives(objectives) => {
                    prompt.push_str("<OBJECTIVES>\n");
                    for (i, obj) in objectives.iter().enumerate() {
                        prompt.push_str(&format!("{}. {}\n", i + 1, obj));
                    }
                    prompt.push_str("</OBJECTIVES>\n\n");
                }
                PromptSection::Text { header, content } => {
                    if let Some(h) = header {
                        prompt.push_str(&format!("# {}\n\n", h));
                    }
                    prompt.push_str(&content);
                    prompt.push_str("\n\n");
                }
                PromptSection::Focus {
                    target,
                    restrictions,
                } => {
                    prompt.push_str("<FOCUS>\n");
                    prompt.push_str(&format!("IMPORTANT: Focus EXCLUSIVELY on: {}\n", target));
                    for restriction in restrictions {
                        prompt.push_str(&format!("- {}\n", restriction));
                    }
                    prompt.push_str("</FOCUS>\n\n");
                }
                PromptSection::AntiPatterns { bad, good } => {
                    prompt.push_str("<what_not_to_do>\n");
                    for example in bad {
                        prompt.push_str(&format!("WRONG: {}\n", example));
                    }
                    prompt.push_str("</what_not_to_do>\n\n");
                    prompt.push_str("<what_to_do>\n");
                    for example in good {
                        prompt.push_str(&format!("CORRECT: {}\n", example));
                    }
                    prompt.push_str("</what_to_do>\n\n");
                }
                PromptSection::Schema(schema) => {
                    prompt.push_str("<OUTPUT_FORMAT>\n");
                    prompt.push_str("Respond with a single JSON object and nothing else:\n");
                    prompt.push_str("```json\n");
                    prompt.push_str(&schema);
                    prompt.push_str("\n```\n");
                    prompt.push_str("</OUTPUT_FORMAT>\n\n");
                }
            }
        }

        prompt.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_prompt() {
        let prompt = PromptBuilder::new()
            .role("systems engineer", "thermal design")
            .objectives(&["Frame the problem", "Name the contradiction"])
            .build();

        assert!(prompt.contains("<ROLE>"));
        assert!(prompt.contains("systems engineer"));
        assert!(prompt.contains("1. Frame the problem"));
        assert!(prompt.contains("2. Name the contradiction"));
    }

    #[test]
    fn test_schema_renders_last() {
        let prompt = PromptBuilder::new()
            .schema(r#"{"summary": "string"}"#)
            .focus("the briefing", &["Do NOT invent sources"])
            .build();

        let focus = prompt.find("<FOCUS>").unwrap();
        let schema = prompt.find("<OUTPUT_FORMAT>").unwrap();
        assert!(focus < schema);
        assert!(prompt.ends_with("</OUTPUT_FORMAT>"));
    }

    #[test]
    fn test_anti_patterns() {
        let prompt = PromptBuilder::new()
            .anti_patterns(&["Vague concepts"], &["Named mechanisms"])
            .build();

        assert!(prompt.contains("WRONG: Vague concepts"));
        assert!(prompt.contains("CORRECT: Named mechanisms"));
    }
}
