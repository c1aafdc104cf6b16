//! Operator approval for control points reached during a CLI run.

use anyhow::{Context, Result};
use dialoguer::{Select, theme::ColorfulTheme};

use crate::staging::REJECT;

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Chosen(String),
    /// Chosen, and every later control point is auto-approved
    ChosenAll(String),
    Aborted,
}

/// A control point as presented to the operator.
#[derive(Debug, Clone)]
pub struct GatePrompt<'a> {
    pub stage: &'a str,
    pub options: &'a [String],
    pub preview: &'a serde_json::Value,
}

pub struct ApprovalGate {
    pub skip_all: bool,
}

/// The option picked without asking: the first that does not reject.
pub fn auto_choice(options: &[String]) -> Option<&str> {
    options
        .iter()
        .map(String::as_str)
        .find(|o| *o != REJECT)
        .or_else(|| options.first().map(String::as_str))
}

impl ApprovalGate {
    pub fn new(skip_all: bool) -> Self {
        Self { skip_all }
    }

    /// Decide a control point, prompting unless `--yes` was given.
    pub fn check(&mut self, prompt: &GatePrompt<'_>) -> Result<GateDecision> {
        if self.skip_all {
            let Some(choice) = auto_choice(prompt.options) else {
                anyhow::bail!("Control point for '{}' offers no options", prompt.stage);
            };
            println!(
                "  {} {} (--yes flag)",
                console::style("Auto-approved").dim(),
                console::style(choice).cyan()
            );
            return Ok(GateDecision::Chosen(choice.to_string()));
        }

        self.prompt_user(prompt)
    }

    fn prompt_user(&mut self, prompt: &GatePrompt<'_>) -> Result<GateDecision> {
        if !prompt.preview.is_null() {
            let rendered = serde_json::to_string_pretty(prompt.preview)
                .context("Failed to render control point preview")?;
            println!("{}", console::style(rendered).dim());
        }

        let mut items: Vec<String> = prompt.options.to_vec();
        let auto = auto_choice(prompt.options).map(str::to_string);
        if let Some(auto) = &auto {
            items.push(format!("{} and auto-approve the rest (--yes)", auto));
        }
        items.push("Abort pipeline".to_string());

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Decision for stage '{}'", prompt.stage))
            .items(&items)
            .default(0)
            .interact()?;

        let options = prompt.options.len();
        match (selection, auto) {
            (i, _) if i < options => Ok(GateDecision::Chosen(prompt.options[i].clone())),
            (i, Some(auto)) if i == options => {
                self.skip_all = true;
                Ok(GateDecision::ChosenAll(auto))
            }
            _ => Ok(GateDecision::Aborted),
        }
    }
}
