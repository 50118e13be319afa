//! Reviewer persona configuration.
//!
//! Personas are owned and edited outside the core; the review engine receives
//! one as an immutable value per invocation. Fields are enumerated and
//! validated at the config boundary so the core never sees a free-form blob.

use serde::{Deserialize, Serialize};

use super::Severity;

/// Review voice for generated comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Strict,
    Balanced,
    Encouraging,
}

/// Thematic areas the persona concentrates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FocusArea {
    Correctness,
    Security,
    Performance,
    Style,
    Tests,
    Docs,
}

impl FocusArea {
    pub fn as_str(self) -> &'static str {
        match self {
            FocusArea::Correctness => "correctness",
            FocusArea::Security => "security",
            FocusArea::Performance => "performance",
            FocusArea::Style => "style",
            FocusArea::Tests => "tests",
            FocusArea::Docs => "docs",
        }
    }
}

/// A named reviewer configuration (`[persona.<name>]` in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Persona {
    /// Filled from the config table key; not read from TOML.
    #[serde(skip)]
    pub name: String,
    pub tone: Tone,
    /// Areas the review prompt emphasizes. Must not be empty.
    pub focus_areas: Vec<FocusArea>,
    /// Findings below this severity are dropped before publishing.
    pub severity_threshold: Severity,
    /// Hard cap on published findings per review.
    pub max_findings: usize,
    /// Free-form extra instructions appended to the prompt.
    pub instructions: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            tone: Tone::Balanced,
            focus_areas: vec![FocusArea::Correctness, FocusArea::Security],
            severity_threshold: Severity::Note,
            max_findings: 20,
            instructions: String::new(),
        }
    }
}

impl Persona {
    /// Boundary validation — called once at config load.
    pub fn validate(&self) -> Result<(), String> {
        if self.focus_areas.is_empty() {
            return Err("focus_areas must not be empty".into());
        }
        if self.max_findings == 0 {
            return Err("max_findings must be at least 1".into());
        }
        Ok(())
    }

    /// Persona section of the review prompt.
    pub fn prompt_instructions(&self) -> String {
        let tone = match self.tone {
            Tone::Strict => "Be strict: call out every defect plainly.",
            Tone::Balanced => "Be balanced: flag real problems, skip nitpicks.",
            Tone::Encouraging => {
                "Be encouraging: note what works, frame problems constructively."
            }
        };
        let areas = self
            .focus_areas
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let mut out = format!("{tone}\nFocus on: {areas}.");
        if !self.instructions.is_empty() {
            out.push('\n');
            out.push_str(&self.instructions);
        }
        out
    }
}
