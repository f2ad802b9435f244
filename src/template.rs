use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::SentinelConfig;
use crate::error::TemplateError;
use crate::types::{RetryContext, Task};

/// The fixed variable set exposed to phase templates. Anything else in
/// a template is a config error, not a silent passthrough.
const KNOWN_VARIABLES: &[&str] = &[
    "TASK_ID",
    "TASK_TITLE",
    "TASK_DESCRIPTION",
    "PHASE",
    "ITERATION",
    "WORKSPACE",
    "RETRY_CONTEXT",
];

/// Inputs for rendering one phase prompt.
pub struct TemplateVars<'a> {
    pub task: &'a Task,
    pub phase: &'a str,
    pub iteration: u32,
    pub workspace: &'a Path,
    pub retry_context: Option<&'a RetryContext>,
}

/// Loads per-phase templates from a configurable directory, falling
/// back to the built-in template when a phase has no file.
pub struct TemplateSet {
    dir: Option<PathBuf>,
    sentinel: SentinelConfig,
}

impl TemplateSet {
    pub fn new(dir: Option<PathBuf>, sentinel: SentinelConfig) -> Self {
        Self { dir, sentinel }
    }

    /// The marker configuration used both to instruct the agent and to
    /// extract its signal.
    pub fn sentinel(&self) -> &SentinelConfig {
        &self.sentinel
    }

    /// Render the full agent prompt for a phase iteration: the template
    /// body with all variables substituted, followed by the output
    /// contract naming the configured phase markers.
    pub fn render(&self, vars: &TemplateVars) -> Result<String, TemplateError> {
        let body = self.load(vars.phase)?;
        let rendered = substitute(&body, vars.phase, &variable_map(vars))?;
        Ok(format!(
            "{}\n\n{}",
            rendered.trim_end(),
            output_contract(&self.sentinel)
        ))
    }

    /// Load the template source for a phase: `<dir>/<phase>.md` when the
    /// directory is configured and the file exists, otherwise the
    /// built-in default.
    fn load(&self, phase: &str) -> Result<String, TemplateError> {
        if let Some(ref dir) = self.dir {
            let path = dir.join(format!("{}.md", phase));
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| TemplateError::Io {
                    path: path.display().to_string(),
                    detail: e.to_string(),
                });
            }
        }
        Ok(DEFAULT_TEMPLATE.to_string())
    }
}

fn variable_map(vars: &TemplateVars) -> HashMap<&'static str, String> {
    let mut map = HashMap::new();
    map.insert("TASK_ID", vars.task.id.clone());
    map.insert("TASK_TITLE", vars.task.title.clone());
    map.insert("TASK_DESCRIPTION", describe(vars.task));
    map.insert("PHASE", vars.phase.to_string());
    map.insert("ITERATION", vars.iteration.to_string());
    map.insert("WORKSPACE", vars.workspace.display().to_string());
    map.insert(
        "RETRY_CONTEXT",
        vars.retry_context.map(format_retry_context).unwrap_or_default(),
    );
    map
}

fn describe(task: &Task) -> String {
    match task.spec_text {
        Some(ref spec) if !spec.trim().is_empty() => {
            format!("{}\n\n## Spec\n\n{}", task.description, spec)
        }
        _ => task.description.clone(),
    }
}

/// Format a retry handoff as a prompt section the re-entered phase can
/// act on.
fn format_retry_context(ctx: &RetryContext) -> String {
    let mut section = format!(
        "## Previous Attempt Failed\n\n\
        A later phase ({}) failed and execution was rewound to this phase \
        (attempt {} of retrying).\n\nFailure summary: {}",
        ctx.failing_phase,
        ctx.previous_attempt_count + 1,
        ctx.failure_summary,
    );
    if !ctx.diagnostic_excerpts.is_empty() {
        section.push_str("\n\nDiagnostics:\n");
        for excerpt in &ctx.diagnostic_excerpts {
            section.push_str(&format!("```\n{}\n```\n", excerpt));
        }
    }
    section
}

/// Substitute `{{NAME}}` tokens. Unknown names and unterminated tokens
/// are errors; the phase must not run with a malformed prompt.
fn substitute(
    template: &str,
    phase: &str,
    values: &HashMap<&'static str, String>,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| TemplateError::UnresolvedVariable {
            phase: phase.to_string(),
            name: after.chars().take(24).collect(),
        })?;
        let name = after[..end].trim();

        if !KNOWN_VARIABLES.contains(&name) {
            return Err(TemplateError::UnresolvedVariable {
                phase: phase.to_string(),
                name: name.to_string(),
            });
        }
        // Known variables always resolve; RETRY_CONTEXT renders empty
        // when no rewind happened.
        if let Some(value) = values.get(name) {
            out.push_str(value);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// The structured-output suffix appended to every rendered prompt. The
/// marker spellings come from config, never from the engine.
fn output_contract(sentinel: &SentinelConfig) -> String {
    format!(
        "## Output Contract\n\n\
        When the phase's work is fully done, print a line containing exactly:\n\n\
        {}\n\n\
        If you cannot proceed without a decision or missing input, print a line:\n\n\
        {} <one-line reason>\n\n\
        Print neither marker if the work is still in progress; you will be \
        invoked again with the same session.",
        sentinel.complete_marker, sentinel.blocked_marker,
    )
}

const DEFAULT_TEMPLATE: &str = "\
# Autonomous Phase Agent

You are running autonomously as part of the maestro task pipeline.
No human is available for questions; use your judgment.

## Task

- ID: {{TASK_ID}}
- Title: {{TASK_TITLE}}
- Phase: {{PHASE}} (iteration {{ITERATION}})
- Workspace: {{WORKSPACE}}

## Description

{{TASK_DESCRIPTION}}

{{RETRY_CONTEXT}}

## Instructions

Work only inside the workspace directory above. Carry out the `{{PHASE}}`
phase for this task, continuing from any prior iterations in this session.
";
