//! Error taxonomy for flow execution.

use std::path::PathBuf;

use thiserror::Error;

/// `(location, message, context, type)` as produced by settings validation.
pub type ValidationError = (Option<String>, String, Option<String>, Option<String>);

#[derive(Debug, Error)]
pub enum XedaError {
    #[error("{} error{} validating settings:\n{}", .0.len(), if .0.len() == 1 { "" } else { "s" }, format_validation_errors(.0))]
    SettingsInvalid(Vec<ValidationError>),

    #[error("executable `{exec}` for tool `{tool}` was not found on PATH ({searched})")]
    ExecutableMissing {
        exec: String,
        tool: String,
        searched: String,
    },

    #[error("`{}` exited with code {code}:\n{}", .command.join(" "), .stderr_tail.join("\n"))]
    ToolNonZeroExit {
        command: Vec<String>,
        code: i32,
        stderr_tail: Vec<String>,
    },

    #[error("`{}` exceeded its {timeout_seconds}s timeout", .command.join(" "))]
    TimeoutExceeded {
        command: Vec<String>,
        timeout_seconds: u64,
    },

    #[error("dependency flow `{flow_name}` failed")]
    DependencyFailure { flow_name: String },

    #[error("required report pattern not matched in {}: {pattern}", .report_path.display())]
    ReportParseFailure { report_path: PathBuf, pattern: String },

    #[error("fatal flow error: {0}")]
    FlowFatal(String),

    #[error("cancelled")]
    Cancelled,

    #[error("flow `{0}` is not registered")]
    FlowNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|(loc, msg, ctx, typ)| {
            let mut s = String::new();
            if let Some(loc) = loc {
                s.push_str(&format!("{loc}:\n   "));
            }
            s.push_str(msg);
            if let Some(typ) = typ {
                s.push_str(&format!("\ntype: {typ}"));
            }
            if let Some(ctx) = ctx {
                s.push_str(&format!("\ncontext: {ctx}"));
            }
            s
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, XedaError>;
