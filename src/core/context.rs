//! Wildcard context expansion.
//!
//! A unit's input pattern may reference `{study}`, `{subject}` and `{run}`.
//! Placeholders are resolved left to right: a concrete context value is
//! substituted in place, a wildcard value fans out into one branch per
//! sub-directory found under the path prefix preceding the placeholder.

use std::path::Path;

use thiserror::Error;
use walkdir::WalkDir;

use crate::core::task::{replace_placeholder, ContextLevel, Task, TaskStatus, PLACEHOLDER, WILDCARD};

/// Reasons a task template cannot be expanded.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Placeholder that is not a context level.
    #[error("variable {{{variable}}} is not a valid variable name")]
    UnknownVariable {
        /// Placeholder text without braces.
        variable: String,
    },
    /// The context carries no value for a referenced level.
    #[error("no context value for variable {{{variable}}}")]
    MissingValue {
        /// Placeholder text without braces.
        variable: String,
    },
    /// Output pattern references a level the input pattern never fixes.
    #[error("output directory of unit {unit_id} has a variable that is redundant with the input paths")]
    RedundantOutputVariable {
        /// Offending unit.
        unit_id: u64,
    },
    /// Listing a wildcard level failed.
    #[error("failed to list {path}: {source}")]
    Listing {
        /// Directory being listed.
        path: String,
        /// Underlying walk error.
        #[source]
        source: walkdir::Error,
    },
    /// The wildcard matched nothing.
    #[error("pattern {pattern} matched no directories")]
    NoMatches {
        /// Input pattern of the template.
        pattern: String,
    },
}

/// Expand `task` into concrete tasks whose input paths carry no placeholder.
///
/// Every returned task has id 0 and status NEW; storage assigns ids when the
/// replacement is persisted.
///
/// # Errors
///
/// See [`ContextError`]. An expansion that yields no task is an error.
pub fn expand(task: &Task) -> Result<Vec<Task>, ContextError> {
    let mut template = task.with_status(TaskStatus::New);
    template.id = 0;
    let mut expanded = Vec::new();
    expand_into(template, &mut expanded)?;
    if expanded.is_empty() {
        return Err(ContextError::NoMatches {
            pattern: task.unit.input_paths.clone(),
        });
    }
    Ok(expanded)
}

fn expand_into(task: Task, out: &mut Vec<Task>) -> Result<(), ContextError> {
    let input = task.unit.input_paths.clone();
    let Some(caps) = PLACEHOLDER.captures(&input) else {
        if PLACEHOLDER.is_match(&task.unit.output_dir) {
            return Err(ContextError::RedundantOutputVariable {
                unit_id: task.unit.id,
            });
        }
        out.push(task);
        return Ok(());
    };

    let (start, end) = caps.get(0).map_or((0, 0), |m| (m.start(), m.end()));
    let variable = caps[1].to_owned();
    let level = ContextLevel::parse(&variable).ok_or_else(|| ContextError::UnknownVariable {
        variable: variable.clone(),
    })?;
    let prefix = &input[..start];
    let suffix = &input[end..];
    let value = task
        .context
        .get(level)
        .map(str::to_owned)
        .ok_or_else(|| ContextError::MissingValue { variable })?;

    if value != WILDCARD {
        let next = bind(&task, level, format!("{prefix}{value}"), suffix, &value);
        return expand_into(next, out);
    }

    let dir = if prefix.is_empty() { "." } else { prefix };
    for sub_dir in list_sub_dirs(dir)? {
        let Some(name) = sub_dir.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };
        let base = sub_dir.to_string_lossy().replace('\\', "/");
        let next = bind(&task, level, base, suffix, &name);
        expand_into(next, out)?;
    }
    Ok(())
}

/// Copy of `task` with `level` fixed to `value` everywhere.
fn bind(task: &Task, level: ContextLevel, head: String, suffix: &str, value: &str) -> Task {
    let mut next = task.clone();
    next.unit.input_paths = head + &replace_placeholder(suffix, level, value);
    next.unit.output_dir = replace_placeholder(&next.unit.output_dir, level, value);
    for parameter in &mut next.unit.parameters {
        parameter.value = replace_placeholder(&parameter.value, level, value);
    }
    next.context.set(level, value);
    next
}

fn list_sub_dirs(dir: &str) -> Result<Vec<std::path::PathBuf>, ContextError> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(Path::new(dir))
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|source| ContextError::Listing {
            path: dir.to_owned(),
            source,
        })?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }
    Ok(dirs)
}
