//! Paths a tool call would write to.
//!
//! The fs tool names its target in `path`. Shell commands and some git
//! subcommands write too: redirections, `tee`, `dd of=`, the destination of
//! `cp`/`mv`, `git diff --output`. Those are recovered here so the write-root
//! rule covers them. The scan is lexical and errs toward reporting a target.

use keel_core::{ToolCall, ToolKind};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Filesystem operations that never mutate state.
pub const FS_READ_OPERATIONS: [&str; 3] = ["read", "list", "exists"];

/// Sinks that discard or pass through output.
const HARMLESS_SINKS: [&str; 3] = ["/dev/null", "/dev/stdout", "/dev/stderr"];

/// Git subcommands that accept an output file or directory.
const GIT_OUTPUT_SUBCOMMANDS: [&str; 10] = [
    "diff",
    "log",
    "show",
    "format-patch",
    "diff-tree",
    "diff-files",
    "diff-index",
    "range-diff",
    "whatchanged",
    "archive",
];

/// Every path `call` would create, modify or remove, as written in the call.
///
/// Relative paths are joined to an absolute `cwd` argument when the call has
/// one; otherwise they are returned as-is.
pub fn write_targets(call: &ToolCall) -> Vec<String> {
    let raw = match call.tool {
        ToolKind::Fs if !FS_READ_OPERATIONS.contains(&call.operation.as_str()) => {
            return vec![call.str_arg("path").to_string()];
        }
        ToolKind::Shell => shell_targets(call.str_arg("command")),
        ToolKind::Git if GIT_OUTPUT_SUBCOMMANDS.contains(&call.operation.as_str()) => {
            git_output_targets(&git_args(call))
        }
        _ => return Vec::new(),
    };

    let cwd = Path::new(call.str_arg("cwd"));
    raw.into_iter()
        .filter(|t| !HARMLESS_SINKS.contains(&t.as_str()))
        .map(|t| {
            if !Path::new(&t).is_absolute() && cwd.is_absolute() {
                cwd.join(&t).display().to_string()
            } else {
                t
            }
        })
        .collect()
}

fn git_args(call: &ToolCall) -> Vec<&str> {
    call.arguments["args"]
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default()
}

fn git_output_targets(args: &[&str]) -> Vec<String> {
    let mut targets = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (key, value) = match arg.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (*arg, None),
        };
        let long_output = key == "--output"
            || (key.len() > "--output-".len() && "--output-directory".starts_with(key));
        if long_output || key == "-o" {
            match value {
                Some(v) => targets.push(v.to_string()),
                None => {
                    if let Some(next) = iter.next() {
                        targets.push((*next).to_string());
                    }
                }
            }
        } else if let Some(attached) = arg.strip_prefix("-o").filter(|_| !arg.starts_with("--")) {
            targets.push(attached.to_string());
        }
    }
    targets
}

#[allow(clippy::expect_used)]
fn redirect_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(&>>?|[0-9]*<>|[0-9]*>>?\|?)(&)?\s*([^\s;&|<>()]+)"#)
            .expect("redirect regex is valid")
    })
}

#[allow(clippy::expect_used)]
fn command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(tee|dd|cp|mv|install|ln|touch|mkdir|rm|rmdir|chmod|chown|chgrp)\b([^;&|<>()\n]*)",
        )
        .expect("command regex is valid")
    })
}

fn unquote(s: &str) -> String {
    s.trim_matches(|c| c == '"' || c == '\'').to_string()
}

/// Write targets of a shell command line.
pub fn shell_targets(command: &str) -> Vec<String> {
    let mut targets = Vec::new();

    for caps in redirect_re().captures_iter(command) {
        let target = unquote(&caps[3]);
        let duplicates_fd = caps.get(2).is_some()
            && (target == "-" || target.chars().all(|c| c.is_ascii_digit()));
        if !duplicates_fd && !target.is_empty() {
            targets.push(target);
        }
    }

    for caps in command_re().captures_iter(command) {
        let operands: Vec<String> = caps[2]
            .split_whitespace()
            .filter(|w| !w.starts_with('-'))
            .map(unquote)
            .collect();
        let words: Vec<&str> = caps[2].split_whitespace().collect();
        match &caps[1] {
            "tee" | "touch" | "mkdir" | "rm" | "rmdir" => targets.extend(operands),
            "dd" => targets.extend(
                words
                    .iter()
                    .filter_map(|w| w.strip_prefix("of="))
                    .map(unquote),
            ),
            "cp" | "mv" | "install" | "ln" => {
                let explicit = words.iter().enumerate().find_map(|(i, w)| {
                    if let Some(dir) = w.strip_prefix("--target-directory=") {
                        Some(unquote(dir))
                    } else if *w == "-t" {
                        words.get(i + 1).map(|d| unquote(d))
                    } else {
                        None
                    }
                });
                match explicit {
                    Some(dir) => targets.push(dir),
                    None => targets.extend(operands.last().cloned()),
                }
            }
            // The first operand is a mode or an owner.
            _ => targets.extend(operands.into_iter().skip(1)),
        }
    }
    targets
}
