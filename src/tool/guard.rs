//! Destructive command detection for the shell tool.
//!
//! Commands matching a dangerous pattern are rejected outright, regardless of
//! the active approval mode.

use std::borrow::Cow;

/// Result of command analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRisk {
    Safe,
    Dangerous { reason: Cow<'static, str> },
}

impl CommandRisk {
    #[must_use]
    pub fn is_dangerous(&self) -> bool {
        matches!(self, Self::Dangerous { .. })
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Safe => None,
            Self::Dangerous { reason } => Some(reason),
        }
    }
}

/// Analyze a shell command for destructive patterns.
#[must_use]
pub fn analyze_command(command: &str) -> CommandRisk {
    let cmd = command.trim();
    let lower = cmd.to_lowercase();

    if is_rm_force_recursive(&lower) {
        return dangerous("rm with force and recursive flags can delete entire directories");
    }

    if lower == "sudo" || lower.starts_with("sudo ") || lower.contains("| sudo ") {
        return dangerous("sudo escalates privileges");
    }

    if lower.contains("mkfs") {
        return dangerous("mkfs formats and erases the target device");
    }

    if lower.contains("dd ") && lower.contains("if=") {
        return dangerous("dd performs raw device-level copies");
    }

    if lower.starts_with("shutdown") || lower.contains(" shutdown") || lower.starts_with("reboot")
    {
        return dangerous("shutdown/reboot halts the machine");
    }

    if cmd.contains(":(){ :|:& };:") || cmd.contains(":(){:|:&};:") {
        return dangerous("fork bomb will crash the system");
    }

    if lower.contains("> /dev/sd") || lower.contains("> /dev/nvme") || lower.contains("> /dev/hd")
    {
        return dangerous("writing directly to a device can corrupt the filesystem");
    }

    if is_pipe_to_shell(&lower) {
        return dangerous("executing remote script without inspection");
    }

    CommandRisk::Safe
}

fn dangerous(reason: &'static str) -> CommandRisk {
    CommandRisk::Dangerous {
        reason: Cow::Borrowed(reason),
    }
}

/// Combined (`-rf`) or separate (`-r … -f`, `--recursive --force`) flags.
fn is_rm_force_recursive(lower: &str) -> bool {
    if !lower.starts_with("rm") && !lower.contains(" rm ") && !lower.contains(";rm ") {
        return false;
    }

    let has_combined = lower.split_whitespace().any(|arg| {
        arg.starts_with('-') && !arg.starts_with("--") && arg.contains('r') && arg.contains('f')
    });
    let has_force = lower.contains(" -f") || lower.contains("--force");
    let has_recursive = lower.contains(" -r") || lower.contains("--recursive");

    has_combined || (has_force && has_recursive)
}

fn is_pipe_to_shell(lower: &str) -> bool {
    let has_download = lower.contains("curl ") || lower.contains("wget ");
    let has_pipe_exec = lower.contains("| bash")
        || lower.contains("|bash")
        || lower.contains("| sh")
        || lower.contains("|sh")
        || lower.contains("| zsh");

    has_download && has_pipe_exec
}
