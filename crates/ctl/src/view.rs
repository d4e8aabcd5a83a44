//! Terminal output helpers for per-step outcomes and summaries.

use std::io::IsTerminal;

use common::proto::{RunReply, Status};

use crate::executor::Tally;

pub const SEPARATOR: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

pub fn color_enabled() -> bool {
    std::io::stdout().is_terminal()
}

pub fn colorize(text: &str, code: &str, enabled: bool) -> String {
    if enabled {
        format!("\x1b[{}m{}\x1b[0m", code, text)
    } else {
        text.to_string()
    }
}

/// One line per step outcome: "OK", "Changed", or a symbol-prefixed
/// failure with its cause.
pub fn print_step_outcome(indent: &str, reply: &RunReply, color: bool) {
    match reply.status {
        Status::Ok if reply.changed => {
            println!(
                "{indent}{} ({}ms)",
                colorize("Changed", "33", color),
                reply.duration_ms
            );
        }
        Status::Ok => {
            println!(
                "{indent}{} ({}ms)",
                colorize("OK", "32", color),
                reply.duration_ms
            );
        }
        Status::Failed => {
            println!(
                "{indent}{} (exit={}): {}",
                colorize("✗ Failed", "31", color),
                reply.exit_code,
                reply.stderr.trim()
            );
        }
        Status::Timeout => {
            println!("{indent}{}", colorize("✗ Timeout", "31", color));
        }
        Status::Error => {
            println!(
                "{indent}{}: {}",
                colorize("✗ Error", "31", color),
                reply.error
            );
        }
    }
}

pub fn print_summary(tally: &Tally) {
    println!("{SEPARATOR}");
    println!(
        "Summary: ok={} changed={} failed={}",
        tally.ok, tally.changed, tally.failed
    );
}
