//! Terminal output helpers.

use colored::Colorize;

pub fn check_ok(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

pub fn check_warn(msg: &str) {
    println!("  {} {}", "-".bright_yellow(), msg.yellow());
}

pub fn check_fail(msg: &str) {
    println!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

pub fn success(msg: &str) {
    println!("  {} {}", "\u{2714}".bright_green(), msg);
}

/// Errors go to stderr so piped output stays clean.
pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

/// Section header: ">> Title" in cyan.
pub fn section(title: &str) {
    println!("  {} {}", ">>".bright_cyan().bold(), title.bold());
}

/// Key-value display: "  Label:       value".
pub fn kv(label: &str, value: &str) {
    println!("    {:<14} {}", format!("{label}:").dimmed(), value);
}

pub fn hint(msg: &str) {
    println!("    {}", msg.dimmed());
}
