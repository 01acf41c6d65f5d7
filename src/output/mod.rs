//! Terminal presentation for deploy progress and operator reports.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::deploy::attempt::Outcome;
use crate::deploy::phase::Phase;

/// Banner printed at every state-machine transition.
pub fn phase(p: Phase, msg: &str) {
    let tag = style(format!("[{}]", p)).bold().cyan();
    if msg.is_empty() {
        println!("{}", tag);
    } else {
        println!("{} {}", tag, msg);
    }
}

/// Numbered banner for the rollback controller's step sequence.
pub fn step(num: usize, total: usize, msg: &str) {
    println!(
        "{} {}",
        style(format!("[{}/{}]", num, total)).bold().cyan(),
        msg
    );
}

/// Spinner shown while the monitoring window is open.
pub fn monitor_spinner(window_secs: u64, interval_secs: u64) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.cyan} {msg}")
            .unwrap(),
    );
    pb.set_message(format!(
        "Monitoring for {}s (sampling every {}s)",
        window_secs, interval_secs
    ));
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Terminal outcome line for the attempt report, colored by severity.
pub fn outcome(o: Outcome) {
    let mark = match o {
        Outcome::Succeeded => style("✓").bold().green(),
        Outcome::RolledBack | Outcome::Aborted => style("!").bold().yellow(),
        Outcome::FailedUnrecoverable => style("✗").bold().red(),
    };
    println!("{} outcome: {}", mark, style(o.to_string()).bold());
}

/// Aligned key/value line for the attempt report. Padding happens before
/// styling so escape codes do not skew the column.
pub fn detail(label: &str, value: impl std::fmt::Display) {
    let padded = format!("{:<14}", format!("{}:", label));
    println!("  {} {}", style(padded).dim(), value);
}

pub fn success(msg: &str) {
    println!("{} {}", style("✓").bold().green(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", style("✗").bold().red(), msg);
}

pub fn warning(msg: &str) {
    eprintln!("{} {}", style("!").bold().yellow(), msg);
}

pub fn info(msg: &str) {
    println!("{} {}", style("→").bold().blue(), msg);
}

pub fn header(msg: &str) {
    println!("\n{}", style(msg).bold().underlined());
}
