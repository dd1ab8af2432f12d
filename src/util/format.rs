//! Human-readable formatting helpers shared by the CLI front-ends.
use colored::Colorize;
use std::time::Duration;

pub fn print_about() {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).unwrap_or(());

    println!("{}", "-".repeat(44).bright_cyan());
    println!(
        "{}",
        "DGUTA       : directory/group/user/type/age usage engine".bright_cyan()
    );
    println!(
        "{}",
        format!("Version      : {}", env!("CARGO_PKG_VERSION")).bright_cyan()
    );
    println!(
        "{}",
        format!("Built        : {}", env!("BUILD_DATE")).bright_cyan()
    );
    println!("{}", "-".repeat(44).bright_cyan());
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.1}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!(
            "{}h {:02}m {:02}s",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }
}

pub fn human_count(n: u64) -> String {
    const UNITS: [&str; 5] = ["", "K", "M", "B", "T"];
    let mut val = n as f64;
    let mut unit = 0;

    while val >= 1000.0 && unit < UNITS.len() - 1 {
        val /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{}", n)
    } else {
        format!("{:.1}{}", val, UNITS[unit])
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{}{}", size as u64, UNITS[unit])
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

/// Print a colorized progress bar like: [====>-----] 42%
pub fn progress_bar(pct: f64, width: usize) -> String {
    let pct = pct.clamp(0.0, 100.0);
    let filled = ((pct / 100.0) * width as f64).round() as usize;
    let body_len = filled.saturating_sub(1);
    let has_head = (filled > 0) as usize;
    let tail_len = width.saturating_sub(body_len + has_head);
    let mut bar = String::with_capacity(width + 8);
    bar.push('[');

    if body_len > 0 {
        bar.push_str(&"=".repeat(body_len).bright_cyan().to_string());
    }
    if has_head == 1 {
        bar.push_str(&">".bright_cyan().to_string());
    }
    if tail_len > 0 {
        bar.push_str(&"-".repeat(tail_len).bright_black().to_string());
    }
    bar.push(']');

    bar
}
