//! Output formatting utilities

use console::{style, StyledObject};
use dlq_types::DownloadStatus;
use serde::Serialize;

/// Print a value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format a byte count; negative means unknown
pub fn format_bytes(bytes: i64) -> String {
    if bytes < 0 {
        "?".to_string()
    } else {
        human_bytes::human_bytes(bytes as f64)
    }
}

pub fn status_icon(status: DownloadStatus) -> StyledObject<&'static str> {
    match status {
        DownloadStatus::Successful => style("✓").green(),
        DownloadStatus::Running => style("↓").cyan(),
        DownloadStatus::Paused => style("⏸").yellow(),
        DownloadStatus::Failed => style("✗").red(),
        DownloadStatus::Pending => style("·").dim(),
    }
}

/// Shorten `text` to at most `max` characters
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        text.to_string()
    }
}
