//! Progress bar utilities for `dlq run`

use crate::output::truncate;
use console::style;
use dlq_types::{CoreEvent, DownloadId, DownloadRecord, DownloadStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;

/// Manages one progress bar per download
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<DownloadId, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create (or return) the progress bar for a download
    pub fn add_download(&mut self, record: &DownloadRecord) -> ProgressBar {
        if let Some(pb) = self.bars.get(&record.id) {
            return pb.clone();
        }

        let pb = self.multi.add(ProgressBar::new(record.bytes_total.max(0) as u64));
        pb.set_style(bar_style(record.bytes_total > 0));
        pb.set_prefix(format!("#{}", record.id));
        pb.set_message(truncate(&record.title(), 30));
        pb.set_position(record.bytes_downloaded.max(0) as u64);

        self.bars.insert(record.id, pb.clone());
        pb
    }

    /// Update bars from an event. `lookup` resolves records not seen yet.
    pub fn handle_event<F>(&mut self, event: &CoreEvent, lookup: F)
    where
        F: Fn(DownloadId) -> Option<DownloadRecord>,
    {
        match event {
            CoreEvent::DownloadAdded { id } => {
                if let Some(record) = lookup(*id) {
                    self.add_download(&record);
                }
            }

            CoreEvent::DownloadProgress {
                id,
                downloaded,
                total,
            } => {
                if let Some(pb) = self.bars.get(id) {
                    if *total > 0 && pb.length() != Some(*total as u64) {
                        pb.set_style(bar_style(true));
                        pb.set_length(*total as u64);
                    }
                    pb.set_position((*downloaded).max(0) as u64);
                }
            }

            CoreEvent::DownloadStatusChanged { id, status, reason } => {
                let pb = match self.bars.get(id) {
                    Some(pb) => pb.clone(),
                    None => match lookup(*id) {
                        Some(record) => self.add_download(&record),
                        None => return,
                    },
                };

                match status {
                    DownloadStatus::Successful => {
                        pb.finish_with_message(format!(
                            "{} Download complete",
                            style("✓").green().bold()
                        ));
                    }
                    DownloadStatus::Failed => {
                        pb.abandon_with_message(format!(
                            "{} Failed: {}",
                            style("✗").red().bold(),
                            reason.as_deref().unwrap_or("Unknown error")
                        ));
                    }
                    DownloadStatus::Paused => {
                        pb.set_message(format!("{} Paused", style("⏸").yellow()));
                    }
                    DownloadStatus::Running => {
                        if let Some(record) = lookup(*id) {
                            pb.set_message(truncate(&record.title(), 30));
                        }
                    }
                    DownloadStatus::Pending => {}
                }
            }

            CoreEvent::DownloadRemoved { id } => self.remove(*id),

            CoreEvent::ConnectivityChanged { online } => {
                let _ = self.multi.println(if *online {
                    format!("{} Back online", style("●").green())
                } else {
                    format!("{} Offline, transfers paused", style("●").yellow())
                });
            }

            CoreEvent::Notification { .. } => {}
        }
    }

    /// Remove a progress bar
    pub fn remove(&mut self, id: DownloadId) {
        if let Some(pb) = self.bars.remove(&id) {
            pb.finish_and_clear();
        }
    }

    /// Stop drawing; finished bars stay on screen
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.abandon();
            }
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn bar_style(known_size: bool) -> ProgressStyle {
    let template = if known_size {
        "{spinner:.green} {prefix:.bold} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}"
    } else {
        "{spinner:.green} {prefix:.bold} {bytes} ({bytes_per_sec}) {msg}"
    };

    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}
