//! Terminal progress rendering

use indicatif::{ProgressBar, ProgressStyle};

use common::models::{BatchProgress, DownloadProgress, ItemStatus};

const DOWNLOAD_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}";
const BATCH_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Progress bar fed by download progress snapshots
pub struct DownloadBar {
    bar: ProgressBar,
}

impl DownloadBar {
    pub fn new(quiet: bool) -> Self {
        let bar = if quiet { ProgressBar::hidden() } else { ProgressBar::new(0) };
        bar.set_style(style(DOWNLOAD_TEMPLATE));
        Self { bar }
    }

    pub fn update(&self, progress: &DownloadProgress) {
        if self.bar.length() != Some(progress.bytes_total) {
            self.bar.set_length(progress.bytes_total);
        }
        self.bar.set_position(progress.bytes_done);
        self.bar.set_message(progress.message.clone());
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn abandon(&self, message: &str) {
        self.bar.abandon_with_message(message.to_string());
    }
}

/// Progress bar fed by batch events
pub struct BatchBar {
    bar: ProgressBar,
}

impl BatchBar {
    pub fn new(total: usize, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(total as u64)
        };
        bar.set_style(style(BATCH_TEMPLATE));
        Self { bar }
    }

    pub fn update(&self, event: &BatchProgress) {
        let name = event
            .image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match event.status {
            ItemStatus::Started => self.bar.set_message(name),
            ItemStatus::Failed => {
                let reason = event
                    .outcome
                    .as_ref()
                    .and_then(|o| o.error.clone())
                    .unwrap_or_default();
                self.bar.println(format!("failed  {}: {}", name, reason));
                self.bar.set_position(event.index as u64 + 1);
            }
            ItemStatus::Skipped | ItemStatus::Succeeded => self.bar.set_position(event.index as u64 + 1),
        }
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn abandon(&self, message: &str) {
        self.bar.abandon_with_message(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::CaptionOutcome;
    use std::path::PathBuf;

    #[test]
    fn test_bars_track_events() {
        let download = DownloadBar::new(true);
        download.update(&DownloadProgress {
            bytes_done: 50,
            bytes_total: 200,
            message: "Downloading x".to_string(),
        });
        assert_eq!(download.bar.length(), Some(200));
        assert_eq!(download.bar.position(), 50);

        let batch = BatchBar::new(3, true);
        batch.update(&BatchProgress {
            index: 1,
            total: 3,
            image_path: PathBuf::from("b.png"),
            status: ItemStatus::Failed,
            outcome: Some(CaptionOutcome::failed(PathBuf::from("b.png"), "bad image")),
        });
        assert_eq!(batch.bar.position(), 2);
    }
}
