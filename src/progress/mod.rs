use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::downloader::{ProgressEvent, ProgressKind};

/// Terminal spinner that mirrors downloader progress messages.
pub struct Progress {
    spinner: ProgressBar,
}

impl Progress {
    pub fn spinner(message: &str) -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self { spinner }
    }

    pub fn update(&self, event: &ProgressEvent) {
        match event.kind {
            ProgressKind::CacheHit | ProgressKind::DownloadStarted => {
                self.spinner.println(&event.message);
            }
            ProgressKind::Downloading | ProgressKind::Constructing => {}
        }
        self.spinner.set_message(event.message.clone());
    }

    pub fn stop(&self, message: &str) {
        self.spinner.finish_with_message(message.to_string());
    }

    pub fn stop_and_clear(&self) {
        self.spinner.finish_and_clear();
    }
}
