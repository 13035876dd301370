use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Runtime configuration, assembled from command-line flags and environment.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    /// Directory holding the CLIP encoders, tokenizer and CG-DETR graph.
    pub(crate) model_dir: PathBuf,
    /// Scratch directory; every run overwrites the files in it.
    pub(crate) workdir: PathBuf,
    pub(crate) api_key: Option<String>,
    /// Alternative OpenAI-compatible endpoint, e.g. a proxy.
    pub(crate) api_base: Option<String>,
    pub(crate) chat_model: String,
    pub(crate) max_tokens: u32,
    pub(crate) request_timeout: Duration,
    pub(crate) retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models/cgdetr"),
            workdir: PathBuf::from("tmp"),
            api_key: None,
            api_base: None,
            chat_model: "gpt-4o".to_string(),
            max_tokens: 300,
            request_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    pub(crate) fn moment_path(&self) -> PathBuf {
        self.workdir.join("moment.mp4")
    }

    pub(crate) fn frames_dir(&self) -> PathBuf {
        self.workdir.join("frames")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_hosted_setup() {
        let settings = Settings::default();
        assert_eq!(settings.chat_model, "gpt-4o");
        assert_eq!(settings.max_tokens, 300);
        assert_eq!(settings.retry.max_elapsed, Duration::from_secs(60));
        assert_eq!(settings.retry.requests_per_second, 2.0);
        assert!(settings.api_key.is_none());
    }

    #[test]
    fn artifacts_live_in_the_workdir() {
        let settings = Settings {
            workdir: PathBuf::from("/scratch"),
            ..Settings::default()
        };
        assert_eq!(settings.moment_path(), PathBuf::from("/scratch/moment.mp4"));
        assert_eq!(settings.frames_dir(), PathBuf::from("/scratch/frames"));
    }
}
