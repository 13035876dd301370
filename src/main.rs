mod capture;
mod config;
mod language;
mod localizer;
mod pipeline;
mod retry;
#[cfg(test)]
mod testing;
mod translator;
mod video;

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Settings;
use pipeline::Request;
use translator::TranslateError;

#[derive(Parser)]
#[command(name = "swissadt")]
#[command(
    about = "Locate the moment an audio description refers to and translate it with the frames as context",
    long_about = None
)]
struct Cli {
    /// Video to search (mp4, mov or avi)
    input_file: PathBuf,
    /// Audio description to localize and translate
    #[arg(short, long)]
    query: String,
    /// Number of frames to sample from the moment
    #[arg(short = 'n', long, conflicts_with = "every", value_parser = clap::value_parser!(u32).range(1..=20))]
    frames: Option<u32>,
    /// Keep every nth frame of the moment instead of a fixed count
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(10..=100))]
    every: Option<u32>,
    #[arg(short, long, default_value = "EN")]
    source: String,
    #[arg(short, long, default_value = "FR")]
    target: String,
    #[arg(long, default_value = "models/cgdetr")]
    model_dir: PathBuf,
    /// Scratch directory for the moment clip and frames; overwritten each run
    #[arg(long, default_value = "tmp")]
    workdir: PathBuf,
    #[arg(long, default_value = "gpt-4o")]
    chat_model: String,
    /// Ceiling on translation requests per second; 0 disables the pause
    #[arg(long, default_value_t = 2.0, value_parser = parse_rate)]
    requests_per_second: f64,
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// OpenAI-compatible endpoint to send translations to
    #[arg(long, env = "OPENAI_API_BASE")]
    api_base: Option<String>,
}

fn parse_rate(value: &str) -> Result<f64, String> {
    let rate: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if rate == 0.0 || (rate.is_finite() && rate >= retry::MIN_REQUESTS_PER_SECOND) {
        Ok(rate)
    } else {
        Err("expected 0 or at least one request per hour (0.000278)".to_string())
    }
}

impl Cli {
    fn settings(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            model_dir: self.model_dir.clone(),
            workdir: self.workdir.clone(),
            api_key: self.api_key.clone(),
            api_base: self.api_base.clone(),
            chat_model: self.chat_model.clone(),
            retry: defaults
                .retry
                .clone()
                .with_requests_per_second(self.requests_per_second),
            ..defaults
        }
    }

    /// Fixed count of 4 unless a stride was asked for.
    fn sampling(&self) -> (Option<usize>, Option<usize>) {
        let every = self.every.map(|n| n as usize);
        let frames = match (self.frames, every) {
            (Some(n), _) => Some(n as usize),
            (None, None) => Some(4),
            (None, Some(_)) => None,
        };
        (frames, every)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = cli.settings();
    let (frames, every) = cli.sampling();
    let request = Request::new(
        cli.input_file.clone(),
        &cli.query,
        frames,
        every,
        &cli.source,
        &cli.target,
    )?;

    let moment = pipeline::locate(&settings, &request)?;
    println!(
        "Extracted moment for \"{}\": {:.2}s - {:.2}s (score {:.4})",
        request.query, moment.window.start, moment.window.end, moment.window.score
    );
    println!("Clip: {}", moment.clip.path.display());
    println!("Sending the following {} frames for translation:", moment.frames.len());
    for row in pipeline::frame_rows(&moment.frames) {
        println!("  {}", row);
    }

    match pipeline::translate(&settings, &request, &moment).await {
        Ok(translation) => {
            info!(source = %request.source, target = %request.target, "translation complete");
            println!("Translation ({}): {}", request.target, translation);
            Ok(())
        }
        Err(TranslateError::MissingCredential) => {
            error!("set OPENAI_API_KEY to enable translation");
            Err(TranslateError::MissingCredential.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_four_frames() {
        let cli = Cli::parse_from(["swissadt", "input.mp4", "--query", "a man waves"]);
        assert_eq!(cli.sampling(), (Some(4), None));
        let settings = cli.settings();
        assert_eq!(settings.workdir, PathBuf::from("tmp"));
        assert_eq!(settings.retry.requests_per_second, 2.0);
    }

    #[test]
    fn cli_stride_replaces_the_count() {
        let cli = Cli::parse_from(["swissadt", "input.mp4", "-q", "a man waves", "--every", "50"]);
        assert_eq!(cli.sampling(), (None, Some(50)));
    }

    #[test]
    fn cli_enforces_form_ranges() {
        assert!(Cli::try_parse_from(["swissadt", "in.mp4", "-q", "x", "--frames", "21"]).is_err());
        assert!(Cli::try_parse_from(["swissadt", "in.mp4", "-q", "x", "--every", "5"]).is_err());
        assert!(Cli::try_parse_from([
            "swissadt", "in.mp4", "-q", "x", "--frames", "4", "--every", "50"
        ])
        .is_err());
    }

    #[test]
    fn cli_rejects_unusable_request_rates() {
        for rate in ["1e-300", "-1", "inf", "NaN", "fast"] {
            assert!(
                Cli::try_parse_from(["swissadt", "in.mp4", "-q", "x", "--requests-per-second", rate])
                    .is_err(),
                "{rate} was accepted"
            );
        }
        let cli = Cli::try_parse_from(["swissadt", "in.mp4", "-q", "x", "--requests-per-second", "0"])
            .unwrap();
        assert_eq!(cli.settings().retry.rate_limit_delay(), std::time::Duration::ZERO);
    }
}
