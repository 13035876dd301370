use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::capture::{self, SampleMode};
use crate::config::Settings;
use crate::language::{InvalidLanguage, LanguageCode};
use crate::localizer::{self, WindowPrediction};
use crate::translator::{OpenAiBackend, TranslateError, Translator};
use crate::video::{self, TrimmedClip, VideoError};

const CONTAINERS: [&str; 3] = ["mp4", "mov", "avi"];
/// Frames per row when listing the sampled frames.
pub(crate) const FRAMES_PER_ROW: usize = 6;

#[derive(Debug, thiserror::Error)]
pub(crate) enum InputError {
    #[error("video file not found: {}", .0.display())]
    MissingVideo(PathBuf),
    #[error("unsupported container {0:?}; expected mp4, mov or avi")]
    UnsupportedContainer(String),
    #[error("the audio description is empty")]
    EmptyQuery,
    #[error(transparent)]
    Language(#[from] InvalidLanguage),
    #[error(transparent)]
    Sampling(#[from] VideoError),
}

/// One user submission: the video, its audio description, and how to
/// sample and translate the located moment.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) video: PathBuf,
    pub(crate) query: String,
    pub(crate) mode: SampleMode,
    pub(crate) source: LanguageCode,
    pub(crate) target: LanguageCode,
}

impl Request {
    pub(crate) fn new(
        video: PathBuf,
        query: &str,
        count: Option<usize>,
        stride: Option<usize>,
        source: &str,
        target: &str,
    ) -> Result<Self, InputError> {
        if !video.is_file() {
            return Err(InputError::MissingVideo(video));
        }
        let extension = video
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if !CONTAINERS.contains(&extension.as_str()) {
            return Err(InputError::UnsupportedContainer(extension));
        }
        let query = query.trim();
        if query.is_empty() {
            return Err(InputError::EmptyQuery);
        }
        Ok(Self {
            mode: SampleMode::from_options(count, stride)?,
            source: source.parse()?,
            target: target.parse()?,
            query: query.to_string(),
            video,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FrameRecord {
    pub(crate) path: PathBuf,
    pub(crate) index: usize,
    /// Time of the frame on the source video's timeline.
    pub(crate) source_time: f64,
}

/// Everything produced before translation.
#[derive(Debug, Clone)]
pub(crate) struct Moment {
    pub(crate) window: WindowPrediction,
    pub(crate) clip: TrimmedClip,
    pub(crate) frames: Vec<FrameRecord>,
    /// Frames as data URIs, in the same order as `frames`.
    pub(crate) images: Vec<String>,
}

/// Localizes the query, cuts the moment out and samples its frames.
pub(crate) fn locate(settings: &Settings, request: &Request) -> anyhow::Result<Moment> {
    fs::create_dir_all(&settings.workdir)
        .with_context(|| format!("failed to create {}", settings.workdir.display()))?;

    let localizer = localizer::shared(&settings.model_dir)?;
    let window = localizer
        .best_moment(&request.video, &request.query)
        .context("moment localization failed")?;

    let clip = video::trim(
        &request.video,
        &settings.moment_path(),
        window.start,
        window.end,
    )
    .context("failed to cut the moment")?;

    let sampled = capture::sample_frames(&clip.path, request.mode)?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to sample frames")?;
    let paths = capture::save_frames(&sampled, &settings.frames_dir())?;
    let images = sampled
        .iter()
        .map(capture::SampledFrame::to_data_uri)
        .collect::<Result<Vec<_>, _>>()?;
    let frames = sampled
        .iter()
        .zip(paths)
        .map(|(frame, path)| FrameRecord {
            path,
            index: frame.index,
            source_time: clip.source_time(frame.timestamp),
        })
        .collect::<Vec<_>>();
    info!(frames = frames.len(), clip = %clip.path.display(), "moment ready");

    Ok(Moment {
        window,
        clip,
        frames,
        images,
    })
}

/// Translates the request's audio description using the moment's frames.
///
/// Fails with [`TranslateError::MissingCredential`] before any request is
/// built when no API key is configured.
pub(crate) async fn translate(
    settings: &Settings,
    request: &Request,
    moment: &Moment,
) -> Result<String, TranslateError> {
    let backend = OpenAiBackend::from_settings(settings)?;
    Translator::new(backend, settings)
        .translate(
            &request.query,
            &moment.images,
            request.source.code(),
            request.target.code(),
        )
        .await
}

/// Frame listing in rows of [`FRAMES_PER_ROW`].
pub(crate) fn frame_rows(frames: &[FrameRecord]) -> Vec<String> {
    frames
        .chunks(FRAMES_PER_ROW)
        .map(|row| {
            row.iter()
                .map(|frame| {
                    format!(
                        "{} (#{}) @{:.2}s",
                        file_name(&frame.path),
                        frame.index,
                        frame.source_time
                    )
                })
                .collect::<Vec<_>>()
                .join("  ")
        })
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::count_timestamps;
    use crate::video::TrimRange;

    fn video_file(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"not really a video").unwrap();
        path
    }

    #[test]
    fn request_validates_user_input() {
        let dir = tempfile::tempdir().unwrap();
        let mp4 = video_file(dir.path(), "input.MP4");

        let request = Request::new(mp4.clone(), " a man waves ", Some(4), None, "EN", "fr").unwrap();
        assert_eq!(request.query, "a man waves");
        assert_eq!(request.mode, SampleMode::Count(4));
        assert_eq!(request.target, LanguageCode::Fr);

        assert!(matches!(
            Request::new(dir.path().join("missing.mp4"), "q", Some(4), None, "EN", "FR"),
            Err(InputError::MissingVideo(_))
        ));
        assert!(matches!(
            Request::new(video_file(dir.path(), "clip.mkv"), "q", Some(4), None, "EN", "FR"),
            Err(InputError::UnsupportedContainer(_))
        ));
        assert!(matches!(
            Request::new(mp4.clone(), "   ", Some(4), None, "EN", "FR"),
            Err(InputError::EmptyQuery)
        ));
        assert!(matches!(
            Request::new(mp4.clone(), "q", None, None, "EN", "FR"),
            Err(InputError::Sampling(_))
        ));
        assert!(matches!(
            Request::new(mp4, "q", None, Some(50), "EN", "ES"),
            Err(InputError::Language(_))
        ));
    }

    #[test]
    fn top_window_maps_to_frames_inside_the_moment() {
        let window = WindowPrediction {
            start: 12.0,
            end: 18.0,
            score: 0.91,
        };
        let clip = TrimmedClip {
            path: PathBuf::from("tmp/moment.mp4"),
            range: TrimRange::clamp(window.start, window.end, 60.0).unwrap(),
        };
        assert_eq!((clip.range.start, clip.range.end), (12.0, 18.0));

        let times: Vec<f64> = count_timestamps(clip.range.duration(), 4)
            .into_iter()
            .map(|t| clip.source_time(t))
            .collect();
        assert_eq!(times.len(), 4);
        assert!(times.iter().all(|&t| t > 12.0 && t < 18.0));
        let gaps: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.iter().all(|g| (g - 1.2).abs() < 1e-9));
    }

    #[test]
    fn frames_render_in_rows_of_six() {
        let frames: Vec<FrameRecord> = (0..8)
            .map(|i| FrameRecord {
                path: PathBuf::from(format!("tmp/frames/frame_{i:04}.png")),
                index: i * 50,
                source_time: i as f64,
            })
            .collect();
        let rows = frame_rows(&frames);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("frame_0000.png (#0) @0.00s"));
        assert_eq!(
            rows[1],
            "frame_0006.png (#300) @6.00s  frame_0007.png (#350) @7.00s"
        );
    }

    #[tokio::test]
    async fn translation_without_credential_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let request =
            Request::new(video_file(dir.path(), "in.mov"), "a man waves", Some(1), None, "EN", "DE")
                .unwrap();
        let moment = Moment {
            window: WindowPrediction {
                start: 0.0,
                end: 1.0,
                score: 0.5,
            },
            clip: TrimmedClip {
                path: dir.path().join("moment.mp4"),
                range: TrimRange { start: 0.0, end: 1.0 },
            },
            frames: Vec::new(),
            images: Vec::new(),
        };
        let err = translate(&Settings::default(), &request, &moment)
            .await
            .unwrap_err();
        assert!(matches!(err, TranslateError::MissingCredential));
    }
}
