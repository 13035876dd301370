use base64::Engine;
use ffmpeg::util::frame::video::Video;
use ffmpeg_next::{self as ffmpeg, codec, decoder, format, media, software, Packet, Rational};
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{ImageEncoder, RgbImage};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::video::{self, VideoError};

/// Frames whose decoded RGB buffer exceeds this are downscaled before use.
pub(crate) const MAX_FRAME_BYTES: usize = 20 * 1024 * 1024;

/// How frames are picked from a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleMode {
    /// `n` frames at equally spaced instants strictly inside the clip.
    Count(usize),
    /// Every `s`-th decoded frame, starting with the first.
    Stride(usize),
}

impl SampleMode {
    pub(crate) fn from_options(
        count: Option<usize>,
        stride: Option<usize>,
    ) -> Result<Self, VideoError> {
        match (count, stride) {
            (Some(0), None) => Err(VideoError::InvalidSampling("frame count must be positive")),
            (None, Some(0)) => Err(VideoError::InvalidSampling("stride must be positive")),
            (Some(count), None) => Ok(Self::Count(count)),
            (None, Some(stride)) => Ok(Self::Stride(stride)),
            (None, None) => Err(VideoError::InvalidSampling(
                "either a frame count or a stride is required",
            )),
            (Some(_), Some(_)) => Err(VideoError::InvalidSampling(
                "frame count and stride are mutually exclusive",
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SampledFrame {
    /// Index of the decoded frame inside the clip.
    pub(crate) index: usize,
    /// Sample instant in seconds from the start of the clip.
    pub(crate) timestamp: f64,
    pub(crate) image: RgbImage,
}

impl SampledFrame {
    pub(crate) fn encode_png(&self) -> Result<Vec<u8>, VideoError> {
        let mut png_data = Vec::new();
        PngEncoder::new(&mut png_data).write_image(
            &self.image,
            self.image.width(),
            self.image.height(),
            image::ExtendedColorType::Rgb8,
        )?;
        Ok(png_data)
    }

    pub(crate) fn to_data_uri(&self) -> Result<String, VideoError> {
        use base64::prelude::BASE64_STANDARD;

        let png_data = self.encode_png()?;
        Ok("data:image/png;base64,".to_owned() + &BASE64_STANDARD.encode(png_data))
    }
}

/// `count` instants equally spaced over `duration`, excluding both ends.
pub(crate) fn count_timestamps(duration: f64, count: usize) -> Vec<f64> {
    let segments = (count + 1) as f64;
    (1..=count)
        .map(|i| duration * i as f64 / segments)
        .collect()
}

pub(crate) fn raw_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Target dimensions for a frame over `budget` bytes, or `None` if it fits.
///
/// Both sides shrink by `sqrt(budget / size)` and are floored, so the new
/// buffer never exceeds the budget.
pub(crate) fn downscaled_dimensions(width: u32, height: u32, budget: usize) -> Option<(u32, u32)> {
    let size = raw_size(width, height);
    if size <= budget {
        return None;
    }
    let factor = (budget as f64 / size as f64).sqrt();
    let scale = |dim: u32| ((dim as f64 * factor).floor() as u32).max(1);
    Some((scale(width), scale(height)))
}

pub(crate) fn fit_to_budget(image: RgbImage, budget: usize) -> RgbImage {
    match downscaled_dimensions(image.width(), image.height(), budget) {
        Some((width, height)) => {
            debug!(
                from_width = image.width(),
                from_height = image.height(),
                width,
                height,
                "downscaling oversized frame"
            );
            image::imageops::resize(&image, width, height, FilterType::Lanczos3)
        }
        None => image,
    }
}

enum Selection {
    Targets {
        targets: VecDeque<f64>,
        held: Option<(usize, Video)>,
    },
    Stride(usize),
}

/// Lazily decoded frames of one video.
///
/// Each call to [`sample_frames`] opens the file again, so sampling can be
/// restarted by asking for a fresh iterator.
pub(crate) struct Frames {
    path: PathBuf,
    input: format::context::Input,
    decoder: decoder::Video,
    scaler: software::scaling::context::Context,
    stream_index: usize,
    time_base: Rational,
    start_ts: i64,
    selection: Selection,
    budget: usize,
    decoded: usize,
    pending: VecDeque<SampledFrame>,
    eof_sent: bool,
    finished: bool,
}

pub(crate) fn sample_frames(clip_path: &Path, mode: SampleMode) -> Result<Frames, VideoError> {
    let selection = match mode {
        SampleMode::Count(count) => {
            let duration = video::probe_duration(clip_path)?;
            info!(duration, count, "sampling frames by count");
            Selection::Targets {
                targets: count_timestamps(duration, count).into(),
                held: None,
            }
        }
        SampleMode::Stride(0) => {
            return Err(VideoError::InvalidSampling("stride must be positive"));
        }
        SampleMode::Stride(stride) => {
            info!(stride, "sampling every nth frame");
            Selection::Stride(stride)
        }
    };
    Frames::open(clip_path, selection, MAX_FRAME_BYTES)
}

/// Frames at arbitrary instants (seconds from the start of the video).
pub(crate) fn frames_at(path: &Path, timestamps: Vec<f64>) -> Result<Frames, VideoError> {
    Frames::open(
        path,
        Selection::Targets {
            targets: timestamps.into(),
            held: None,
        },
        MAX_FRAME_BYTES,
    )
}

impl Frames {
    fn open(path: &Path, selection: Selection, budget: usize) -> Result<Self, VideoError> {
        video::init()?;
        let input = format::input(&path)?;
        let video_stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| VideoError::NoVideoStream(path.to_path_buf()))?;
        let stream_index = video_stream.index();
        let time_base = video_stream.time_base();
        let start_ts = video::stream_origin(&video_stream);

        let decoder = codec::context::Context::from_parameters(video_stream.parameters())?
            .decoder()
            .video()?;
        let scaler = software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            software::scaling::Flags::BILINEAR,
        )?;

        Ok(Self {
            path: path.to_path_buf(),
            input,
            decoder,
            scaler,
            stream_index,
            time_base,
            start_ts,
            selection,
            budget,
            decoded: 0,
            pending: VecDeque::new(),
            eof_sent: false,
            finished: false,
        })
    }

    /// Pulls one decoded frame through the selection, feeding the decoder
    /// another packet when it has nothing buffered.
    fn advance(&mut self) -> Result<(), VideoError> {
        let mut decoded = Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_ok() {
            return self.select(decoded);
        }
        if self.eof_sent {
            self.finished = true;
            return self.finish();
        }

        let mut packet = Packet::empty();
        loop {
            match packet.read(&mut self.input) {
                Ok(()) if packet.stream() == self.stream_index => {
                    self.decoder.send_packet(&packet)?;
                    return Ok(());
                }
                Ok(()) => continue,
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof()?;
                    self.eof_sent = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn select(&mut self, decoded: Video) -> Result<(), VideoError> {
        let index = self.decoded;
        self.decoded += 1;
        let ts = decoded.timestamp().ok_or(VideoError::MissingTimestamp)?;
        let time = (ts - self.start_ts) as f64 * f64::from(self.time_base);

        match &mut self.selection {
            Selection::Stride(stride) => {
                if index % *stride == 0 {
                    let image = to_rgb_image(&mut self.scaler, &decoded, self.budget)?;
                    self.pending.push_back(SampledFrame {
                        index,
                        timestamp: time,
                        image,
                    });
                }
            }
            Selection::Targets { targets, held } => {
                // Each target takes the latest frame shown at or before it.
                while let Some(&target) = targets.front() {
                    if time <= target {
                        break;
                    }
                    let (frame_index, frame) =
                        held.as_ref().map_or((index, &decoded), |(i, f)| (*i, f));
                    let image = to_rgb_image(&mut self.scaler, frame, self.budget)?;
                    self.pending.push_back(SampledFrame {
                        index: frame_index,
                        timestamp: target,
                        image,
                    });
                    targets.pop_front();
                }
                if targets.is_empty() {
                    self.finished = true;
                } else {
                    *held = Some((index, decoded));
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), VideoError> {
        let Selection::Targets { targets, held } = &mut self.selection else {
            return Ok(());
        };
        if targets.is_empty() {
            return Ok(());
        }
        let (index, frame) = held
            .take()
            .ok_or_else(|| VideoError::NoFrames(self.path.clone()))?;
        let image = to_rgb_image(&mut self.scaler, &frame, self.budget)?;
        for target in targets.drain(..) {
            self.pending.push_back(SampledFrame {
                index,
                timestamp: target,
                image: image.clone(),
            });
        }
        Ok(())
    }
}

impl Iterator for Frames {
    type Item = Result<SampledFrame, VideoError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }
            if self.finished {
                return None;
            }
            if let Err(e) = self.advance() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}

fn to_rgb_image(
    scaler: &mut software::scaling::context::Context,
    decoded: &Video,
    budget: usize,
) -> Result<RgbImage, VideoError> {
    let mut rgb_frame = Video::empty();
    scaler.run(decoded, &mut rgb_frame)?;

    let (width, height) = (rgb_frame.width(), rgb_frame.height());
    let row_bytes = width as usize * 3;
    let stride = rgb_frame.stride(0);
    let mut buffer = Vec::with_capacity(row_bytes * height as usize);
    for row in rgb_frame.data(0).chunks(stride).take(height as usize) {
        buffer.extend_from_slice(&row[..row_bytes]);
    }
    let image = RgbImage::from_raw(width, height, buffer).ok_or(VideoError::FrameBuffer)?;
    Ok(fit_to_budget(image, budget))
}

/// Writes frames as `frame_0000.png`, `frame_0001.png`, ... into `dir`,
/// replacing whatever a previous run left there.
pub(crate) fn save_frames(frames: &[SampledFrame], dir: &Path) -> Result<Vec<PathBuf>, VideoError> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    fs::create_dir_all(dir)?;
    frames
        .iter()
        .enumerate()
        .map(|(n, frame)| -> Result<PathBuf, VideoError> {
            let path = dir.join(format!("frame_{:04}.png", n));
            fs::write(&path, frame.encode_png()?)?;
            Ok(path)
        })
        .collect()
}
