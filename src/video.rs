use ffmpeg::encoder;
use ffmpeg::util::frame::video::Video;
use ffmpeg_next::{
    self as ffmpeg, codec, decoder, format, media, picture, rescale, Dictionary, Packet, Rational,
    Rescale,
};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

static INIT: OnceLock<Result<(), ffmpeg::Error>> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub(crate) enum VideoError {
    #[error("ffmpeg: {0}")]
    Ffmpeg(#[from] ffmpeg::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no video stream in {}", .0.display())]
    NoVideoStream(PathBuf),
    #[error("unknown duration for {}", .0.display())]
    UnknownDuration(PathBuf),
    #[error("no frames decoded from {}", .0.display())]
    NoFrames(PathBuf),
    #[error("empty range after clamping: {start:.3}s..{end:.3}s")]
    EmptyRange { start: f64, end: f64 },
    #[error("decoded frame has no timestamp")]
    MissingTimestamp,
    #[error("invalid sampling: {0}")]
    InvalidSampling(&'static str),
    #[error("H.264 encoder not available")]
    EncoderNotFound,
    #[error("scaled frame does not fit an RGB buffer")]
    FrameBuffer,
}

pub(crate) fn init() -> Result<(), VideoError> {
    INIT.get_or_init(ffmpeg::init)
        .clone()
        .map_err(VideoError::from)
}

/// Container duration in seconds, falling back to the best video stream's own
/// duration when the container does not carry one.
pub(crate) fn probe_duration(path: &Path) -> Result<f64, VideoError> {
    init()?;
    let input = format::input(&path)?;
    let duration = input.duration();
    if duration > 0 {
        return Ok(duration as f64 * f64::from(rescale::TIME_BASE));
    }
    let stream = input
        .streams()
        .best(media::Type::Video)
        .ok_or_else(|| VideoError::NoVideoStream(path.to_path_buf()))?;
    if stream.duration() > 0 {
        return Ok(stream.duration() as f64 * f64::from(stream.time_base()));
    }
    Err(VideoError::UnknownDuration(path.to_path_buf()))
}

pub(crate) fn secs_to_ts(secs: f64, time_base: Rational) -> i64 {
    (secs / f64::from(time_base)).round() as i64
}

/// First timestamp of `stream` in its own time base; second `0` of the video.
pub(crate) fn stream_origin(stream: &format::stream::Stream) -> i64 {
    match stream.start_time() {
        ffmpeg::ffi::AV_NOPTS_VALUE => 0,
        start => start,
    }
}

/// Requested window clamped to what the source video actually contains.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TrimRange {
    pub(crate) start: f64,
    pub(crate) end: f64,
}

impl TrimRange {
    pub(crate) fn clamp(start: f64, end: f64, duration: f64) -> Result<Self, VideoError> {
        let start = start.max(0.0);
        let end = end.min(duration);
        match end.partial_cmp(&start) {
            Some(Ordering::Greater) => Ok(Self { start, end }),
            _ => Err(VideoError::EmptyRange { start, end }),
        }
    }

    pub(crate) fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Range in ticks of a stream whose first timestamp is `origin`.
    pub(crate) fn stream_window(&self, origin: i64, time_base: Rational) -> (i64, i64) {
        (
            origin + secs_to_ts(self.start, time_base),
            origin + secs_to_ts(self.end, time_base),
        )
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TrimmedClip {
    pub(crate) path: PathBuf,
    pub(crate) range: TrimRange,
}

impl TrimmedClip {
    /// Maps a time inside the clip back onto the source video's timeline.
    pub(crate) fn source_time(&self, clip_time: f64) -> f64 {
        self.range.start + clip_time
    }
}

struct VideoTranscoder {
    decoder: decoder::Video,
    encoder: encoder::Video,
    input_time_base: Rational,
    start_ts: i64,
    end_ts: i64,
    finished: bool,
}

impl VideoTranscoder {
    fn new(
        input_stream: &format::stream::Stream,
        output: &mut format::context::Output,
        range: TrimRange,
    ) -> Result<Self, VideoError> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let decoder = codec::context::Context::from_parameters(input_stream.parameters())?
            .decoder()
            .video()?;

        let codec = encoder::find(codec::Id::H264).ok_or(VideoError::EncoderNotFound)?;
        let mut output_stream = output.add_stream(codec)?;
        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder.set_height(decoder.height());
        encoder.set_width(decoder.width());
        encoder.set_aspect_ratio(decoder.aspect_ratio());
        encoder.set_format(decoder.format());
        encoder.set_frame_rate(decoder.frame_rate());
        encoder.set_time_base(input_stream.time_base());
        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        opts.set("preset", "medium");

        let opened_encoder = encoder.open_with(opts)?;
        output_stream.set_parameters(&opened_encoder);

        let input_time_base = input_stream.time_base();
        let (start_ts, end_ts) = range.stream_window(stream_origin(input_stream), input_time_base);
        Ok(Self {
            decoder,
            encoder: opened_encoder,
            input_time_base,
            start_ts,
            end_ts,
            finished: false,
        })
    }

    fn send_packet_to_decoder(&mut self, packet: &Packet) -> Result<(), VideoError> {
        self.decoder.send_packet(packet).map_err(VideoError::from)
    }

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_time_base: Rational,
    ) -> Result<(), VideoError> {
        let mut frame = Video::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            if self.finished {
                continue;
            }
            let timestamp = frame.timestamp().ok_or(VideoError::MissingTimestamp)?;
            // Seeking lands on the preceding keyframe.
            if timestamp < self.start_ts {
                continue;
            }
            if timestamp >= self.end_ts {
                self.finished = true;
                continue;
            }
            frame.set_pts(Some(timestamp - self.start_ts));
            frame.set_kind(picture::Type::None);
            self.encoder.send_frame(&frame)?;
            self.receive_and_process_encoded_packets(output, output_time_base)?;
        }
        Ok(())
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_time_base: Rational,
    ) -> Result<(), VideoError> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(0);
            packet.rescale_ts(self.input_time_base, output_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }

    fn flush(
        &mut self,
        output: &mut format::context::Output,
        output_time_base: Rational,
    ) -> Result<(), VideoError> {
        self.decoder.send_eof()?;
        self.receive_and_process_decoded_frames(output, output_time_base)?;
        self.encoder.send_eof()?;
        self.receive_and_process_encoded_packets(output, output_time_base)
    }
}

/// Cuts `[start, end]` out of `input_path` into `output_path`.
///
/// The window is clamped to `[0, duration]`. Only the best video stream is
/// kept and re-encoded as H.264; audio, subtitle and data streams are dropped.
pub(crate) fn trim(
    input_path: &Path,
    output_path: &Path,
    start: f64,
    end: f64,
) -> Result<TrimmedClip, VideoError> {
    let duration = probe_duration(input_path)?;
    let range = TrimRange::clamp(start, end, duration)?;
    info!(
        input = %input_path.display(),
        output = %output_path.display(),
        start = range.start,
        end = range.end,
        duration = range.duration(),
        "trimming moment"
    );

    let mut input = format::input(&input_path)?;
    let mut output = format::output(&output_path)?;

    let (input_stream_index, mut transcoder) = {
        let input_stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| VideoError::NoVideoStream(input_path.to_path_buf()))?;
        (
            input_stream.index(),
            VideoTranscoder::new(&input_stream, &mut output, range)?,
        )
    };

    output.set_metadata(input.metadata().to_owned());
    output.write_header()?;
    let output_time_base = output
        .stream(0)
        .ok_or(ffmpeg::Error::StreamNotFound)?
        .time_base();

    let start_pos = transcoder
        .start_ts
        .rescale(transcoder.input_time_base, rescale::TIME_BASE);
    input.seek(start_pos, ..start_pos)?;

    for (stream, packet) in input.packets() {
        if stream.index() != input_stream_index {
            continue;
        }
        transcoder.send_packet_to_decoder(&packet)?;
        transcoder.receive_and_process_decoded_frames(&mut output, output_time_base)?;
        if transcoder.finished {
            break;
        }
    }
    transcoder.flush(&mut output, output_time_base)?;
    output.write_trailer()?;
    debug!(output = %output_path.display(), "trim complete");

    Ok(TrimmedClip {
        path: output_path.to_path_buf(),
        range,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn clamp_keeps_in_range_window() {
        let range = TrimRange::clamp(12.0, 18.0, 60.0).unwrap();
        assert_eq!(range, TrimRange { start: 12.0, end: 18.0 });
        assert_eq!(range.duration(), 6.0);
    }

    #[test]
    fn clamp_pulls_out_of_range_window_into_video() {
        let range = TrimRange::clamp(-5.0, 10_000.0, 42.5).unwrap();
        assert_eq!(range.start, 0.0);
        assert_eq!(range.end, 42.5);
    }

    #[test]
    fn clamp_rejects_window_past_the_end() {
        let err = TrimRange::clamp(70.0, 80.0, 60.0).unwrap_err();
        assert!(matches!(err, VideoError::EmptyRange { .. }));
    }

    #[test]
    fn source_time_offsets_by_clip_start() {
        let clip = TrimmedClip {
            path: PathBuf::from("tmp/moment.mp4"),
            range: TrimRange { start: 12.0, end: 18.0 },
        };
        assert_eq!(clip.source_time(1.5), 13.5);
    }

    #[test]
    fn seconds_convert_to_stream_ticks() {
        assert_eq!(secs_to_ts(2.0, Rational(1, 90_000)), 180_000);
        assert_eq!(secs_to_ts(0.5, Rational(1, 1000)), 500);
    }

    #[test]
    fn stream_window_starts_at_the_stream_origin() {
        let range = TrimRange { start: 12.0, end: 18.0 };
        assert_eq!(range.stream_window(0, Rational(1, 1000)), (12_000, 18_000));
        assert_eq!(
            range.stream_window(90_000, Rational(1, 90_000)),
            (90_000 + 1_080_000, 90_000 + 1_620_000)
        );
    }

    #[test]
    fn trim_clamps_to_the_source_and_keeps_only_video() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.mov");
        testing::write_clip(&source, 100).unwrap();
        let source_duration = probe_duration(&source).unwrap();
        assert!(format::input(&source)
            .unwrap()
            .streams()
            .best(media::Type::Audio)
            .is_some());

        let output = dir.path().join("moment.mp4");
        let clip = trim(&source, &output, -5.0, 10_000.0).unwrap();
        assert_eq!(clip.range, TrimRange { start: 0.0, end: source_duration });
        assert!(probe_duration(&output).unwrap() <= source_duration + 1e-3);

        let trimmed = format::input(&output).unwrap();
        assert_eq!(trimmed.streams().count(), 1);
        assert!(trimmed.streams().best(media::Type::Audio).is_none());
    }

    #[test]
    fn trim_cuts_the_requested_window() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.mov");
        testing::write_clip(&source, 100).unwrap();

        let output = dir.path().join("moment.mp4");
        let clip = trim(&source, &output, 1.0, 3.0).unwrap();
        assert_eq!(clip.range, TrimRange { start: 1.0, end: 3.0 });
        assert!((probe_duration(&output).unwrap() - 2.0).abs() < 0.1);
    }

    #[test]
    fn probe_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(probe_duration(&dir.path().join("missing.mp4")).is_err());
    }
}
