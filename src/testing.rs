//! Small synthetic videos encoded on the fly for the media tests.

use ffmpeg::channel_layout::ChannelLayout;
use ffmpeg::encoder;
use ffmpeg::util::frame::{audio::Audio, video::Video};
use ffmpeg_next::{self as ffmpeg, codec, format, Packet, Rational};
use std::path::Path;

use crate::video::{self, VideoError};

pub(crate) const FPS: i32 = 25;
pub(crate) const WIDTH: u32 = 64;
pub(crate) const HEIGHT: u32 = 48;
const SAMPLE_RATE: i32 = 8_000;

fn drain(
    encoder: &mut encoder::Encoder,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    output: &mut format::context::Output,
) -> Result<(), VideoError> {
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(encoder_time_base, stream_time_base);
        packet.write_interleaved(output)?;
    }
    Ok(())
}

/// Writes `frames` frames of MPEG-4 video at [`FPS`] next to a silent mono
/// PCM track. Frame `i` is a flat gray whose level depends on `i`.
pub(crate) fn write_clip(path: &Path, frames: usize) -> Result<(), VideoError> {
    video::init()?;
    let mut output = format::output(&path)?;
    let global_header = output
        .format()
        .flags()
        .contains(format::Flags::GLOBAL_HEADER);
    let video_time_base = Rational(1, FPS);
    let audio_time_base = Rational(1, SAMPLE_RATE);

    let video_codec = encoder::find(codec::Id::MPEG4).ok_or(ffmpeg::Error::EncoderNotFound)?;
    let mut video_encoder = {
        let mut stream = output.add_stream(video_codec)?;
        let mut encoder = codec::context::Context::new_with_codec(video_codec)
            .encoder()
            .video()?;
        encoder.set_width(WIDTH);
        encoder.set_height(HEIGHT);
        encoder.set_format(format::Pixel::YUV420P);
        encoder.set_time_base(video_time_base);
        encoder.set_frame_rate(Some(Rational(FPS, 1)));
        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        let opened = encoder.open_as(video_codec)?;
        stream.set_parameters(&opened);
        stream.set_time_base(video_time_base);
        opened
    };

    let audio_codec =
        encoder::find(codec::Id::PCM_S16LE).ok_or(ffmpeg::Error::EncoderNotFound)?;
    let mut audio_encoder = {
        let mut stream = output.add_stream(audio_codec)?;
        let mut encoder = codec::context::Context::new_with_codec(audio_codec)
            .encoder()
            .audio()?;
        encoder.set_rate(SAMPLE_RATE);
        encoder.set_channel_layout(ChannelLayout::MONO);
        encoder.set_format(format::Sample::I16(format::sample::Type::Packed));
        encoder.set_time_base(audio_time_base);
        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        let opened = encoder.open_as(audio_codec)?;
        stream.set_parameters(&opened);
        stream.set_time_base(audio_time_base);
        opened
    };

    output.write_header()?;
    let video_stream_time_base = output
        .stream(0)
        .ok_or(ffmpeg::Error::StreamNotFound)?
        .time_base();
    let audio_stream_time_base = output
        .stream(1)
        .ok_or(ffmpeg::Error::StreamNotFound)?
        .time_base();

    let samples_per_frame = (SAMPLE_RATE / FPS) as usize;
    for i in 0..frames {
        let mut picture = Video::new(format::Pixel::YUV420P, WIDTH, HEIGHT);
        picture.data_mut(0).fill(16 + (i % 200) as u8);
        picture.data_mut(1).fill(128);
        picture.data_mut(2).fill(128);
        picture.set_pts(Some(i as i64));
        video_encoder.send_frame(&picture)?;
        drain(
            &mut video_encoder,
            0,
            video_time_base,
            video_stream_time_base,
            &mut output,
        )?;

        let mut silence = Audio::new(
            format::Sample::I16(format::sample::Type::Packed),
            samples_per_frame,
            ChannelLayout::MONO,
        );
        silence.set_rate(SAMPLE_RATE as u32);
        silence.data_mut(0).fill(0);
        silence.set_pts(Some((i * samples_per_frame) as i64));
        audio_encoder.send_frame(&silence)?;
        drain(
            &mut audio_encoder,
            1,
            audio_time_base,
            audio_stream_time_base,
            &mut output,
        )?;
    }

    video_encoder.send_eof()?;
    drain(
        &mut video_encoder,
        0,
        video_time_base,
        video_stream_time_base,
        &mut output,
    )?;
    audio_encoder.send_eof()?;
    drain(
        &mut audio_encoder,
        1,
        audio_time_base,
        audio_stream_time_base,
        &mut output,
    )?;
    output.write_trailer()?;
    Ok(())
}
