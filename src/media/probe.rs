use crate::media::rotation::Rotation;
use anyhow::{Context as _, anyhow};
use ffmpeg_next::{Rational, codec, format, frame, media};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Used when a clip carries no usable frame rate.
pub const FALLBACK_FRAME_RATE: Rational = Rational(30, 1);
const MAX_FRAME_RATE: f64 = 120.0;
const AV_TIME_BASE: f64 = 1_000_000.0;
const ROTATION_SCAN_PACKETS: usize = 64;

/// What the pipeline needs to know about one staged input before decoding it.
#[derive(Clone, Debug)]
pub struct ClipInfo {
    pub index: usize,
    pub path: PathBuf,
    /// Upright size, after `rotation`.
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub frame_rate: Rational,
    pub has_audio: bool,
    /// Video duration in seconds, 0.0 when unknown.
    pub duration: f64,
}

impl ClipInfo {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

// checks if a Rational is valid (numerator and denominator are both > 0)
fn is_rational_valid(r: Rational) -> bool {
    r.numerator() > 0 && r.denominator() > 0
}

/// Picks the stream's frame rate: avg_frame_rate first, then r_frame_rate.
/// Rates above 120 fps are container tick rates, not frame rates.
pub fn stream_frame_rate(stream: &ffmpeg_next::Stream) -> Rational {
    let candidates = [stream.avg_frame_rate(), stream.rate()];
    for rate in candidates {
        if is_rational_valid(rate) && f64::from(rate) <= MAX_FRAME_RATE {
            return rate;
        }
    }

    warn!(
        avg = ?stream.avg_frame_rate(),
        r = ?stream.rate(),
        "Unable to determine a usable frame rate, falling back to {}/{}",
        FALLBACK_FRAME_RATE.numerator(),
        FALLBACK_FRAME_RATE.denominator()
    );
    FALLBACK_FRAME_RATE
}

/// Highest frame rate among the clips.
pub fn output_frame_rate(clips: &[ClipInfo]) -> Rational {
    clips
        .iter()
        .map(|clip| clip.frame_rate)
        .max_by(|a, b| f64::from(*a).total_cmp(&f64::from(*b)))
        .unwrap_or(FALLBACK_FRAME_RATE)
}

/// Opens `path` and reads the properties of its best video and audio streams.
pub fn probe(index: usize, path: &Path) -> anyhow::Result<ClipInfo> {
    let mut ictx = format::input(path).map_err(|e| anyhow!("Failed to open input video: {e}"))?;

    let (stream_index, parameters, frame_rate, tagged_rotation, stream_duration) = {
        let video = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| anyhow!("Can not find input video stream"))?;
        let stream_duration = if video.duration() > 0 {
            video.duration() as f64 * f64::from(video.time_base())
        } else {
            0.0
        };
        let tagged_rotation = video.metadata().get("rotate").and_then(Rotation::from_tag);
        (
            video.index(),
            video.parameters(),
            stream_frame_rate(&video),
            tagged_rotation,
            stream_duration,
        )
    };
    let mut decoder = codec::context::Context::from_parameters(parameters)
        .and_then(|ctx| ctx.decoder().video())
        .context("Unsupported video codec")?;

    if decoder.width() == 0 || decoder.height() == 0 {
        return Err(anyhow!(
            "Video stream reports an empty frame size {}x{}",
            decoder.width(),
            decoder.height()
        ));
    }

    // the video stream's own length, the container's when it has none
    let duration = if stream_duration > 0.0 {
        stream_duration
    } else if ictx.duration() > 0 {
        ictx.duration() as f64 / AV_TIME_BASE
    } else {
        0.0
    };
    let has_audio = ictx.streams().best(media::Type::Audio).is_some();
    let rotation = match tagged_rotation {
        Some(rotation) => rotation,
        None => first_frame_rotation(&mut ictx, stream_index, &mut decoder),
    };
    let (width, height) = rotation.display_size(decoder.width(), decoder.height());

    let info = ClipInfo {
        index,
        path: path.to_path_buf(),
        width,
        height,
        rotation,
        frame_rate,
        has_audio,
        duration,
    };

    debug!(
        clip = index,
        name = %info.name(),
        width = info.width,
        height = info.height,
        rotation = ?info.rotation,
        fps = ?info.frame_rate,
        has_audio = info.has_audio,
        duration = info.duration,
        "Clip inspected"
    );
    Ok(info)
}

/// Display matrix of the first decodable frame. Newer FFmpeg builds only
/// expose the phone rotation there, not as a `rotate` tag.
fn first_frame_rotation(
    ictx: &mut format::context::Input,
    stream_index: usize,
    decoder: &mut codec::decoder::Video,
) -> Rotation {
    let mut decoded = frame::Video::empty();
    let packets = ictx
        .packets()
        .filter(|(stream, _)| stream.index() == stream_index)
        .take(ROTATION_SCAN_PACKETS);
    for (_, packet) in packets {
        if decoder.send_packet(&packet).is_err() {
            continue;
        }
        if decoder.receive_frame(&mut decoded).is_ok() {
            return Rotation::of_frame(&decoded).unwrap_or_default();
        }
    }
    Rotation::None
}
