use crate::error::MergeError;
use crate::media::audio::{AAC_TARGET_RATE, AudioTrack, ClipResampler};
use crate::media::canvas::Canvas;
use crate::media::clock::{FrameClock, samples_for_slots};
use crate::media::probe::{ClipInfo, output_frame_rate, probe};
use crate::media::video::{ClipConverter, VideoTrack};
use anyhow::{Context as _, anyhow, bail};
use ffmpeg_next::format::context::Output as OutputContext;
use ffmpeg_next::{Rational, codec, format, frame, media};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MIN_SHORTFALL_SECS: f64 = 0.5;
const MAX_SHORTFALL_RATIO: f64 = 0.05;

/// Where a running merge is, as shown to the user.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct MergeProgress {
    /// 1-based index of the clip being processed.
    pub clip: usize,
    pub clips: usize,
    pub percent: u8,
}

/// Properties of a finished output file.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MergeSummary {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub frames: i64,
    pub duration_secs: f64,
    pub has_audio: bool,
}

/// Concatenates `inputs` in order into an H.264/AAC MP4 at `output`.
///
/// Blocking; run it on the blocking pool. On any failure, including
/// cancellation, the partially written `output` is removed.
pub fn merge_clips<F>(
    job_id: &str,
    inputs: &[PathBuf],
    output: &Path,
    cancel: &CancellationToken,
    mut progress: F,
) -> Result<MergeSummary, MergeError>
where
    F: FnMut(MergeProgress),
{
    match run_merge(job_id, inputs, output, cancel, &mut progress) {
        Ok(summary) => {
            info!(
                %job_id,
                ?output,
                frames = summary.frames,
                duration = summary.duration_secs,
                "Merge completed successfully."
            );
            Ok(summary)
        }
        Err(error) => {
            match std::fs::remove_file(output) {
                Ok(()) => debug!(%job_id, ?output, "Removed partial output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(%job_id, ?output, "Failed to remove partial output: {e}"),
            }
            Err(MergeError::from_pipeline(error))
        }
    }
}

fn run_merge(
    job_id: &str,
    inputs: &[PathBuf],
    output: &Path,
    cancel: &CancellationToken,
    progress: &mut dyn FnMut(MergeProgress),
) -> anyhow::Result<MergeSummary> {
    if inputs.is_empty() {
        bail!("No clips to merge");
    }

    let clips = inputs
        .iter()
        .enumerate()
        .map(|(index, path)| {
            probe(index, path).with_context(|| format!("Clip {} ({})", index + 1, staged_name(path)))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let canvas = Canvas::covering(clips.iter().map(|clip| (clip.width, clip.height)))
        .ok_or_else(|| anyhow!("Clips report no usable frame size"))?;
    let frame_rate = output_frame_rate(&clips);
    let has_audio = clips.iter().any(|clip| clip.has_audio);
    info!(
        %job_id,
        clips = clips.len(),
        width = canvas.width,
        height = canvas.height,
        fps = ?frame_rate,
        has_audio,
        "Merging clips"
    );

    let mut octx = format::output(output).map_err(|e| anyhow!("Failed to create output context: {e}"))?;
    let mut video = VideoTrack::new(job_id, &mut octx, canvas, frame_rate)?;
    let mut audio = if has_audio {
        Some(AudioTrack::new(job_id, &mut octx)?)
    } else {
        None
    };

    octx.write_header()
        .map_err(|e| anyhow!("Output: Failed to write context header: {e}"))?;
    debug!(%job_id, "Output context header written successfully.");

    let mut reporter = ProgressReporter::new(&clips);
    for clip in &clips {
        let mut pass = ClipPass {
            job_id,
            clip,
            canvas,
            frame_rate,
            octx: &mut octx,
            video: &mut video,
            audio: audio.as_mut(),
            cancel,
        };
        pass.run(&mut reporter, progress)
            .with_context(|| format!("Clip {} ({})", clip.index + 1, clip.name()))?;
        reporter.clip_finished(clip);
    }

    debug!(%job_id, "Flushing encoders...");
    video.finish(job_id, &mut octx)?;
    if let Some(audio) = audio.as_mut() {
        audio.finish(job_id, &mut octx)?;
    }
    octx.write_trailer()
        .map_err(|e| anyhow!("Output: Failed to write trailer: {e}"))?;

    progress(MergeProgress {
        clip: clips.len(),
        clips: clips.len(),
        percent: 100,
    });

    let fps = f64::from(frame_rate);
    Ok(MergeSummary {
        width: canvas.width,
        height: canvas.height,
        frame_rate: fps,
        frames: video.frames(),
        duration_secs: video.frames() as f64 / fps,
        has_audio,
    })
}

fn staged_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The audio half of one clip: its decoder and resampler.
struct ClipAudio {
    stream_index: usize,
    decoder: codec::decoder::Audio,
    resampler: ClipResampler,
}

/// Decodes one clip and appends it to the shared output tracks.
struct ClipPass<'a> {
    job_id: &'a str,
    clip: &'a ClipInfo,
    canvas: Canvas,
    frame_rate: Rational,
    octx: &'a mut OutputContext,
    video: &'a mut VideoTrack,
    audio: Option<&'a mut AudioTrack>,
    cancel: &'a CancellationToken,
}

/// A composed frame waiting to learn how many output slots it covers.
struct HeldFrame {
    frame: frame::Video,
    seconds: f64,
}

impl ClipPass<'_> {
    fn run(
        &mut self,
        reporter: &mut ProgressReporter,
        progress: &mut dyn FnMut(MergeProgress),
    ) -> anyhow::Result<()> {
        let job_id = self.job_id;
        let mut ictx =
            format::input(&self.clip.path).map_err(|e| anyhow!("Failed to open input video: {e}"))?;

        let in_video = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| anyhow!("Can not find input video stream"))?;
        let in_video_idx = in_video.index();
        let in_video_time_base = in_video.time_base();
        let mut dec_video = codec::context::Context::from_parameters(in_video.parameters())?
            .decoder()
            .video()?;

        let in_audio = ictx
            .streams()
            .best(media::Type::Audio)
            .map(|stream| (stream.index(), stream.parameters()));
        let mut clip_audio = match (&self.audio, in_audio) {
            (Some(_), Some((stream_index, parameters))) => self.open_audio(stream_index, parameters),
            _ => None,
        };

        let clip_fps = f64::from(self.clip.frame_rate);
        let mut clock = FrameClock::new(self.frame_rate);
        let mut converter = ClipConverter::new();
        let mut held: Option<HeldFrame> = None;
        let mut first_ts: Option<i64> = None;
        let mut decoded_frames: u64 = 0;
        let mut decoded_video = frame::Video::empty();
        let mut decoded_audio = frame::Audio::empty();

        info!(%job_id, clip = self.clip.index + 1, name = %self.clip.name(), "Processing clip");

        for (stream, packet) in ictx.packets() {
            if self.cancel.is_cancelled() {
                info!(%job_id, clip = self.clip.index + 1, "Merge cancelled");
                return Err(MergeError::Cancelled.into());
            }

            if stream.index() == in_video_idx {
                if dec_video.send_packet(&packet).is_err() {
                    warn!(%job_id, "Video Decoder: Error sending packet, skipping.");
                    continue;
                }
                while dec_video.receive_frame(&mut decoded_video).is_ok() {
                    let seconds = frame_seconds(
                        &decoded_video,
                        &mut first_ts,
                        in_video_time_base,
                        decoded_frames,
                        clip_fps,
                    );
                    decoded_frames += 1;
                    self.show(&mut clock, &mut held, &mut converter, &decoded_video, seconds)?;
                    if let Some(update) = reporter.update(self.clip, seconds) {
                        progress(update);
                    }
                }
            } else if let Some(audio) = clip_audio.as_mut().filter(|a| a.stream_index == stream.index()) {
                if audio.decoder.send_packet(&packet).is_err() {
                    warn!(%job_id, "Audio Decoder: Error sending packet, skipping.");
                    continue;
                }
                self.receive_audio(audio, &mut decoded_audio)?;
            }
        }

        debug!(%job_id, clip = self.clip.index + 1, "Flushing clip decoders...");
        dec_video.send_eof()?;
        while dec_video.receive_frame(&mut decoded_video).is_ok() {
            let seconds = frame_seconds(
                &decoded_video,
                &mut first_ts,
                in_video_time_base,
                decoded_frames,
                clip_fps,
            );
            decoded_frames += 1;
            self.show(&mut clock, &mut held, &mut converter, &decoded_video, seconds)?;
        }

        let Some(mut last) = held else {
            bail!("No decodable video frames");
        };
        let end = last.seconds + 1.0 / clip_fps;
        check_coverage(self.clip.duration, end)?;
        let repeat = clock.finish(end);
        self.video.encode(self.octx, &mut last.frame, repeat)?;

        if let Some(mut audio) = clip_audio {
            audio.decoder.send_eof()?;
            self.receive_audio(&mut audio, &mut decoded_audio)?;
            if let Some(track) = self.audio.as_deref_mut() {
                audio.resampler.flush(track)?;
            }
        }

        let target = samples_for_slots(self.video.frames() as u64, self.frame_rate, AAC_TARGET_RATE);
        if let Some(track) = self.audio.as_deref_mut() {
            track.align_to(job_id, target);
            track.drain_until(self.octx, target)?;
        }

        debug!(
            %job_id,
            clip = self.clip.index + 1,
            decoded_frames,
            slots = clock.emitted(),
            "Clip appended"
        );
        Ok(())
    }

    fn open_audio(&self, stream_index: usize, parameters: codec::Parameters) -> Option<ClipAudio> {
        let job_id = self.job_id;
        let decoder = match codec::context::Context::from_parameters(parameters)
            .and_then(|ctx| ctx.decoder().audio())
        {
            Ok(decoder) => decoder,
            Err(e) => {
                warn!(%job_id, clip = self.clip.index + 1, "Audio Decoder: {e}, using silence instead.");
                return None;
            }
        };
        match ClipResampler::new(job_id, &decoder) {
            Ok(resampler) => Some(ClipAudio {
                stream_index,
                decoder,
                resampler,
            }),
            Err(error) => {
                warn!(%job_id, clip = self.clip.index + 1, ?error, "Using silence instead of clip audio.");
                None
            }
        }
    }

    /// Resamples every frame the audio decoder has ready and encodes as much
    /// as the video written so far allows.
    fn receive_audio(&mut self, audio: &mut ClipAudio, decoded: &mut frame::Audio) -> anyhow::Result<()> {
        let Some(track) = self.audio.as_deref_mut() else {
            return Ok(());
        };
        while audio.decoder.receive_frame(decoded).is_ok() {
            if let Err(error) = audio.resampler.run(decoded, track) {
                warn!(job_id = %self.job_id, ?error, "Skipping audio frame.");
                continue;
            }
        }
        let limit = samples_for_slots(self.video.frames() as u64, self.frame_rate, AAC_TARGET_RATE);
        track.drain_until(self.octx, limit)
    }

    /// Emits the held frame for the slots that start before `seconds`, then
    /// holds the newly decoded one.
    fn show(
        &mut self,
        clock: &mut FrameClock,
        held: &mut Option<HeldFrame>,
        converter: &mut ClipConverter,
        decoded: &frame::Video,
        seconds: f64,
    ) -> anyhow::Result<()> {
        if let Some(previous) = held.as_mut() {
            let repeat = clock.advance_to(seconds);
            self.video.encode(self.octx, &mut previous.frame, repeat)?;
        }

        let upright = self.clip.rotation.apply(converter.convert(decoded)?)?;
        *held = Some(HeldFrame {
            frame: self.canvas.compose(&upright)?,
            seconds,
        });

        if let Some(track) = self.audio.as_deref_mut() {
            let limit = samples_for_slots(self.video.frames() as u64, self.frame_rate, AAC_TARGET_RATE);
            track.drain_until(self.octx, limit)?;
        }
        Ok(())
    }
}

/// Fails when the decoded frames cover noticeably less than the stream's
/// `expected` duration, as with a truncated file that still opens.
fn check_coverage(expected: f64, decoded: f64) -> anyhow::Result<()> {
    let allowed = (expected * MAX_SHORTFALL_RATIO).max(MIN_SHORTFALL_SECS);
    if expected > 0.0 && decoded + allowed < expected {
        bail!("Decoded only {decoded:.2}s of {expected:.2}s, the file is truncated or damaged");
    }
    Ok(())
}

/// Seconds since the clip's first frame. Frames without a timestamp are
/// placed by their index at the clip's own frame rate.
fn frame_seconds(
    decoded: &frame::Video,
    first_ts: &mut Option<i64>,
    time_base: Rational,
    index: u64,
    clip_fps: f64,
) -> f64 {
    match decoded.timestamp().or(decoded.pts()) {
        Some(ts) => {
            let start = *first_ts.get_or_insert(ts);
            ts.saturating_sub(start) as f64 * f64::from(time_base)
        }
        None => index as f64 / clip_fps,
    }
}

/// Turns per-frame positions into throttled progress updates.
struct ProgressReporter {
    clips: usize,
    total: f64,
    done: f64,
    last: Option<(usize, u8)>,
}

impl ProgressReporter {
    fn new(clips: &[ClipInfo]) -> Self {
        Self {
            clips: clips.len(),
            total: clips.iter().map(|clip| clip.duration).sum(),
            done: 0.0,
            last: None,
        }
    }

    /// An update when the clip or the whole percent changed since the last one.
    fn update(&mut self, clip: &ClipInfo, seconds: f64) -> Option<MergeProgress> {
        let percent = if self.total > 0.0 {
            let position = self.done + seconds.clamp(0.0, clip.duration.max(0.0));
            position / self.total * 100.0
        } else {
            clip.index as f64 / self.clips.max(1) as f64 * 100.0
        };
        // 100 is reserved for the written trailer
        let percent = percent.clamp(0.0, 99.0) as u8;

        let key = (clip.index, percent);
        if self.last == Some(key) {
            return None;
        }
        self.last = Some(key);
        Some(MergeProgress {
            clip: clip.index + 1,
            clips: self.clips,
            percent,
        })
    }

    fn clip_finished(&mut self, clip: &ClipInfo) {
        self.done += clip.duration.max(0.0);
    }
}
