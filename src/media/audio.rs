use anyhow::{anyhow, bail};
use ffmpeg_next::format::context::Output as OutputContext;
use ffmpeg_next::format::{self, Sample};
use ffmpeg_next::frame;
use ffmpeg_next::software::resampling::Context as SamplerContext;
use ffmpeg_next::{ChannelLayout, Dictionary, Packet, Rational, codec};
use tracing::{debug, trace, warn};

// AAC target parameters
pub const AAC_TARGET_FORMAT: Sample = Sample::F32(format::sample::Type::Planar);
pub const AAC_TARGET_RATE: u32 = 44_100;
pub const AAC_TARGET_LAYOUT: ChannelLayout = ChannelLayout::STEREO;
pub const AAC_TARGET_CHANNELS: usize = 2;
const AAC_FALLBACK_FRAME_SIZE: usize = 1024;

/// Planar float samples waiting to be cut into encoder-sized frames.
#[derive(Debug)]
pub struct SampleFifo {
    planes: Vec<Vec<f32>>,
}

impl SampleFifo {
    pub fn new(channels: usize) -> Self {
        Self {
            planes: vec![Vec::new(); channels],
        }
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.planes.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push_planes(&mut self, planes: &[&[f32]]) {
        for (fifo, plane) in self.planes.iter_mut().zip(planes) {
            fifo.extend_from_slice(plane);
        }
    }

    pub fn push_silence(&mut self, samples: usize) {
        for plane in self.planes.iter_mut() {
            plane.resize(plane.len() + samples, 0.0);
        }
    }

    /// Drops samples from the back so at most `samples` remain.
    pub fn truncate(&mut self, samples: usize) {
        for plane in self.planes.iter_mut() {
            plane.truncate(samples);
        }
    }

    /// Removes up to `samples` from the front.
    pub fn pop(&mut self, samples: usize) -> Vec<Vec<f32>> {
        let take = samples.min(self.len());
        self.planes
            .iter_mut()
            .map(|plane| plane.drain(..take).collect())
            .collect()
    }
}

/// AAC encoder plus the bookkeeping that keeps audio on the video timeline.
pub struct AudioTrack {
    encoder: codec::encoder::audio::Encoder,
    stream_index: usize,
    frame_size: usize,
    fifo: SampleFifo,
    /// Samples handed to the encoder so far, also the next frame's pts.
    sent: i64,
}

impl AudioTrack {
    pub fn new(job_id: &str, octx: &mut OutputContext) -> anyhow::Result<Self> {
        debug!(%job_id, "Setting up AAC audio encoder...");
        let global_header = octx.format().flags().contains(format::Flags::GLOBAL_HEADER);

        let aac_codec = codec::encoder::find(codec::Id::AAC)
            .ok_or_else(|| anyhow!("AAC Encoder: Codec not found"))?;

        let mut enc_config = codec::Context::new_with_codec(aac_codec)
            .encoder()
            .audio()
            .map_err(|e| anyhow!("AAC Encoder: Failed to create config: {e}"))?;

        enc_config.set_format(AAC_TARGET_FORMAT);
        enc_config.set_rate(AAC_TARGET_RATE as i32);
        enc_config.set_channel_layout(AAC_TARGET_LAYOUT);
        enc_config.set_time_base(Rational::new(1, AAC_TARGET_RATE as i32));
        if global_header {
            enc_config.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let encoder = enc_config
            .open_with(Dictionary::new())
            .map_err(|e| anyhow!("AAC Encoder: Failed to open: {e}"))?;

        let frame_size = match encoder.frame_size() {
            0 => {
                warn!(%job_id, "AAC encoder reported frame_size 0, using {AAC_FALLBACK_FRAME_SIZE}");
                AAC_FALLBACK_FRAME_SIZE
            }
            size => size as usize,
        };

        let mut ost_audio = octx.add_stream(aac_codec)?;
        ost_audio.set_parameters(&encoder);
        ost_audio.set_time_base(Rational::new(1, AAC_TARGET_RATE as i32));
        let stream_index = ost_audio.index();
        debug!(%job_id, stream_index, frame_size, "AAC audio stream added to output");

        Ok(Self {
            encoder,
            stream_index,
            frame_size,
            fifo: SampleFifo::new(AAC_TARGET_CHANNELS),
            sent: 0,
        })
    }

    /// Samples on the timeline so far, encoded or buffered.
    pub fn timeline_len(&self) -> i64 {
        self.sent + self.fifo.len() as i64
    }

    pub fn push_resampled(&mut self, resampled: &frame::Audio) {
        if resampled.samples() == 0 {
            return;
        }
        let planes = (0..AAC_TARGET_CHANNELS)
            .map(|ch| resampled.plane::<f32>(ch))
            .collect::<Vec<_>>();
        self.fifo.push_planes(&planes);
    }

    /// Pads with silence or trims buffered samples so the track ends at `target`.
    pub fn align_to(&mut self, job_id: &str, target: i64) {
        let len = self.timeline_len();
        if len < target {
            self.fifo.push_silence((target - len) as usize);
        } else if len > target {
            let keep = (target - self.sent).max(0) as usize;
            if target < self.sent {
                warn!(%job_id, target, sent = self.sent, "Audio already ahead of video, cannot trim encoded samples");
            }
            self.fifo.truncate(keep);
        }
    }

    /// Encodes full frames while the encoded audio stays within `limit` samples.
    pub fn drain_until(&mut self, octx: &mut OutputContext, limit: i64) -> anyhow::Result<()> {
        let frame_size = self.frame_size as i64;
        while self.fifo.len() >= self.frame_size && self.sent + frame_size <= limit {
            let planes = self.fifo.pop(self.frame_size);
            self.send_planes(&planes)?;
            self.write_packets(octx)?;
        }
        Ok(())
    }

    /// Encodes everything left, including a short last frame, then flushes.
    pub fn finish(&mut self, job_id: &str, octx: &mut OutputContext) -> anyhow::Result<()> {
        while !self.fifo.is_empty() {
            let planes = self.fifo.pop(self.frame_size);
            self.send_planes(&planes)?;
            self.write_packets(octx)?;
        }

        self.encoder.send_eof()?;
        self.write_packets(octx)?;
        debug!(
            %job_id,
            samples = self.sent,
            seconds = self.sent as f64 / AAC_TARGET_RATE as f64,
            "AAC audio encoder flushed"
        );
        Ok(())
    }

    fn send_planes(&mut self, planes: &[Vec<f32>]) -> anyhow::Result<()> {
        let samples = planes.first().map(Vec::len).unwrap_or(0);
        if samples == 0 {
            return Ok(());
        }

        let mut input = frame::Audio::new(AAC_TARGET_FORMAT, samples, AAC_TARGET_LAYOUT);
        input.set_rate(AAC_TARGET_RATE);
        for (ch, plane) in planes.iter().enumerate() {
            input.plane_mut::<f32>(ch).copy_from_slice(plane);
        }
        input.set_pts(Some(self.sent));

        self.encoder
            .send_frame(&input)
            .map_err(|e| anyhow!("AAC Encoder: Failed to send frame: {e}"))?;
        self.sent += samples as i64;
        Ok(())
    }

    fn write_packets(&mut self, octx: &mut OutputContext) -> anyhow::Result<()> {
        let encoder_time_base = Rational::new(1, AAC_TARGET_RATE as i32);
        let stream_time_base = octx
            .stream(self.stream_index)
            .ok_or_else(|| anyhow!("Failed to get output stream for index {}", self.stream_index))?
            .time_base();

        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(encoder_time_base, stream_time_base);
            trace!(pts = ?packet.pts(), duration = packet.duration(), "Audio packet");
            packet
                .write_interleaved(octx)
                .map_err(|e| anyhow!("Output: Error writing interleaved audio packet: {e}"))?;
        }
        Ok(())
    }
}

/// Converts one clip's decoded audio into the AAC sample layout.
pub struct ClipResampler {
    context: SamplerContext,
    in_layout: ChannelLayout,
    in_rate: u32,
}

impl ClipResampler {
    pub fn new(job_id: &str, dec_audio: &codec::decoder::Audio) -> anyhow::Result<Self> {
        let in_ch_layout = dec_audio.channel_layout();
        let mut in_ch_layout_valid = if in_ch_layout.is_empty() || in_ch_layout.channels() == 0 {
            debug!(%job_id, "Audio Resampler: Input channel layout is empty, using default for {} channels.", dec_audio.channels());
            ChannelLayout::default(dec_audio.channels().into())
        } else {
            in_ch_layout
        };
        if in_ch_layout_valid.channels() != dec_audio.channels() as i32 && dec_audio.channels() > 0 {
            warn!(%job_id, "Audio Resampler: Channel layout {in_ch_layout_valid:?} does not match decoder channel count {}, adjusting layout.", dec_audio.channels());
            in_ch_layout_valid = ChannelLayout::default(dec_audio.channels().into());
        }
        if dec_audio.rate() == 0 {
            bail!("Audio Resampler: Input reports a sample rate of 0");
        }

        let context = SamplerContext::get(
            dec_audio.format(),
            in_ch_layout_valid,
            dec_audio.rate(),
            AAC_TARGET_FORMAT,
            AAC_TARGET_LAYOUT,
            AAC_TARGET_RATE,
        )
        .map_err(|e| anyhow!("Audio Resampler: Failed to create: {e}"))?;

        Ok(Self {
            context,
            in_layout: in_ch_layout_valid,
            in_rate: dec_audio.rate(),
        })
    }

    fn output_frame(&self, input_samples: usize) -> frame::Audio {
        let capacity = converted_capacity(input_samples, self.in_rate, AAC_TARGET_RATE);
        let mut output = frame::Audio::new(AAC_TARGET_FORMAT, capacity, AAC_TARGET_LAYOUT);
        output.set_rate(AAC_TARGET_RATE);
        output
    }

    pub fn run(&mut self, decoded: &mut frame::Audio, track: &mut AudioTrack) -> anyhow::Result<()> {
        // decoders may leave the layout unset, which the resampler treats as a format change
        decoded.set_channel_layout(self.in_layout);
        let mut output = self.output_frame(decoded.samples());
        self.context
            .run(decoded, &mut output)
            .map_err(|e| anyhow!("Audio Resampler: Error during run: {e}"))?;
        track.push_resampled(&output);
        Ok(())
    }

    /// Pulls the samples still buffered inside the resampler.
    pub fn flush(&mut self, track: &mut AudioTrack) -> anyhow::Result<()> {
        loop {
            let mut output = self.output_frame(0);
            match self.context.flush(&mut output) {
                Ok(_) if output.samples() > 0 => track.push_resampled(&output),
                Ok(_) => return Ok(()),
                Err(e) => return Err(anyhow!("Audio Resampler: Error during flush: {e}")),
            }
        }
    }
}

/// Output samples that `input` samples can become, plus headroom for the
/// resampler's internal delay.
pub fn converted_capacity(input: usize, in_rate: u32, out_rate: u32) -> usize {
    const HEADROOM: usize = 1024;
    if in_rate == 0 {
        return input + HEADROOM;
    }
    (input as u64 * out_rate as u64).div_ceil(in_rate as u64) as usize + HEADROOM
}
