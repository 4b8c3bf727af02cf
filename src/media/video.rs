use crate::media::canvas::Canvas;
use anyhow::anyhow;
use ffmpeg_next::format::Pixel::YUV420P;
use ffmpeg_next::format::context::Output as OutputContext;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use ffmpeg_next::{Dictionary, Packet, Rational, codec, format, frame, threading};
use std::sync::LazyLock;
use tracing::{debug, info, trace};

const PREFERRED_H264_ENCODER: &str = "libx264";

static NUM_CPUS: LazyLock<usize> = LazyLock::new(|| {
    let n = num_cpus::get();
    let num = if n > 16 { 16 } else { n };
    info!(num, "Detecting CPU cores");
    num
});

/// libx264 when the FFmpeg build has it, otherwise any H.264 encoder.
pub fn find_h264_encoder() -> Option<codec::Codec> {
    codec::encoder::find_by_name(PREFERRED_H264_ENCODER)
        .or_else(|| codec::encoder::find(codec::Id::H264))
}

/// H.264 encoder writing the composed canvas frames at a constant frame rate.
pub struct VideoTrack {
    encoder: codec::encoder::video::Encoder,
    stream_index: usize,
    time_base: Rational,
    /// Frames handed to the encoder so far, also the next frame's pts.
    sent: i64,
}

impl VideoTrack {
    pub fn new(
        job_id: &str,
        octx: &mut OutputContext,
        canvas: Canvas,
        frame_rate: Rational,
    ) -> anyhow::Result<Self> {
        let h264_codec = find_h264_encoder()
            .ok_or_else(|| anyhow!("H.264 Encoder: Codec not found (ensure libx264 is part of your FFmpeg build)"))?;
        debug!(%job_id, encoder = h264_codec.name(), "Setting up H.264 video encoder...");
        let global_header = octx.format().flags().contains(format::Flags::GLOBAL_HEADER);

        let mut enc_config = codec::Context::new_with_codec(h264_codec)
            .encoder()
            .video()
            .map_err(|e| anyhow!("H.264 Encoder: Failed to create config: {e}"))?;

        if global_header {
            enc_config.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut threading_config = threading::Config::default();
        threading_config.count = *NUM_CPUS;
        threading_config.kind = threading::Type::Frame;
        enc_config.set_threading(threading_config);

        let time_base = Rational::new(frame_rate.denominator(), frame_rate.numerator());
        enc_config.set_format(YUV420P);
        enc_config.set_width(canvas.width);
        enc_config.set_height(canvas.height);
        enc_config.set_time_base(time_base);
        enc_config.set_frame_rate(Some(frame_rate));

        debug!(%job_id, "H.264 Encoder: {}x{}, time_base={}/{}, frame_rate={}/{}",
            canvas.width, canvas.height,
            time_base.numerator(), time_base.denominator(),
            frame_rate.numerator(), frame_rate.denominator());

        let encoder = enc_config.open_with(Dictionary::new()).map_err(|e| {
            anyhow!(
                "H.264 Encoder: Failed to open: {e}. Input params were {}x{}, FR={}/{}.",
                canvas.width,
                canvas.height,
                frame_rate.numerator(),
                frame_rate.denominator()
            )
        })?;

        let mut ost_video = octx.add_stream(h264_codec)?;
        ost_video.set_parameters(&encoder);
        ost_video.set_time_base(time_base);
        ost_video.set_avg_frame_rate(frame_rate);
        let stream_index = ost_video.index();
        debug!(%job_id, stream_index, "H.264 video stream added to output");

        Ok(Self {
            encoder,
            stream_index,
            time_base,
            sent: 0,
        })
    }

    /// Frames written so far; equals the output slots on the timeline.
    pub fn frames(&self) -> i64 {
        self.sent
    }

    /// Sends `frame` for `repeat` consecutive slots.
    pub fn encode(
        &mut self,
        octx: &mut OutputContext,
        frame: &mut frame::Video,
        repeat: u64,
    ) -> anyhow::Result<()> {
        for _ in 0..repeat {
            frame.set_pts(Some(self.sent));
            self.encoder
                .send_frame(frame)
                .map_err(|e| anyhow!("H.264 Encoder: Failed to send frame: {e}"))?;
            self.sent += 1;
            self.write_packets(octx)?;
        }
        Ok(())
    }

    pub fn finish(&mut self, job_id: &str, octx: &mut OutputContext) -> anyhow::Result<()> {
        self.encoder.send_eof()?;
        self.write_packets(octx)?;
        debug!(%job_id, frames = self.sent, "H.264 video encoder flushed");
        Ok(())
    }

    fn write_packets(&mut self, octx: &mut OutputContext) -> anyhow::Result<()> {
        let stream_time_base = octx
            .stream(self.stream_index)
            .ok_or_else(|| anyhow!("Failed to get output stream for index {}", self.stream_index))?
            .time_base();

        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.time_base, stream_time_base);
            trace!(pts = ?packet.pts(), dts = ?packet.dts(), "Video packet");
            packet
                .write_interleaved(octx)
                .map_err(|e| anyhow!("Output: Error writing interleaved video packet: {e}"))?;
        }
        Ok(())
    }
}

/// Converts decoded frames of one clip to YUV420P at their own size,
/// rebuilding the scaler when the source geometry changes mid-stream.
pub struct ClipConverter {
    scaler: Option<(Scaler, (format::Pixel, u32, u32))>,
}

impl ClipConverter {
    pub fn new() -> Self {
        Self { scaler: None }
    }

    pub fn convert(&mut self, decoded: &frame::Video) -> anyhow::Result<frame::Video> {
        let key = (decoded.format(), decoded.width(), decoded.height());
        let rebuild = match &self.scaler {
            Some((_, current)) => *current != key,
            None => true,
        };
        if rebuild {
            let scaler = Scaler::get(
                key.0,
                key.1,
                key.2,
                YUV420P,
                key.1,
                key.2,
                Flags::BILINEAR,
            )
            .map_err(|e| anyhow!("Video Scaler: Failed to create for {key:?}: {e}"))?;
            self.scaler = Some((scaler, key));
        }

        let Some((scaler, _)) = self.scaler.as_mut() else {
            return Err(anyhow!("Video Scaler: not initialized"));
        };
        let mut converted = frame::Video::empty();
        scaler
            .run(decoded, &mut converted)
            .map_err(|e| anyhow!("Video Scaler: Error during run: {e}"))?;
        Ok(converted)
    }
}

impl Default for ClipConverter {
    fn default() -> Self {
        Self::new()
    }
}
