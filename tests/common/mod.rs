#![allow(dead_code)]

use anyhow::anyhow;
use ffmpeg_next::format::Pixel::YUV420P;
use ffmpeg_next::format::context::Output as OutputContext;
use ffmpeg_next::{ChannelLayout, Dictionary, Packet, Rational, codec, format, frame, media};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use video_merger::Config;
use video_merger::media::find_h264_encoder;

const AUDIO_RATE: i32 = 44_100;

/// Test harness that runs the server inside the test runtime
pub struct TestServer {
    handle: JoinHandle<()>,
    port: u16,
    workspace: PathBuf,
    client: reqwest::Client,
}

impl TestServer {
    pub async fn start() -> Self {
        // Only open when debugging
        // tracing_subscriber::fmt::init();
        ffmpeg_next::init().unwrap();

        let port = portpicker::pick_unused_port().expect("No available port");
        let test_id = uuid::Uuid::new_v4().to_string();
        let workspace = std::env::temp_dir().join(format!("test-merger-{test_id}"));

        let config = Config {
            listen_on_port: port,
            workspace: workspace.to_string_lossy().into_owned(),
            ..Default::default()
        };

        let handle = tokio::spawn(async move {
            video_merger::run(config).await.expect("server failed");
        });

        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap();

        // Poll until server is ready
        for _ in 0..100 {
            if let Ok(response) = client.get(format!("http://127.0.0.1:{port}/")).send().await
                && response.status().is_success()
            {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        TestServer {
            handle,
            port,
            workspace,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.workspace.join("jobs")
    }

    /// Posts a merge form with `count` and the given `(field, file name, bytes)` parts.
    pub async fn submit(&self, count: &str, files: Vec<(&str, &str, Vec<u8>)>) -> reqwest::Response {
        let mut form = reqwest::multipart::Form::new().text("count", count.to_string());
        for (field, name, content) in files {
            let part = reqwest::multipart::Part::bytes(content).file_name(name.to_string());
            form = form.part(field.to_string(), part);
        }

        self.client
            .post(self.url("/merge"))
            .multipart(form)
            .send()
            .await
            .expect("merge request failed")
    }

    /// Polls the job until it reaches done, failed or cancelled.
    pub async fn wait_for_job(&self, status_url: &str) -> JsonValue {
        for _ in 0..1200 {
            let response = self
                .client
                .get(self.url(status_url))
                .send()
                .await
                .expect("status request failed");
            assert_eq!(response.status(), 200);
            let status: JsonValue = response.json().await.unwrap();
            if matches!(
                status["state"].as_str(),
                Some("done" | "failed" | "cancelled")
            ) {
                return status;
            }
            sleep(Duration::from_millis(100)).await;
        }
        panic!("job {status_url} did not finish in time");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();

        // Clean up test workspace
        std::fs::remove_dir_all(&self.workspace).ok();
    }
}

/// Whether this FFmpeg build can both write the fixtures and run a merge.
pub fn encoders_available() -> bool {
    ffmpeg_next::init().unwrap();
    let available = find_h264_encoder().is_some()
        && codec::encoder::find(codec::Id::MPEG4).is_some()
        && codec::encoder::find(codec::Id::AAC).is_some();
    if !available {
        eprintln!("skipping: FFmpeg build lacks an H.264, MPEG-4 or AAC encoder");
    }
    available
}

/// A solid-gray test clip.
#[derive(Clone, Debug)]
pub struct ClipSpec {
    pub width: u32,
    pub height: u32,
    pub fps: i32,
    pub frames: i64,
    pub luma: u8,
    pub audio: bool,
}

impl ClipSpec {
    pub fn new(width: u32, height: u32, luma: u8) -> Self {
        Self {
            width,
            height,
            fps: 25,
            frames: 25,
            luma,
            audio: true,
        }
    }

    pub fn duration(&self) -> f64 {
        self.frames as f64 / self.fps as f64
    }
}

fn write_packets<E>(
    encoder: &mut E,
    octx: &mut OutputContext,
    stream_index: usize,
    encoder_time_base: Rational,
) -> anyhow::Result<()>
where
    E: std::ops::DerefMut<Target = codec::encoder::Encoder>,
{
    let stream_time_base = octx
        .stream(stream_index)
        .ok_or_else(|| anyhow!("missing stream {stream_index}"))?
        .time_base();
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(encoder_time_base, stream_time_base);
        packet.write_interleaved(octx)?;
    }
    Ok(())
}

/// Writes `spec` as MPEG-4 Part 2 / AAC at `path`, muxed by its extension.
pub fn write_clip(path: &Path, spec: &ClipSpec) -> anyhow::Result<()> {
    let mut octx = format::output(path)?;
    let global_header = octx.format().flags().contains(format::Flags::GLOBAL_HEADER);

    let video_codec =
        codec::encoder::find(codec::Id::MPEG4).ok_or_else(|| anyhow!("no MPEG-4 encoder"))?;
    let video_time_base = Rational::new(1, spec.fps);
    let mut video_config = codec::Context::new_with_codec(video_codec)
        .encoder()
        .video()?;
    video_config.set_width(spec.width);
    video_config.set_height(spec.height);
    video_config.set_format(YUV420P);
    video_config.set_time_base(video_time_base);
    video_config.set_frame_rate(Some(Rational::new(spec.fps, 1)));
    if global_header {
        video_config.set_flags(codec::Flags::GLOBAL_HEADER);
    }
    let mut video = video_config.open_with(Dictionary::new())?;
    let mut video_stream = octx.add_stream(video_codec)?;
    video_stream.set_parameters(&video);
    video_stream.set_time_base(video_time_base);
    let video_index = video_stream.index();

    let audio_time_base = Rational::new(1, AUDIO_RATE);
    let mut audio = if spec.audio {
        let audio_codec =
            codec::encoder::find(codec::Id::AAC).ok_or_else(|| anyhow!("no AAC encoder"))?;
        let mut audio_config = codec::Context::new_with_codec(audio_codec)
            .encoder()
            .audio()?;
        audio_config.set_format(format::Sample::F32(format::sample::Type::Planar));
        audio_config.set_rate(AUDIO_RATE);
        audio_config.set_channel_layout(ChannelLayout::STEREO);
        audio_config.set_time_base(audio_time_base);
        if global_header {
            audio_config.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        let encoder = audio_config.open_with(Dictionary::new())?;
        let mut audio_stream = octx.add_stream(audio_codec)?;
        audio_stream.set_parameters(&encoder);
        audio_stream.set_time_base(audio_time_base);
        Some((encoder, audio_stream.index()))
    } else {
        None
    };

    octx.write_header()?;

    for index in 0..spec.frames {
        let mut picture = frame::Video::new(YUV420P, spec.width, spec.height);
        picture.data_mut(0).fill(spec.luma);
        picture.data_mut(1).fill(128);
        picture.data_mut(2).fill(128);
        picture.set_pts(Some(index));
        video.send_frame(&picture)?;
        write_packets(&mut video, &mut octx, video_index, video_time_base)?;
    }
    video.send_eof()?;
    write_packets(&mut video, &mut octx, video_index, video_time_base)?;

    if let Some((encoder, stream_index)) = audio.as_mut() {
        let frame_size = match encoder.frame_size() {
            0 => 1024,
            size => size as usize,
        };
        let total = (spec.frames * AUDIO_RATE as i64 / spec.fps as i64) as usize;
        let mut sent = 0usize;
        while sent < total {
            let samples = frame_size.min(total - sent);
            let mut chunk = frame::Audio::new(
                format::Sample::F32(format::sample::Type::Planar),
                samples,
                ChannelLayout::STEREO,
            );
            chunk.set_rate(AUDIO_RATE as u32);
            for ch in 0..2 {
                for (i, sample) in chunk.plane_mut::<f32>(ch).iter_mut().enumerate() {
                    let t = (sent + i) as f32 / AUDIO_RATE as f32;
                    *sample = 0.2 * (2.0 * std::f32::consts::PI * 440.0 * t).sin();
                }
            }
            chunk.set_pts(Some(sent as i64));
            encoder.send_frame(&chunk)?;
            write_packets(&mut *encoder, &mut octx, *stream_index, audio_time_base)?;
            sent += samples;
        }
        encoder.send_eof()?;
        write_packets(&mut *encoder, &mut octx, *stream_index, audio_time_base)?;
    }

    octx.write_trailer()?;
    Ok(())
}

/// Bytes of a freshly written test clip.
pub fn clip_bytes(spec: &ClipSpec) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.mp4");
    write_clip(&path, spec).expect("failed to write fixture clip");
    std::fs::read(&path).unwrap()
}

/// What the tests check about a merged file.
#[derive(Debug)]
pub struct OutputInfo {
    pub width: u32,
    pub height: u32,
    pub duration: f64,
    pub has_audio: bool,
    pub video_codec: codec::Id,
    /// Luma at the center of every decoded frame, in order.
    pub center_luma: Vec<u8>,
}

pub fn inspect_output(path: &Path) -> anyhow::Result<OutputInfo> {
    let mut ictx = format::input(path)?;
    let duration = ictx.duration() as f64 / 1_000_000.0;
    let has_audio = ictx.streams().best(media::Type::Audio).is_some();
    let stream = ictx
        .streams()
        .best(media::Type::Video)
        .ok_or_else(|| anyhow!("no video stream"))?;
    let index = stream.index();
    let parameters = stream.parameters();
    let mut decoder = codec::context::Context::from_parameters(parameters)?
        .decoder()
        .video()?;
    let video_codec = decoder.id();

    let mut center_luma = Vec::new();
    let mut decoded = frame::Video::empty();
    let mut sample = |decoded: &frame::Video| {
        let x = decoded.width() as usize / 2;
        let y = decoded.height() as usize / 2;
        center_luma.push(decoded.data(0)[y * decoded.stride(0) + x]);
    };
    for (stream, packet) in ictx.packets() {
        if stream.index() != index {
            continue;
        }
        decoder.send_packet(&packet)?;
        while decoder.receive_frame(&mut decoded).is_ok() {
            sample(&decoded);
        }
    }
    decoder.send_eof()?;
    while decoder.receive_frame(&mut decoded).is_ok() {
        sample(&decoded);
    }

    Ok(OutputInfo {
        width: decoder.width(),
        height: decoder.height(),
        duration,
        has_audio,
        video_codec,
        center_luma,
    })
}

pub fn close_to(actual: u8, expected: u8) -> bool {
    actual.abs_diff(expected) <= 6
}
