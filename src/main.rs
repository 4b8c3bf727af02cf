use ffmpeg_next::{self as ffmpeg};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use video_merger::Config;
use video_merger::media::find_h264_encoder;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    ffmpeg::init().expect("Failed to initialize FFmpeg");
    // libav prints decoder chatter to stderr; failures reach us as errors anyway
    ffmpeg::log::set_level(ffmpeg::log::Level::Error);
    if find_h264_encoder().is_none() {
        warn!("No H.264 encoder in this FFmpeg build, every merge will fail");
    }

    // Load configuration from CLI and/or config file
    let config = Config::load().expect("Failed to load configuration");
    if let Err(error) = video_merger::run(config).await {
        error!(?error, "Server stopped");
        std::process::exit(1);
    }
}
