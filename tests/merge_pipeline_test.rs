mod common;

use bytes::Bytes;
use common::{ClipSpec, clip_bytes, close_to, encoders_available, inspect_output, write_clip};
use ffmpeg_next::codec;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use video_merger::{
    JobManager, JobStatus, MergeError, MergeProgress, UploadedFile, merge_clips,
};

fn write_clips(dir: &std::path::Path, specs: &[ClipSpec]) -> Vec<PathBuf> {
    specs
        .iter()
        .enumerate()
        .map(|(slot, spec)| {
            let path = dir.join(format!("{slot:02}-clip.mp4"));
            write_clip(&path, spec).expect("failed to write fixture clip");
            path
        })
        .collect()
}

#[test]
fn test_clips_are_concatenated_in_order() {
    if !encoders_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let specs = [
        ClipSpec::new(160, 120, 50),
        ClipSpec::new(160, 120, 120),
        ClipSpec::new(160, 120, 200),
    ];
    let inputs = write_clips(dir.path(), &specs);
    let output = dir.path().join("merged_video.mp4");

    let mut updates = Vec::new();
    let summary = merge_clips("order", &inputs, &output, &CancellationToken::new(), |p| {
        updates.push(p)
    })
    .unwrap();

    let expected: f64 = specs.iter().map(ClipSpec::duration).sum();
    assert_eq!(summary.frames, 75);
    assert!((summary.duration_secs - expected).abs() < 0.05);
    assert!(summary.has_audio);

    let info = inspect_output(&output).unwrap();
    assert_eq!(info.video_codec, codec::Id::H264);
    assert!(info.has_audio);
    assert_eq!((info.width, info.height), (160, 120));
    assert!((info.duration - expected).abs() < 0.15, "duration {}", info.duration);
    assert_eq!(info.center_luma.len(), 75);

    // each clip's gray level shows up in upload order
    for (index, spec) in specs.iter().enumerate() {
        let middle = info.center_luma[index * 25 + 12];
        assert!(close_to(middle, spec.luma), "clip {index}: {middle} vs {}", spec.luma);
    }

    assert_eq!(
        updates.last(),
        Some(&MergeProgress {
            clip: 3,
            clips: 3,
            percent: 100
        })
    );
    assert!(updates.windows(2).all(|w| w[0].percent <= w[1].percent));
}

#[test]
fn test_mixed_sizes_are_centered_on_the_largest_canvas() {
    if !encoders_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut small = ClipSpec::new(96, 64, 220);
    small.audio = false;
    let specs = [ClipSpec::new(176, 144, 70), small];
    let inputs = write_clips(dir.path(), &specs);
    let output = dir.path().join("merged_video.mp4");

    let summary =
        merge_clips("sizes", &inputs, &output, &CancellationToken::new(), |_| {}).unwrap();
    assert_eq!((summary.width, summary.height), (176, 144));

    let info = inspect_output(&output).unwrap();
    assert_eq!((info.width, info.height), (176, 144));
    // the silent clip still gets an audio track segment
    assert!(info.has_audio);
    assert!(close_to(info.center_luma[10], 70));
    assert!(close_to(info.center_luma[35], 220));
}

#[test]
fn test_different_frame_rates_share_one_timeline() {
    if !encoders_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut slow = ClipSpec::new(128, 96, 90);
    slow.fps = 10;
    slow.frames = 10;
    slow.audio = false;
    let mut fast = ClipSpec::new(128, 96, 160);
    fast.fps = 30;
    fast.frames = 30;
    fast.audio = false;
    let inputs = write_clips(dir.path(), &[slow, fast]);
    let output = dir.path().join("merged_video.mp4");

    let summary =
        merge_clips("rates", &inputs, &output, &CancellationToken::new(), |_| {}).unwrap();
    assert_eq!(summary.frame_rate, 30.0);
    assert_eq!(summary.frames, 60);
    assert!(!summary.has_audio);

    let info = inspect_output(&output).unwrap();
    assert!(!info.has_audio);
    assert!((info.duration - 2.0).abs() < 0.15, "duration {}", info.duration);
}

#[test]
fn test_cancelled_merge_leaves_no_output() {
    if !encoders_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let inputs = write_clips(
        dir.path(),
        &[ClipSpec::new(128, 96, 30), ClipSpec::new(128, 96, 90)],
    );
    let output = dir.path().join("merged_video.mp4");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = merge_clips("cancel", &inputs, &output, &cancel, |_| {}).unwrap_err();
    assert!(matches!(error, MergeError::Cancelled), "{error:?}");
    assert!(!output.exists());
}

#[test]
fn test_corrupt_clip_fails_with_media_error() {
    if !encoders_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut inputs = write_clips(dir.path(), &[ClipSpec::new(128, 96, 30)]);
    let corrupt = dir.path().join("01-corrupt.mkv");
    std::fs::write(&corrupt, b"\x1a\x45\xdf\xa3 truncated matroska header").unwrap();
    inputs.push(corrupt);
    let output = dir.path().join("merged_video.mp4");

    let error = merge_clips("corrupt", &inputs, &output, &CancellationToken::new(), |_| {})
        .unwrap_err();
    match error {
        MergeError::Media(message) => assert!(message.contains("Clip 2"), "{message}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!output.exists());
}

#[test]
fn test_truncated_clip_fails_instead_of_shortening_the_output() {
    if !encoders_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let intact = dir.path().join("00-intact.mp4");
    write_clip(&intact, &ClipSpec::new(128, 96, 30)).unwrap();

    // four seconds of Matroska, cut after roughly the first third
    let mut long = ClipSpec::new(128, 96, 90);
    long.frames = 100;
    let complete = dir.path().join("complete.mkv");
    write_clip(&complete, &long).unwrap();
    let bytes = std::fs::read(&complete).unwrap();
    let truncated = dir.path().join("01-truncated.mkv");
    std::fs::write(&truncated, &bytes[..bytes.len() * 35 / 100]).unwrap();
    let output = dir.path().join("merged_video.mp4");

    let error = merge_clips(
        "truncated",
        &[intact, truncated],
        &output,
        &CancellationToken::new(),
        |_| {},
    )
    .unwrap_err();
    match error {
        MergeError::Media(message) => {
            assert!(message.contains("Clip 2"), "{message}");
            assert!(message.contains("truncated or damaged"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!output.exists());
}

#[tokio::test]
async fn test_running_job_is_cancelled_and_cleaned_up() {
    if !encoders_available() {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let manager = JobManager::new(root.path(), 1, Duration::from_secs(60));

    let mut spec = ClipSpec::new(320, 240, 80);
    spec.frames = 250;
    let clip = Bytes::from(clip_bytes(&spec));
    let files = vec![
        UploadedFile::new("first.mp4", clip.clone()).unwrap(),
        UploadedFile::new("second.mp4", clip).unwrap(),
    ];
    let id = manager.submit(files).await.unwrap();
    let job_dir = root.path().join(id.to_string());
    let mut rx = manager.subscribe(&id).await.unwrap();

    let status = rx
        .wait_for(|status| matches!(status, JobStatus::Merging { .. }) || status.is_terminal())
        .await
        .map(|status| status.clone())
        .unwrap();
    assert!(matches!(status, JobStatus::Merging { .. }), "{status:?}");
    assert!(job_dir.exists());

    assert!(manager.cancel(&id).await);
    let status = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(JobStatus::is_terminal))
        .await
        .expect("cancelled job did not stop in time")
        .map(|status| status.clone())
        .unwrap();

    assert_eq!(status, JobStatus::Cancelled);
    assert!(!job_dir.exists());
    assert!(manager.status(&id).await.is_none());
}
