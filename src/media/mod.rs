//! FFmpeg side of a merge: probing the staged clips, composing them onto a
//! common canvas and encoding one H.264/AAC MP4.

pub mod audio;
pub mod canvas;
pub mod clock;
pub mod merge;
pub mod probe;
pub mod rotation;
pub mod video;

pub use canvas::Canvas;
pub use merge::{MergeProgress, MergeSummary, merge_clips};
pub use probe::{ClipInfo, probe};
pub use rotation::Rotation;
pub use video::find_h264_encoder;
