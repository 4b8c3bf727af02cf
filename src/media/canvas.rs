use anyhow::{anyhow, bail};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame;

/// Black in limited-range YUV.
const BLACK_LUMA: u8 = 16;
const BLACK_CHROMA: u8 = 128;

/// Output geometry of the composed timeline: the largest clip sizes,
/// rounded up to even values for 4:2:0 encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

impl Canvas {
    pub fn covering<I>(sizes: I) -> Option<Self>
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let (width, height) = sizes
            .into_iter()
            .fold((0, 0), |(w, h), (cw, ch)| (w.max(cw), h.max(ch)));
        if width == 0 || height == 0 {
            return None;
        }

        Some(Self {
            width: round_up_even(width),
            height: round_up_even(height),
        })
    }

    /// Top-left corner that centers a `width` x `height` clip. Offsets are
    /// even so chroma planes stay aligned.
    pub fn offset_for(&self, width: u32, height: u32) -> (u32, u32) {
        let x = self.width.saturating_sub(width) / 2;
        let y = self.height.saturating_sub(height) / 2;
        (x & !1, y & !1)
    }

    pub fn blank_frame(&self) -> frame::Video {
        let mut canvas = frame::Video::new(Pixel::YUV420P, self.width, self.height);
        canvas.data_mut(0).fill(BLACK_LUMA);
        canvas.data_mut(1).fill(BLACK_CHROMA);
        canvas.data_mut(2).fill(BLACK_CHROMA);
        canvas
    }

    /// Centers a YUV420P `clip` frame on a fresh black canvas.
    pub fn compose(&self, clip: &frame::Video) -> anyhow::Result<frame::Video> {
        if clip.format() != Pixel::YUV420P {
            bail!("Canvas: expected YUV420P clip frame, got {:?}", clip.format());
        }
        if clip.width() > self.width || clip.height() > self.height {
            return Err(anyhow!(
                "Canvas: clip frame {}x{} does not fit on {}x{}",
                clip.width(),
                clip.height(),
                self.width,
                self.height
            ));
        }

        let mut canvas = self.blank_frame();
        let (x, y) = self.offset_for(clip.width(), clip.height());

        for plane in 0..3 {
            let shift = if plane == 0 { 0 } else { 1 };
            let rect = PlaneRect {
                x: (x >> shift) as usize,
                y: (y >> shift) as usize,
                width: chroma_len(clip.width(), shift),
                height: chroma_len(clip.height(), shift),
            };
            let src_stride = clip.stride(plane);
            let dst_stride = canvas.stride(plane);
            blit_plane(
                clip.data(plane),
                src_stride,
                canvas.data_mut(plane),
                dst_stride,
                rect,
            );
        }

        Ok(canvas)
    }
}

fn round_up_even(value: u32) -> u32 {
    value + (value & 1)
}

pub(crate) fn chroma_len(len: u32, shift: u32) -> usize {
    ((len + (1 << shift) - 1) >> shift) as usize
}

/// Destination rectangle of one plane copy, in samples.
#[derive(Clone, Copy, Debug)]
pub struct PlaneRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// Copies `rect.height` rows of `rect.width` samples from `src` into `dst`
/// at (`rect.x`, `rect.y`).
pub fn blit_plane(src: &[u8], src_stride: usize, dst: &mut [u8], dst_stride: usize, rect: PlaneRect) {
    for row in 0..rect.height {
        let src_start = row * src_stride;
        let dst_start = (rect.y + row) * dst_stride + rect.x;
        let Some(src_row) = src.get(src_start..src_start + rect.width) else {
            break;
        };
        let Some(dst_row) = dst.get_mut(dst_start..dst_start + rect.width) else {
            break;
        };
        dst_row.copy_from_slice(src_row);
    }
}
