use crate::media::canvas::chroma_len;
use anyhow::bail;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame;
use ffmpeg_next::frame::side_data::Type as SideDataType;
use tracing::warn;

/// Fixed-point scale of the display matrix's 2x2 part (16.16).
const MATRIX_ONE: f64 = 65_536.0;

/// Clockwise turn that shows a clip upright, as phones record it in the
/// `rotate` tag or the display matrix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Rotation {
    #[default]
    None,
    Clockwise90,
    Half,
    Clockwise270,
}

impl Rotation {
    /// Nearest quarter turn to `degrees` (clockwise).
    pub fn from_degrees(degrees: f64) -> Self {
        if !degrees.is_finite() {
            return Rotation::None;
        }
        let normalized = degrees.rem_euclid(360.0);
        let quarter = (normalized / 90.0).round() as i64 % 4;
        if (normalized - 90.0 * (normalized / 90.0).round()).abs() > 2.0 {
            warn!(degrees, "Odd rotation angle, using the nearest quarter turn");
        }
        match quarter {
            1 => Rotation::Clockwise90,
            2 => Rotation::Half,
            3 => Rotation::Clockwise270,
            _ => Rotation::None,
        }
    }

    /// Value of a stream's `rotate` metadata tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        tag.trim().parse::<f64>().ok().map(Self::from_degrees)
    }

    /// Reads a raw `AV_FRAME_DATA_DISPLAYMATRIX` payload: nine native-endian i32.
    pub fn from_display_matrix(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 36 {
            return None;
        }
        let mut matrix = [0i32; 9];
        for (value, chunk) in matrix.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        let counterclockwise = display_rotation(&matrix)?;
        Some(Self::from_degrees(-counterclockwise.round()))
    }

    /// Rotation carried by a decoded frame, if any.
    pub fn of_frame(decoded: &frame::Video) -> Option<Self> {
        decoded
            .side_data(SideDataType::DisplayMatrix)
            .and_then(|side_data| Self::from_display_matrix(side_data.data()))
    }

    pub fn swaps_axes(&self) -> bool {
        matches!(self, Rotation::Clockwise90 | Rotation::Clockwise270)
    }

    /// Upright size of a `width` x `height` coded picture.
    pub fn display_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    /// Turns a YUV420P frame upright.
    pub fn apply(&self, source: frame::Video) -> anyhow::Result<frame::Video> {
        if *self == Rotation::None {
            return Ok(source);
        }
        if source.format() != Pixel::YUV420P {
            bail!("Rotation: expected YUV420P frame, got {:?}", source.format());
        }

        let (width, height) = self.display_size(source.width(), source.height());
        let mut rotated = frame::Video::new(Pixel::YUV420P, width, height);
        for plane in 0..3 {
            let shift = if plane == 0 { 0 } else { 1 };
            let size = (
                chroma_len(source.width(), shift),
                chroma_len(source.height(), shift),
            );
            let src_stride = source.stride(plane);
            let dst_stride = rotated.stride(plane);
            rotate_plane(
                source.data(plane),
                src_stride,
                size,
                rotated.data_mut(plane),
                dst_stride,
                *self,
            );
        }
        rotated.set_pts(source.pts());
        Ok(rotated)
    }
}

/// Counterclockwise angle in degrees of a display matrix, `None` when degenerate.
fn display_rotation(matrix: &[i32; 9]) -> Option<f64> {
    let fixed = |value: i32| value as f64 / MATRIX_ONE;
    let scale_x = fixed(matrix[0]).hypot(fixed(matrix[3]));
    let scale_y = fixed(matrix[1]).hypot(fixed(matrix[4]));
    if scale_x == 0.0 || scale_y == 0.0 {
        return None;
    }

    let angle = (fixed(matrix[1]) / scale_y)
        .atan2(fixed(matrix[0]) / scale_x)
        .to_degrees();
    Some(-angle)
}

/// Copies a `size.0` x `size.1` plane from `src` into `dst` turned by `rotation`.
pub fn rotate_plane(
    src: &[u8],
    src_stride: usize,
    (width, height): (usize, usize),
    dst: &mut [u8],
    dst_stride: usize,
    rotation: Rotation,
) {
    for y in 0..height {
        for x in 0..width {
            let (dx, dy) = match rotation {
                Rotation::None => (x, y),
                Rotation::Clockwise90 => (height - 1 - y, x),
                Rotation::Half => (width - 1 - x, height - 1 - y),
                Rotation::Clockwise270 => (y, width - 1 - x),
            };
            let (Some(&sample), Some(out)) = (
                src.get(y * src_stride + x),
                dst.get_mut(dy * dst_stride + dx),
            ) else {
                continue;
            };
            *out = sample;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_bytes(matrix: [i32; 9]) -> Vec<u8> {
        matrix.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn tag_values() {
        assert_eq!(Rotation::from_tag("90"), Some(Rotation::Clockwise90));
        assert_eq!(Rotation::from_tag("180"), Some(Rotation::Half));
        assert_eq!(Rotation::from_tag("-90"), Some(Rotation::Clockwise270));
        assert_eq!(Rotation::from_tag("0"), Some(Rotation::None));
        assert_eq!(Rotation::from_tag("sideways"), None);
    }

    #[test]
    fn portrait_phone_matrix_turns_clockwise() {
        // [0 1 0; -1 0 0; 0 0 1] as written by phones recording in portrait
        let bytes = matrix_bytes([0, 65_536, 0, -65_536, 0, 0, 0, 0, 1 << 30]);
        assert_eq!(
            Rotation::from_display_matrix(&bytes),
            Some(Rotation::Clockwise90)
        );

        let bytes = matrix_bytes([0, -65_536, 0, 65_536, 0, 0, 0, 0, 1 << 30]);
        assert_eq!(
            Rotation::from_display_matrix(&bytes),
            Some(Rotation::Clockwise270)
        );

        let identity = matrix_bytes([65_536, 0, 0, 0, 65_536, 0, 0, 0, 1 << 30]);
        assert_eq!(Rotation::from_display_matrix(&identity), Some(Rotation::None));

        let upside_down = matrix_bytes([-65_536, 0, 0, 0, -65_536, 0, 0, 0, 1 << 30]);
        assert_eq!(Rotation::from_display_matrix(&upside_down), Some(Rotation::Half));
    }

    #[test]
    fn degenerate_or_short_matrix_is_ignored() {
        assert_eq!(Rotation::from_display_matrix(&[0u8; 36]), None);
        assert_eq!(Rotation::from_display_matrix(&[0u8; 12]), None);
    }

    #[test]
    fn quarter_turns_swap_the_display_size() {
        assert_eq!(Rotation::Clockwise90.display_size(1920, 1080), (1080, 1920));
        assert_eq!(Rotation::Clockwise270.display_size(1920, 1080), (1080, 1920));
        assert_eq!(Rotation::Half.display_size(1920, 1080), (1920, 1080));
    }

    #[test]
    fn plane_turns_clockwise() {
        // 3x2, stride 4:
        // 1 2 3
        // 4 5 6
        let src = [1, 2, 3, 0, 4, 5, 6, 0];
        let mut dst = [0u8; 6];
        rotate_plane(&src, 4, (3, 2), &mut dst, 2, Rotation::Clockwise90);
        // 4 1
        // 5 2
        // 6 3
        assert_eq!(dst, [4, 1, 5, 2, 6, 3]);

        rotate_plane(&src, 4, (3, 2), &mut dst, 2, Rotation::Clockwise270);
        // 3 6
        // 2 5
        // 1 4
        assert_eq!(dst, [3, 6, 2, 5, 1, 4]);

        rotate_plane(&src, 4, (3, 2), &mut dst, 3, Rotation::Half);
        assert_eq!(dst, [6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn frame_turned_a_quarter_is_portrait() {
        let (width, height) = (8u32, 4u32);
        let mut landscape = frame::Video::new(Pixel::YUV420P, width, height);
        landscape.data_mut(0).fill(0);
        landscape.data_mut(1).fill(128);
        landscape.data_mut(2).fill(128);
        // mark the top-left luma sample and chroma sample
        landscape.data_mut(0)[0] = 255;
        landscape.data_mut(1)[0] = 10;
        landscape.set_pts(Some(42));

        let portrait = Rotation::Clockwise90.apply(landscape).unwrap();

        assert_eq!((portrait.width(), portrait.height()), (height, width));
        assert_eq!(portrait.pts(), Some(42));
        // top-left ends up top-right after a clockwise quarter turn
        assert_eq!(portrait.data(0)[(height - 1) as usize], 255);
        assert_eq!(portrait.data(0)[0], 0);
        assert_eq!(portrait.data(1)[(height / 2 - 1) as usize], 10);
    }
}
