use ffmpeg_next::Rational;

/// Maps clip presentation times onto the constant output frame rate.
///
/// Output slot `k` of a clip starts at `k / fps` seconds. A decoded frame is
/// shown in every slot that starts before the next frame's time, so faster
/// sources drop frames and slower sources repeat them.
#[derive(Clone, Debug)]
pub struct FrameClock {
    fps: f64,
    emitted: u64,
}

impl FrameClock {
    pub fn new(fps: Rational) -> Self {
        Self {
            fps: f64::from(fps),
            emitted: 0,
        }
    }

    /// Slots emitted for the current clip.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// How many not-yet-emitted slots start before `seconds`; marks them emitted.
    pub fn advance_to(&mut self, seconds: f64) -> u64 {
        let before = slots_before(seconds, self.fps);
        let count = before.saturating_sub(self.emitted);
        self.emitted = self.emitted.max(before);
        count
    }

    /// Slots owed to the last frame when the clip ends at `seconds`. A clip
    /// always occupies at least one slot.
    pub fn finish(&mut self, seconds: f64) -> u64 {
        let count = self.advance_to(seconds);
        if self.emitted == 0 {
            self.emitted = 1;
            return 1;
        }
        count
    }
}

fn slots_before(seconds: f64, fps: f64) -> u64 {
    if !seconds.is_finite() || seconds <= 0.0 {
        return 0;
    }
    // tolerate float noise on exact slot boundaries
    (seconds * fps - 1e-6).ceil().max(0.0) as u64
}

/// Number of audio samples that cover `slots` video frames at `fps`.
pub fn samples_for_slots(slots: u64, fps: Rational, sample_rate: u32) -> i64 {
    let num = fps.numerator() as i128;
    let den = fps.denominator() as i128;
    if num <= 0 || den <= 0 {
        return 0;
    }
    ((slots as i128 * sample_rate as i128 * den) / num) as i64
}
