//! Fractional stereo delay line
//!
//! A circular buffer per audio channel with 4-point Catmull-Rom read-out and
//! a feedback path. The delay time may change every sample; reads land at an
//! exact fractional position so short modulated delays (flanger/chorus
//! territory) don't zipper.
//!
//! The feedback path taps the *integer*-offset sample (the second of the four
//! interpolation taps), not the interpolated output. Echo tone at fast
//! modulation depends on this, so it must not be "corrected".

use crate::types::StereoSample;

/// Shortest delay time the line accepts (seconds)
pub const MIN_DELAY_SECONDS: f32 = 0.0001;
/// Default buffer length (seconds)
pub const DEFAULT_MAX_DELAY_SECONDS: f32 = 2.0;
/// Feedback ceiling of the line itself, independent of any control ceiling
pub const MAX_FEEDBACK: f32 = 0.95;
/// Samples reserved past the longest read for the 4-point kernel
const INTERPOLATION_MARGIN: usize = 3;

/// Cubic Catmull-Rom interpolation (4-point)
///
/// Returns the value between `s1` (t = 0) and `s2` (t = 1).
#[inline]
fn cubic_interpolate(
    s0: StereoSample,
    s1: StereoSample,
    s2: StereoSample,
    s3: StereoSample,
    t: f32,
) -> StereoSample {
    let t2 = t * t;
    let t3 = t2 * t;

    // Catmull-Rom basis functions (tension = 0.5)
    let c0 = -0.5 * t3 + t2 - 0.5 * t;
    let c1 = 1.5 * t3 - 2.5 * t2 + 1.0;
    let c2 = -1.5 * t3 + 2.0 * t2 + 0.5 * t;
    let c3 = 0.5 * t3 - 0.5 * t2;

    StereoSample {
        left: s0.left * c0 + s1.left * c1 + s2.left * c2 + s3.left * c3,
        right: s0.right * c0 + s1.right * c1 + s2.right * c2 + s3.right * c3,
    }
}

/// Stereo fractional delay line with feedback
pub struct DelayLine {
    /// Left channel buffer
    buffer_l: Vec<f32>,
    /// Right channel buffer
    buffer_r: Vec<f32>,
    /// Write position
    write_pos: usize,
    /// Sample rate the buffer was sized for
    sample_rate: f32,
    /// Longest delay the buffer was sized for
    max_delay_seconds: f32,
    /// Feedback coefficient from the last control update
    feedback: f32,
}

impl DelayLine {
    /// Create a delay line holding `max_delay_seconds` of audio per channel
    pub fn new(sample_rate: u32, max_delay_seconds: f32) -> Self {
        let len = ((sample_rate as f32 * max_delay_seconds).ceil() as usize)
            .max(INTERPOLATION_MARGIN + 1);
        Self {
            buffer_l: vec![0.0; len],
            buffer_r: vec![0.0; len],
            write_pos: 0,
            sample_rate: sample_rate as f32,
            max_delay_seconds,
            feedback: 0.0,
        }
    }

    /// Buffer length in samples (per channel)
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer_l.len()
    }

    /// Whether the buffer holds no samples (never true for a constructed line)
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer_l.is_empty()
    }

    /// Feedback coefficient used by the last processed sample
    pub fn feedback(&self) -> f32 {
        self.feedback
    }

    /// Set the feedback coefficient for block processing (clamped to 0..0.95)
    pub fn set_feedback(&mut self, feedback: f32) {
        self.feedback = clamp_feedback(feedback);
    }

    /// Convert a delay time to a fractional sample count within the usable range
    #[inline]
    pub fn delay_samples(&self, delay_seconds: f32) -> f64 {
        let seconds = if delay_seconds.is_finite() {
            delay_seconds.clamp(MIN_DELAY_SECONDS, self.max_delay_seconds)
        } else {
            MIN_DELAY_SECONDS
        };
        let max = (self.len() - INTERPOLATION_MARGIN) as f64;
        (seconds as f64 * self.sample_rate as f64).clamp(0.0, max)
    }

    /// Read the sample `offset` positions behind the write cursor
    #[inline]
    fn tap(&self, offset: i64) -> StereoSample {
        let len = self.len() as i64;
        let idx = (self.write_pos as i64 - offset).rem_euclid(len) as usize;
        StereoSample::new(self.buffer_l[idx], self.buffer_r[idx])
    }

    /// Process one stereo sample and return the wet (delayed) signal
    ///
    /// Delay time and feedback are clamped, never rejected.
    #[inline]
    pub fn process_sample(
        &mut self,
        input: StereoSample,
        delay_seconds: f32,
        feedback: f32,
    ) -> StereoSample {
        self.feedback = clamp_feedback(feedback);

        let d = self.delay_samples(delay_seconds);
        let n = d.floor();
        let frac = (d - n) as f32;
        let n = n as i64;

        let p0 = self.tap(n - 1);
        let p1 = self.tap(n);
        let p2 = self.tap(n + 1);
        let p3 = self.tap(n + 2);
        let wet = cubic_interpolate(p0, p1, p2, p3, frac);

        // Feedback taps the non-interpolated P1 sample
        self.buffer_l[self.write_pos] = input.left + self.feedback * p1.left;
        self.buffer_r[self.write_pos] = input.right + self.feedback * p1.right;

        self.write_pos += 1;
        if self.write_pos >= self.len() {
            self.write_pos = 0;
        }

        wet
    }

    /// Process a block in place with a constant delay time (k-rate)
    ///
    /// Uses the feedback set by [`DelayLine::set_feedback`]. Replaces the
    /// block contents with the wet signal.
    pub fn process_block(&mut self, block: &mut [StereoSample], delay_seconds: f32) {
        let feedback = self.feedback;
        for sample in block.iter_mut() {
            *sample = self.process_sample(*sample, delay_seconds, feedback);
        }
    }

    /// Process a block in place with per-sample delay times (a-rate)
    ///
    /// `delay_at(i)` and `feedback_at(i)` are evaluated for every sample index
    /// of the block.
    #[inline]
    pub fn process_block_with(
        &mut self,
        block: &mut [StereoSample],
        mut delay_at: impl FnMut(usize) -> f32,
        mut feedback_at: impl FnMut(usize) -> f32,
    ) {
        for (i, sample) in block.iter_mut().enumerate() {
            *sample = self.process_sample(*sample, delay_at(i), feedback_at(i));
        }
    }

    /// Clear the buffers (silence) and rewind the write cursor
    pub fn reset(&mut self) {
        self.buffer_l.fill(0.0);
        self.buffer_r.fill(0.0);
        self.write_pos = 0;
        self.feedback = 0.0;
    }
}

#[inline]
fn clamp_feedback(feedback: f32) -> f32 {
    if feedback.is_finite() {
        feedback.clamp(0.0, MAX_FEEDBACK)
    } else {
        0.0
    }
}
