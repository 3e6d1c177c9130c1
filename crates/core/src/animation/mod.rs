//! Frame sequencing for animation renders.

use tracing::debug;

use crate::options::{declare, keys, Options};

/// Forward-only cursor over the frames of an animation.
///
/// The cursor starts on the first frame to render; [`more_frames`] says
/// whether [`compute_next_frame`] may advance it once more.
///
/// [`more_frames`]: AnimationSequencer::more_frames
/// [`compute_next_frame`]: AnimationSequencer::compute_next_frame
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationSequencer {
    initial_frame: i64,
    final_frame: i64,
    start_frame: i64,
    end_frame: i64,
    frame_step: i64,
    initial_clock: f64,
    final_clock: f64,
    clock_delta: f64,
    nominal_frame: i64,
    running_frame: i64,
    total_frames: i64,
    digits: usize,
}

impl AnimationSequencer {
    pub fn new(opts: &Options) -> Self {
        let initial_frame = opts.try_get_int(keys::INITIAL_FRAME, 1);
        let final_frame = opts.try_get_int(keys::FINAL_FRAME, initial_frame).max(initial_frame);
        let initial_clock = opts.try_get_float(keys::INITIAL_CLOCK, 0.0);
        let final_clock = opts.try_get_float(keys::FINAL_CLOCK, 1.0);
        let frame_step = opts.try_get_int(keys::FRAME_STEP, 1).max(1);

        let start_frame = opts
            .try_get_int(keys::SUBSET_START_FRAME, initial_frame)
            .clamp(initial_frame, final_frame);
        let end_frame = opts
            .try_get_int(keys::SUBSET_END_FRAME, final_frame)
            .clamp(start_frame, final_frame);

        let span = final_frame - initial_frame;
        let clock_delta = if opts.try_get_bool(keys::CYCLIC_ANIMATION, false) {
            (final_clock - initial_clock) / (span + 1) as f64
        } else if span > 0 {
            (final_clock - initial_clock) / span as f64
        } else {
            0.0
        };

        let sequencer = Self {
            initial_frame,
            final_frame,
            start_frame,
            end_frame,
            frame_step,
            initial_clock,
            final_clock,
            clock_delta,
            nominal_frame: start_frame,
            running_frame: 1,
            total_frames: (end_frame - start_frame) / frame_step + 1,
            digits: final_frame.max(0).to_string().len(),
        };
        debug!(
            start = sequencer.start_frame,
            end = sequencer.end_frame,
            step = sequencer.frame_step,
            total = sequencer.total_frames,
            "animation sequence prepared"
        );
        sequencer
    }

    /// True when the options describe more than one frame.
    pub fn is_animation(opts: &Options) -> bool {
        let initial = opts.try_get_int(keys::INITIAL_FRAME, 1);
        opts.try_get_int(keys::FINAL_FRAME, initial) > initial
    }

    pub fn more_frames(&self) -> bool {
        self.nominal_frame + self.frame_step <= self.end_frame
    }

    /// Advances to the next frame. Must not be called once [`Self::more_frames`]
    /// is false.
    pub fn compute_next_frame(&mut self) {
        debug_assert!(self.more_frames(), "advanced past the last animation frame");
        self.nominal_frame += self.frame_step;
        self.running_frame += 1;
    }

    pub fn nominal_frame_number(&self) -> i64 {
        self.nominal_frame
    }

    /// One-based position of the current frame among the frames rendered.
    pub fn running_frame_number(&self) -> i64 {
        self.running_frame
    }

    pub fn total_frames_to_render(&self) -> i64 {
        self.total_frames
    }

    pub fn clock_value(&self) -> f64 {
        self.initial_clock + self.clock_delta * (self.nominal_frame - self.initial_frame) as f64
    }

    /// Width used when the frame number is embedded in output names.
    pub fn frame_number_digits(&self) -> usize {
        self.digits
    }

    /// Copies `opts` with the current frame's clock and SDL constants set.
    pub fn frame_render_options(&self, opts: &Options) -> Options {
        let mut out = opts.clone();
        let clock = self.clock_value();
        out.set(keys::CLOCK, clock);
        declare(&mut out, "frame_number", self.nominal_frame);
        declare(&mut out, "clock", clock);
        declare(&mut out, "clock_delta", self.clock_delta);
        declare(&mut out, "initial_clock", self.initial_clock);
        declare(&mut out, "final_clock", self.final_clock);
        declare(&mut out, "initial_frame", self.initial_frame);
        declare(&mut out, "final_frame", self.final_frame);
        out
    }
}
