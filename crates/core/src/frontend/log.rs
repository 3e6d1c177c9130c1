use tracing::{info, warn};

use crate::session::Stream;

/// Position within an animation as last reported to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnimationStatus {
    pub frame_id: i64,
    pub running_frame: i64,
    pub total_frames: i64,
    pub filename: String,
}

/// What a render session has told the user so far.
///
/// Every failure lands here twice: as a status line and as an entry in the
/// error queue.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    status: Vec<String>,
    errors: Vec<String>,
    streams: Vec<(Stream, String)>,
    failed: bool,
    succeeded: bool,
    rendering_animation: bool,
    output_filename: String,
    animation: Option<AnimationStatus>,
    pixels_rendered: u64,
    total_pixels: u64,
    percent_complete: u32,
    frames_completed: u32,
}

impl SessionLog {
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn append_status(&mut self, text: impl Into<String>) {
        let text = text.into();
        info!(status = %text);
        self.status.push(text);
    }

    pub fn append_error(&mut self, text: impl Into<String>) {
        let text = text.into();
        warn!(error = %text);
        self.errors.push(text);
    }

    pub fn append_error_and_status(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.append_error(text.clone());
        self.status.push(text);
    }

    pub fn append_stream_message(&mut self, stream: Stream, text: impl Into<String>) {
        self.streams.push((stream, text.into()));
    }

    pub fn clear_status(&mut self) {
        self.status.clear();
    }

    pub fn status_messages(&self) -> &[String] {
        &self.status
    }

    pub fn last_status(&self) -> Option<&str> {
        self.status.last().map(String::as_str)
    }

    pub fn error_messages(&self) -> &[String] {
        &self.errors
    }

    pub fn stream_messages(&self) -> &[(Stream, String)] {
        &self.streams
    }

    pub fn set_failed(&mut self) {
        self.failed = true;
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn set_succeeded(&mut self, succeeded: bool) {
        self.succeeded = succeeded;
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn set_rendering_animation(&mut self) {
        self.rendering_animation = true;
    }

    pub fn rendering_animation(&self) -> bool {
        self.rendering_animation
    }

    pub fn advise_output_filename(&mut self, filename: impl Into<String>) {
        self.output_filename = filename.into();
    }

    /// Last output file name reported; empty before the first one is known.
    pub fn output_filename(&self) -> &str {
        &self.output_filename
    }

    pub fn append_animation_status(&mut self, frame_id: i64, running_frame: i64, total_frames: i64, filename: &str) {
        info!(frame = frame_id, running_frame, total_frames, filename, "starting frame");
        self.animation = Some(AnimationStatus {
            frame_id,
            running_frame,
            total_frames,
            filename: filename.to_owned(),
        });
    }

    pub fn animation_status(&self) -> Option<&AnimationStatus> {
        self.animation.as_ref()
    }

    pub fn set_pixels_rendered(&mut self, rendered: u64, total: u64) {
        self.pixels_rendered = rendered;
        self.total_pixels = total;
        if total > 0 {
            self.percent_complete = (rendered.min(total) * 100 / total) as u32;
        }
    }

    pub fn set_percent_complete(&mut self, percent: u32) {
        self.percent_complete = percent.min(100);
    }

    pub fn pixels_rendered(&self) -> u64 {
        self.pixels_rendered
    }

    pub fn total_pixels(&self) -> u64 {
        self.total_pixels
    }

    pub fn percent_complete(&self) -> u32 {
        self.percent_complete
    }

    pub fn advise_frame_completed(&mut self) {
        self.frames_completed += 1;
    }

    pub fn frames_completed(&self) -> u32 {
        self.frames_completed
    }
}
