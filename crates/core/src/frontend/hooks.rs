use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::options::{keys, Options};
use crate::session::Stream;

/// Callbacks through which the front end reports backend output.
///
/// Each call receives decoded attributes or text plus an `echo` flag telling
/// whether the scene's settings want it shown on the console.
pub trait MessageHooks: Send {
    fn stream_output(&mut self, stream: Stream, text: &str, echo: bool);

    fn parser_options(&mut self, attrs: &Options, echo: bool) {
        if echo {
            debug!(
                input = attrs.try_get_str(keys::INPUT_FILE, ""),
                options = attrs.len(),
                "parser options"
            );
        }
    }

    fn render_options(&mut self, attrs: &Options, echo: bool) {
        if echo {
            debug!(
                width = attrs.try_get_int(keys::WIDTH, 0),
                height = attrs.try_get_int(keys::HEIGHT, 0),
                output = attrs.try_get_str(keys::OUTPUT_FILE, ""),
                "render options"
            );
        }
    }

    fn progress(&mut self, _attrs: &Options, _echo: bool) {}

    /// Asked for a replacement path when an output file cannot be written.
    /// Nothing calls this yet; returning `None` keeps the failure.
    fn request_new_output_path(&mut self, _failed: &str) -> Option<PathBuf> {
        None
    }
}

/// Sends echoed stream text to `tracing` at a level matching the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHooks;

impl MessageHooks for LogHooks {
    fn stream_output(&mut self, stream: Stream, text: &str, echo: bool) {
        if !echo {
            return;
        }
        match stream {
            Stream::Fatal => error!(target: "tracefront::stream", "{text}"),
            Stream::Warning => warn!(target: "tracefront::stream", "{text}"),
            Stream::Debug => debug!(target: "tracefront::stream", "{text}"),
            Stream::Banner | Stream::Status | Stream::Render | Stream::Statistics | Stream::All => {
                info!(target: "tracefront::stream", ?stream, "{text}")
            }
        }
    }

    fn progress(&mut self, attrs: &Options, echo: bool) {
        if !echo {
            return;
        }
        let total = attrs.try_get_int(keys::PIXELS_TOTAL, 0);
        if total > 0 {
            let done = attrs.try_get_int(keys::PIXELS_COMPLETED, 0);
            debug!(done, total, "render progress");
        } else {
            debug!(text = attrs.try_get_str(keys::ENGLISH_TEXT, ""), "parser progress");
        }
    }
}
