//! Top-level render session state machine.
//!
//! [`Frontend::process`] advances the session by one step and returns the new
//! [`State`]. The caller drives it from its own loop and sleeps between calls;
//! nothing inside a step waits on the backend or on a shellout process.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::animation::AnimationSequencer;
use crate::backend::{Backend, SceneId, ViewId};
use crate::config::FrontendConfig;
use crate::options::{declare, keys, Options};
use crate::raster::{output_filename, output_is_stderr, output_is_stdout, write_image, DisplayFactory, ImageBuffer};
use crate::session::{Control, Notice, SceneState, SessionManager, Stream, ViewState};
use crate::shellout::{CommandRunner, ShelloutCoordinator, ShelloutEvent};
use crate::{FrontendError, Result};

mod hooks;
mod log;

pub use hooks::{LogHooks, MessageHooks};
pub use log::{AnimationStatus, SessionLog};

const ALREADY_RENDERED: &str = "File already rendered and continue requested; skipping.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Ready,
    Starting,
    PreSceneShellout,
    PreFrameShellout,
    Parsing,
    PausedParsing,
    Rendering,
    PausedRendering,
    PostFrameShellout,
    PostSceneShellout,
    PostShelloutPause,
    Stopping,
    Stopped,
    Failed,
    Done,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Starting => "Starting",
            Self::PreSceneShellout => "Running Pre-Scene Shellout",
            Self::PreFrameShellout => "Running Pre-Frame Shellout",
            Self::Parsing => "Parsing",
            Self::PausedParsing => "Paused (Parsing)",
            Self::Rendering => "Rendering",
            Self::PausedRendering => "Paused (Rendering)",
            Self::PostFrameShellout => "Running Post-Frame Shellout",
            Self::PostSceneShellout => "Running Post-Scene Shellout",
            Self::PostShelloutPause => "Paused After Running Shellout",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
            Self::Done => "Done",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Drives one render session at a time through parse, render and shellouts.
pub struct Frontend {
    session: SessionManager,
    shellouts: ShelloutCoordinator,
    hooks: Box<dyn MessageHooks>,
    display_factory: Option<DisplayFactory>,
    config: FrontendConfig,
    state: State,
    post_pause_state: State,
    pause_requested: bool,
    paused_after_frame: bool,
    /// Options for the frame being rendered.
    options: Options,
    /// Options as given to [`Frontend::start`], plus the declares added there.
    base_options: Options,
    animation: Option<AnimationSequencer>,
    scene: Option<SceneId>,
    view: Option<ViewId>,
    log: SessionLog,
}

impl std::fmt::Debug for Frontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frontend")
            .field("state", &self.state)
            .field("post_pause_state", &self.post_pause_state)
            .field("pause_requested", &self.pause_requested)
            .field("paused_after_frame", &self.paused_after_frame)
            .field("scene", &self.scene)
            .field("view", &self.view)
            .field("shellouts", &self.shellouts)
            .finish_non_exhaustive()
    }
}

impl Frontend {
    pub fn new(backend: Box<dyn Backend>, runner: Box<dyn CommandRunner>, config: FrontendConfig) -> Self {
        let mut shellouts = ShelloutCoordinator::new(runner);
        shellouts.set_cancel_message(&config.shellouts.cancel_message);
        shellouts.set_skip_message(&config.shellouts.skip_message);
        Self {
            session: SessionManager::new(backend, Box::new(config.io.clone())),
            shellouts,
            hooks: Box::new(LogHooks),
            display_factory: None,
            config,
            state: State::Ready,
            post_pause_state: State::Ready,
            pause_requested: false,
            paused_after_frame: false,
            options: Options::new(),
            base_options: Options::new(),
            animation: None,
            scene: None,
            view: None,
            log: SessionLog::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: Box<dyn MessageHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_display_factory(mut self, factory: DisplayFactory) -> Self {
        self.display_factory = Some(factory);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn shellouts(&self) -> &ShelloutCoordinator {
        &self.shellouts
    }

    /// Options of the frame currently being worked on.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Image of the current view, if it keeps one.
    pub fn image(&self) -> Option<&ImageBuffer> {
        self.view.and_then(|vid| self.session.image(vid))
    }

    pub fn is_pausable(&self) -> bool {
        matches!(
            self.state,
            State::Parsing
                | State::Rendering
                | State::PreSceneShellout
                | State::PreFrameShellout
                | State::PostFrameShellout
        )
    }

    pub fn is_paused(&self) -> bool {
        matches!(
            self.state,
            State::PausedParsing | State::PausedRendering | State::PostShelloutPause
        )
    }

    fn output_to_file(&self) -> bool {
        self.base_options.try_get_bool(keys::OUTPUT_TO_FILE, true)
    }

    /// Begins a new session. Only valid in [`State::Ready`].
    ///
    /// A single-frame render gets its output file name now, so a bad name or
    /// a write restriction fails here instead of after the render. An
    /// animation names each frame's file as the frame starts.
    pub fn start(&mut self, mut opts: Options) -> Result<()> {
        if self.state != State::Ready {
            return Err(FrontendError::not_now("start", self.state));
        }
        self.log.clear();
        self.animation = None;
        self.scene = None;
        self.view = None;
        self.pause_requested = false;
        self.paused_after_frame = false;
        self.post_pause_state = State::Ready;

        if !self.config.output_to_file {
            opts.set(keys::OUTPUT_TO_FILE, false);
        }
        let input = Path::new(opts.try_get_str(keys::INPUT_FILE, "object.pov"));
        let scene_name = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let input_name = input
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let width = opts.try_get_int(keys::WIDTH, 160);
        let height = opts.try_get_int(keys::HEIGHT, 120);
        self.shellouts
            .configure(&opts, &scene_name, width.max(0) as u32, height.max(0) as u32);

        declare(&mut opts, "image_width", width as f64);
        declare(&mut opts, "image_height", height as f64);
        declare(&mut opts, "input_file_name", input_name);

        if AnimationSequencer::is_animation(&opts) {
            self.log.set_rendering_animation();
            let animation = AnimationSequencer::new(&opts);
            self.options = animation.frame_render_options(&opts);
            self.animation = Some(animation);
        } else {
            for name in [
                "clock_delta",
                "final_clock",
                "final_frame",
                "frame_number",
                "initial_clock",
                "initial_frame",
            ] {
                declare(&mut opts, name, 0.0);
            }
            self.options = opts.clone();
            if opts.try_get_bool(keys::OUTPUT_TO_FILE, true) {
                let filename = output_filename(&opts, 0, 0)?;
                self.options.set(keys::OUTPUT_FILE, filename.clone());
                let to_std_stream = output_is_stdout(&self.options) || output_is_stderr(&self.options);
                if to_std_stream && !self.config.image_output_to_stdout {
                    return Err(FrontendError::CannotOpenFile(
                        "Image output to STDOUT/STDERR not supported on this platform".into(),
                    ));
                }
                if !to_std_stream && !self.session.policy().allow_write(Path::new(&filename)) {
                    return Err(FrontendError::CannotOpenFile(format!(
                        "IO Restrictions prohibit write access to '{filename}'"
                    )));
                }
                self.shellouts.set_output_file(&filename);
                self.log.advise_output_filename(filename);
            }
        }
        self.base_options = opts;
        self.state = State::Starting;
        info!(
            scene = %scene_name,
            animation = self.animation.is_some(),
            "render session started"
        );
        Ok(())
    }

    /// Advances the session by one step and returns the state it is in now.
    pub fn process(&mut self) -> State {
        if self.state == State::Ready {
            return State::Ready;
        }
        let before = self.state;
        self.pump();

        match self.state {
            State::Ready => {}
            State::Starting => self.starting(),
            State::PreSceneShellout => {
                if !self.shellout_busy() {
                    self.state = self.after_shellout(State::Starting);
                }
            }
            State::PreFrameShellout => {
                if !self.shellout_busy() {
                    self.pre_frame_done();
                }
            }
            State::Parsing | State::PausedParsing => self.parsing(),
            State::Rendering | State::PausedRendering => self.rendering(),
            State::PostFrameShellout => {
                if !self.shellout_busy() {
                    self.post_frame_done();
                }
            }
            State::PostSceneShellout => {
                let running = self.shellouts.shellout_running().unwrap_or_else(|err| {
                    debug!(%err, "post-scene shellout reported an error");
                    false
                });
                if !running {
                    self.state = State::Done;
                }
            }
            State::PostShelloutPause => {}
            State::Stopping => self.stopping(),
            State::Failed => {
                self.log.set_failed();
                if let Err(err) = self.shellouts.process_event(ShelloutEvent::FatalError) {
                    debug!(%err, "fatal-error shellout failed");
                }
                self.state = State::Stopped;
            }
            State::Stopped => self.stopped(),
            State::Done => self.state = State::Ready,
        }

        if self.state != before {
            debug!(from = %before, to = %self.state, "session state changed");
        }
        self.state
    }

    fn pump(&mut self) {
        for notice in self.session.pump() {
            match notice {
                Notice::Stream { stream, text, echo } => {
                    self.hooks.stream_output(stream, &text, echo);
                    self.log.append_stream_message(stream, text);
                }
                Notice::ParserOptions { attrs, echo } => self.hooks.parser_options(&attrs, echo),
                Notice::RenderOptions { attrs, echo } => self.hooks.render_options(&attrs, echo),
                Notice::Progress { attrs, echo } => {
                    if attrs.contains(keys::PIXELS_TOTAL) {
                        self.log.set_pixels_rendered(
                            attrs.try_get_int(keys::PIXELS_COMPLETED, 0).max(0) as u64,
                            attrs.try_get_int(keys::PIXELS_TOTAL, 0).max(0) as u64,
                        );
                    }
                    self.hooks.progress(&attrs, echo);
                }
            }
        }
    }

    /// Records `err` and moves to [`State::Failed`].
    fn fail(&mut self, err: FrontendError) {
        self.log.set_failed();
        self.log.append_error_and_status(err.to_string());
        self.state = State::Failed;
    }

    /// Records a shellout error. A prohibited command is left to the
    /// coordinator; anything else fails the session. Returns whether it did.
    fn report_shellout_error(&mut self, err: FrontendError) -> bool {
        if err.is_cannot_open_file() {
            self.log.append_error_and_status(err.to_string());
            return false;
        }
        self.fail(err);
        true
    }

    /// Applies a cancel requested by a shellout. Returns whether there was one.
    fn handle_shellout_cancel(&mut self) -> bool {
        if !self.shellouts.render_cancelled() {
            return false;
        }
        let message = self.shellouts.cancel_message();
        if self.shellouts.exit_code() != 0 {
            self.state = State::Failed;
            self.log.set_failed();
        } else {
            self.state = State::Stopped;
            self.log.set_succeeded(true);
        }
        self.log.append_error(message.clone());
        self.log.append_status(message);
        true
    }

    /// True while the current shellout runs, or once it has changed the state.
    fn shellout_busy(&mut self) -> bool {
        match self.shellouts.shellout_running() {
            Ok(true) => return true,
            Ok(false) => {}
            Err(err) => {
                if self.report_shellout_error(err) {
                    return true;
                }
            }
        }
        self.handle_shellout_cancel()
    }

    /// Goes to `next`, or parks first if a pause came in during the shellout.
    fn after_shellout(&mut self, next: State) -> State {
        if self.pause_requested {
            self.pause_requested = false;
            self.post_pause_state = next;
            State::PostShelloutPause
        } else {
            next
        }
    }

    fn next_frame(&mut self) -> bool {
        match self.animation.as_mut() {
            Some(animation) if animation.more_frames() => {
                animation.compute_next_frame();
                self.log.set_pixels_rendered(0, self.log.total_pixels());
                self.log.set_percent_complete(0);
                true
            }
            _ => false,
        }
    }

    /// Closes the current view and scene; failures are only logged.
    fn close_current(&mut self) {
        if let Some(vid) = self.view.take() {
            if let Err(err) = self.session.close_view(vid) {
                debug!(%err, view = vid.id, "ignoring failure to close view");
            }
        }
        if let Some(sid) = self.scene.take() {
            if let Err(err) = self.session.close_scene(sid) {
                debug!(%err, scene = sid.id, "ignoring failure to close scene");
            }
        }
    }

    /// Sets up the frame the animation cursor points at.
    fn prepare_frame(&mut self) -> Result<()> {
        let Some(animation) = self.animation.as_ref() else {
            return Ok(());
        };
        let frame_id = animation.nominal_frame_number();
        self.shellouts.set_frame_clock(frame_id, animation.clock_value());
        if self.shellouts.skip_next_frame() {
            return Ok(());
        }
        let running = animation.running_frame_number();
        let total = animation.total_frames_to_render();
        let digits = animation.frame_number_digits();
        self.options = animation.frame_render_options(&self.base_options);

        let mut filename = String::new();
        if self.output_to_file() {
            filename = output_filename(&self.options, frame_id, digits)?;
            self.options.set(keys::OUTPUT_FILE, filename.clone());
            if !self.session.policy().allow_write(Path::new(&filename)) {
                return Err(FrontendError::CannotOpenFile(format!(
                    "IO Restrictions prohibit write access to '{filename}'"
                )));
            }
            self.shellouts.set_output_file(&filename);
            self.log.advise_output_filename(filename.clone());
        }
        self.log.append_animation_status(frame_id, running, total, &filename);
        Ok(())
    }

    fn starting(&mut self) {
        self.log.set_succeeded(false);
        if let Err(err) = self.prepare_frame() {
            self.fail(err);
            return;
        }

        let had_pre_scene = self.shellouts.had_pre_scene();
        // Runs the pre-scene command instead on the first call.
        if let Err(err) = self.shellouts.process_event(ShelloutEvent::PreFrame) {
            if self.report_shellout_error(err) {
                return;
            }
        }
        if self.handle_shellout_cancel() {
            return;
        }
        self.state = if had_pre_scene {
            State::PreFrameShellout
        } else {
            State::PreSceneShellout
        };
    }

    fn pre_frame_done(&mut self) {
        if self.shellouts.skip_next_frame() {
            let message = self.shellouts.skip_message();
            self.log.append_status(message.clone());
            self.log.append_stream_message(Stream::Status, message);
            self.state = if self.next_frame() {
                self.after_shellout(State::Starting)
            } else {
                self.log.set_succeeded(true);
                self.after_shellout(State::Stopped)
            };
            return;
        }

        let sid = match self.session.create_scene(&mut self.options) {
            Ok(sid) => sid,
            Err(err) => return self.fail(err),
        };
        self.scene = Some(sid);
        if let Err(err) = self.session.start_parser(sid, &self.options) {
            return self.fail(err);
        }
        self.state = self.after_shellout(State::Parsing);
    }

    fn parsing(&mut self) {
        let Some(sid) = self.scene else {
            return;
        };
        match self.session.scene_state(sid) {
            SceneState::Paused => self.state = State::PausedParsing,
            SceneState::Failed => {
                self.log.set_failed();
                self.state = State::Stopped;
            }
            SceneState::Stopping => self.state = State::Stopping,
            // The parser can finish right after accepting a pause; stay
            // paused until resumed.
            SceneState::Ready if self.state == State::PausedParsing => {}
            SceneState::Ready => self.start_view(sid),
            _ => {}
        }
    }

    fn start_view(&mut self, sid: SceneId) {
        let vid = match self
            .session
            .create_view(sid, &mut self.options, None, self.display_factory.as_mut())
        {
            Ok(vid) => vid,
            Err(err) => return self.fail(err),
        };
        self.view = Some(vid);

        match self.session.start_render(vid, &mut self.options) {
            Ok(()) => {}
            Err(err) if err.is_already_rendered() => {
                self.log.clear_status();
                self.log.append_status(ALREADY_RENDERED);
                self.log.append_stream_message(Stream::Status, ALREADY_RENDERED);
                self.close_current();
                self.state = if self.next_frame() {
                    State::Starting
                } else {
                    self.log.set_succeeded(true);
                    State::Stopped
                };
                return;
            }
            Err(err) => {
                self.log.clear_status();
                return self.fail(err);
            }
        }
        if let Some(display) = self.session.display_mut(vid) {
            display.show();
        }
        self.state = State::Rendering;
    }

    fn rendering(&mut self) {
        let Some(vid) = self.view else {
            return;
        };
        match self.session.view_state(vid) {
            ViewState::Paused => self.state = State::PausedRendering,
            ViewState::Failed => {
                self.log.set_failed();
                self.state = State::Stopped;
            }
            ViewState::Stopping => self.state = State::Stopping,
            // Same race as for parsing.
            ViewState::Rendered if self.state == State::PausedRendering => {}
            ViewState::Rendered => self.finish_frame(vid),
            _ => {}
        }
    }

    /// Writes the image of a finished view.
    fn write_output(&mut self, vid: ViewId) -> Result<()> {
        let (frame, digits) = self
            .animation
            .as_ref()
            .map_or((0, 0), |a| (a.nominal_frame_number(), a.frame_number_digits()));
        if self.output_to_file() {
            if let Some(image) = self.session.image(vid) {
                // The per-frame name is already in `options`; naming starts
                // again from the configured one.
                let mut opts = self.options.clone();
                match self.base_options.get(keys::OUTPUT_FILE) {
                    Some(original) => opts.set(keys::OUTPUT_FILE, original.clone()),
                    None => {
                        opts.remove(keys::OUTPUT_FILE);
                    }
                }
                let written = write_image(&opts, image, frame, digits)?;
                if !written.is_empty() {
                    info!(file = %written, "wrote image");
                    self.log.advise_output_filename(written);
                }
            }
        }
        if self.animation.is_some() {
            self.log.advise_frame_completed();
        }
        Ok(())
    }

    fn finish_frame(&mut self, vid: ViewId) {
        if let Err(err) = self.write_output(vid) {
            return self.fail(err);
        }
        if let Err(err) = self.shellouts.process_event(ShelloutEvent::PostFrame) {
            if self.report_shellout_error(err) {
                return;
            }
        }
        if self.handle_shellout_cancel() {
            return;
        }
        self.state = State::PostFrameShellout;
    }

    fn post_frame_done(&mut self) {
        if !self.animation.as_ref().is_some_and(AnimationSequencer::more_frames) {
            self.log.set_succeeded(true);
            self.state = self.after_shellout(State::Stopped);
            return;
        }
        if self.shellouts.skip_all_frames() {
            let message = self.shellouts.skip_message();
            self.log.set_succeeded(true);
            self.log.append_status(message.clone());
            self.log.append_stream_message(Stream::Status, message);
            self.state = self.after_shellout(State::Stopped);
            return;
        }

        self.close_current();
        self.next_frame();
        if self.config.pause_when_done {
            self.paused_after_frame = true;
            self.pause_requested = false;
            self.state = State::PausedRendering;
            return;
        }
        self.state = self.after_shellout(State::Starting);
    }

    fn stopping(&mut self) {
        let scene = self.scene.map_or(SceneState::Unknown, |sid| self.session.scene_state(sid));
        let view = self.view.map_or(ViewState::Unknown, |vid| self.session.view_state(vid));
        let quiescent = matches!(scene, SceneState::Ready | SceneState::Failed)
            || matches!(view, ViewState::Rendered | ViewState::Failed)
            || (scene == SceneState::Unknown && view == ViewState::Unknown);
        if quiescent {
            self.state = State::Stopped;
        }
    }

    fn stopped(&mut self) {
        self.close_current();
        self.animation = None;

        // Post-scene and fatal-error commands only run once pre-scene has.
        if self.shellouts.had_pre_scene() {
            if self.log.failed() {
                if let Err(err) = self.shellouts.process_event(ShelloutEvent::FatalError) {
                    debug!(%err, "fatal-error shellout failed");
                }
            }
            if !self.shellouts.had_post_scene() {
                if let Err(err) = self.shellouts.process_event(ShelloutEvent::PostScene) {
                    debug!(%err, "post-scene shellout failed");
                }
                self.state = State::PostSceneShellout;
                return;
            }
        }
        self.state = State::Done;
    }

    fn kill_running_shellout(&mut self) {
        if !self.shellouts.shellout_running().unwrap_or(false) {
            return;
        }
        let graceful = Duration::from_secs(self.config.shellouts.graceful_kill_secs);
        let forced = Duration::from_secs(self.config.shellouts.forced_kill_secs);
        let killed = matches!(self.shellouts.kill_shellouts(graceful, false), Ok(true))
            || matches!(self.shellouts.kill_shellouts(forced, true), Ok(true));
        if !killed {
            self.log
                .append_error_and_status("Failed to terminate currently-running shellout process");
        }
    }

    /// Cancels the session. The state machine finishes the job in later
    /// [`Frontend::process`] calls. Returns whether there was anything to stop.
    pub fn stop(&mut self) -> bool {
        if self.state == State::Ready {
            return false;
        }
        let mut result = false;
        match self.state {
            State::Starting => {
                self.state = State::Stopped;
                self.log.set_failed();
                result = true;
            }
            State::PreSceneShellout
            | State::PreFrameShellout
            | State::PostFrameShellout
            | State::PostSceneShellout => {
                self.kill_running_shellout();
                if self.state == State::PostSceneShellout {
                    self.state = State::Done;
                    return true;
                }
                self.log.set_failed();
                self.state = State::Stopped;
                result = true;
            }
            State::PostShelloutPause => {
                self.log.set_failed();
                self.state = State::Stopping;
                result = true;
            }
            State::Parsing | State::PausedParsing => {
                if let Some(sid) = self.scene {
                    // The parser may already have finished.
                    if let Err(err) = self.session.stop_parser(sid) {
                        debug!(%err, "stop parser");
                    }
                }
                self.log.set_failed();
                self.state = State::Stopping;
                result = true;
            }
            State::Rendering | State::PausedRendering => {
                self.log.set_failed();
                if self.paused_after_frame {
                    self.paused_after_frame = false;
                    self.state = State::Stopped;
                } else {
                    if let Some(vid) = self.view {
                        if let Err(err) = self.session.stop_render(vid) {
                            debug!(%err, "stop render");
                        }
                    }
                    self.state = State::Stopping;
                }
                result = true;
            }
            _ => {}
        }

        if let Err(err) = self.shellouts.process_event(ShelloutEvent::UserAbort) {
            if !err.is_cannot_open_file() {
                self.log.set_failed();
            }
            self.log.append_error_and_status(err.to_string());
        }
        info!(state = %self.state, "stop requested");
        result
    }

    /// Pauses parsing or rendering right away. During a shellout the pause
    /// is remembered and taken once the command has finished.
    pub fn pause(&mut self) -> bool {
        match self.state {
            State::Parsing => {
                let Some(sid) = self.scene else {
                    return false;
                };
                match self.session.pause_parser(sid) {
                    Ok(Control::Applied) => {
                        self.state = State::PausedParsing;
                        true
                    }
                    Ok(Control::Deferred) => false,
                    Err(err) => {
                        debug!(%err, "pause parser");
                        false
                    }
                }
            }
            State::PreSceneShellout | State::PreFrameShellout | State::PostFrameShellout => {
                self.pause_requested = true;
                true
            }
            State::Rendering => {
                let Some(vid) = self.view else {
                    return false;
                };
                match self.session.pause_render(vid) {
                    Ok(Control::Applied) => {
                        self.state = State::PausedRendering;
                        true
                    }
                    Ok(Control::Deferred) => false,
                    Err(err) => {
                        debug!(%err, "pause render");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    pub fn resume(&mut self) -> bool {
        match self.state {
            State::PostShelloutPause => {
                self.state = self.post_pause_state;
                true
            }
            State::PausedParsing => {
                if let Some(sid) = self.scene {
                    if self.session.scene_state(sid) == SceneState::Paused {
                        match self.session.resume_parser(sid) {
                            Ok(Control::Applied) => {}
                            Ok(Control::Deferred) => return false,
                            Err(err) => {
                                debug!(%err, "resume parser");
                                return false;
                            }
                        }
                    }
                }
                self.state = State::Parsing;
                true
            }
            State::PausedRendering => {
                if self.paused_after_frame {
                    self.paused_after_frame = false;
                    self.state = State::Starting;
                    return true;
                }
                if let Some(vid) = self.view {
                    if self.session.view_state(vid) == ViewState::Paused {
                        match self.session.resume_render(vid) {
                            Ok(Control::Applied) => {}
                            Ok(Control::Deferred) => return false,
                            Err(err) => {
                                debug!(%err, "resume render");
                                return false;
                            }
                        }
                    }
                }
                self.state = State::Rendering;
                true
            }
            _ => false,
        }
    }
}
