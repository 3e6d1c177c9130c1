//! External commands run at fixed points of a render session.
//!
//! Six events can carry a command: before/after the whole scene, before/after
//! every frame, on user abort and on fatal error. A command runs without
//! blocking the caller; once it has finished its exit status is mapped through
//! the configured [`ReturnAction`] into cancel or skip directives.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::options::{keys, Options, Value};
use crate::{FrontendError, Result};

mod process;

pub use process::ProcessRunner;

/// Value returned by [`CommandRunner::collect`] when no command is pending.
pub const NOTHING_TO_COLLECT: i32 = -2;

/// Lifecycle points that can run a command, in the order they are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShelloutEvent {
    PreScene,
    PostScene,
    PreFrame,
    PostFrame,
    UserAbort,
    FatalError,
}

impl ShelloutEvent {
    pub const ALL: [ShelloutEvent; 6] = [
        Self::PreScene,
        Self::PostScene,
        Self::PreFrame,
        Self::PostFrame,
        Self::UserAbort,
        Self::FatalError,
    ];

    pub fn phase_name(self) -> &'static str {
        match self {
            Self::PreScene => "pre-scene",
            Self::PostScene => "post-scene",
            Self::PreFrame => "pre-frame",
            Self::PostFrame => "post-frame",
            Self::UserAbort => "user abort",
            Self::FatalError => "fatal error",
        }
    }

    fn option_key(self) -> &'static str {
        match self {
            Self::PreScene => keys::PRE_SCENE_COMMAND,
            Self::PostScene => keys::POST_SCENE_COMMAND,
            Self::PreFrame => keys::PRE_FRAME_COMMAND,
            Self::PostFrame => keys::POST_FRAME_COMMAND,
            Self::UserAbort => keys::USER_ABORT_COMMAND,
            Self::FatalError => keys::FATAL_ERROR_COMMAND,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// What a failing command asks the session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnAction {
    #[default]
    Ignore,
    SkipOne,
    SkipAll,
    Quit,
    Abort,
    Fatal,
}

impl ReturnAction {
    /// Parses an action letter (`i`, `s`, `a`, `q`, `u`, `f`). An upper-case
    /// letter or a leading `!` or `-` inverts the success test. Returns the
    /// action and the negate flag.
    pub fn parse(text: &str) -> Option<(Self, bool)> {
        let text = text.trim();
        let (negate_prefix, rest) = match text.strip_prefix(['!', '-']) {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let mut chars = rest.chars();
        let letter = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        let action = match letter.to_ascii_lowercase() {
            'i' => Self::Ignore,
            's' => Self::SkipOne,
            'a' => Self::SkipAll,
            'q' => Self::Quit,
            'u' => Self::Abort,
            'f' => Self::Fatal,
            _ => return None,
        };
        Some((action, negate_prefix || letter.is_ascii_uppercase()))
    }
}

/// One configured command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShelloutAction {
    pub raw_command: String,
    pub command: String,
    pub raw_parameters: String,
    pub parameters: String,
    pub return_action: ReturnAction,
    pub negate: bool,
    pub is_set: bool,
}

impl ShelloutAction {
    /// Reads `{command_string, return_action}` from `opts[key]`. A missing
    /// entry, an empty command or an unknown action leaves it unset.
    pub fn from_options(opts: &Options, key: &str) -> Self {
        let mut action = Self::default();
        let Some(entry) = opts.get_object(key) else {
            return action;
        };
        let Some(raw) = entry.get(keys::COMMAND_STRING).and_then(Value::as_str) else {
            return action;
        };
        action.raw_command = raw.to_owned();
        let Some((command, parameters)) = extract_command(raw) else {
            return action;
        };
        action.command = command;
        action.raw_parameters = parameters;

        let (return_action, negate) = match entry.get(keys::RETURN_ACTION) {
            None => (ReturnAction::Ignore, false),
            Some(value) => match value.as_str().and_then(ReturnAction::parse) {
                Some(parsed) => parsed,
                None => {
                    warn!(key, ?value, "unknown shellout return action");
                    return action;
                }
            },
        };
        action.return_action = return_action;
        action.negate = negate;
        action.is_set = true;
        action
    }
}

/// Splits a command line into the command and its parameter string.
///
/// The split happens at the first whitespace outside quotes. A backslash
/// makes the next character literal within the command; the parameter part
/// is kept verbatim. Quotes wrapping the whole command are removed.
pub fn extract_command(src: &str) -> Option<(String, String)> {
    let trimmed = src.trim();
    let mut command = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut rest = "";

    for (idx, ch) in trimmed.char_indices() {
        if escaped {
            escaped = false;
            command.push(ch);
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => {
                in_double = !in_double;
                command.push(ch);
            }
            '\'' => {
                in_single = !in_single;
                command.push(ch);
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                rest = &trimmed[idx..];
                break;
            }
            c => command.push(c),
        }
    }

    let mut command = command.trim().to_owned();
    if command.is_empty() {
        return None;
    }
    let mut chars = command.chars();
    if let (Some(first), Some(last)) = (chars.next(), chars.next_back()) {
        if (first == '\'' || first == '"') && first == last {
            command = command[1..command.len() - 1].trim().to_owned();
            if command.is_empty() {
                return None;
            }
        }
    }
    Some((command, rest.trim().to_owned()))
}

/// Values substituted into a parameter template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateValues<'a> {
    pub scene: &'a str,
    pub output_file: &'a str,
    pub width: u32,
    pub height: u32,
    pub clock: f64,
    pub frame: i64,
}

/// Expands `%s` (scene), `%o` (output file), `%w`, `%h`, `%k` (clock),
/// `%n` (frame) and `%%`. Any other `%x` is copied through.
pub fn expand_parameters(template: &str, values: &TemplateValues<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('o') => out.push_str(values.output_file),
            Some('s') => out.push_str(values.scene),
            Some('n') => out.push_str(&values.frame.to_string()),
            Some('k') => out.push_str(&format!("{:.6}", values.clock)),
            Some('h') => out.push_str(&values.height.to_string()),
            Some('w') => out.push_str(&values.width.to_string()),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Replaces `%1%`..`%9%` with the matching argument and `%%` with `%`.
pub fn format_positional(template: &str, args: &[String]) -> String {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            if bytes.get(idx + 1) == Some(&b'%') {
                out.push('%');
                idx += 2;
                continue;
            }
            if let (Some(digit @ b'1'..=b'9'), Some(b'%')) = (bytes.get(idx + 1), bytes.get(idx + 2)) {
                if let Some(arg) = args.get(usize::from(digit - b'1')) {
                    out.push_str(arg);
                }
                idx += 3;
                continue;
            }
        }
        let ch_len = template[idx..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&template[idx..idx + ch_len]);
        idx += ch_len;
    }
    out
}

/// Platform side of shellouts: starts, polls and stops one process at a time.
pub trait CommandRunner: Send {
    fn supported(&self) -> bool {
        true
    }

    fn permitted(&self, command: &str, parameters: &str) -> bool;

    /// Starts the command without waiting for it.
    fn execute(&mut self, command: &str, parameters: &str) -> Result<()>;

    fn running(&mut self) -> bool;

    /// Exit code and captured output of the finished command, or
    /// [`NOTHING_TO_COLLECT`] when there is none.
    fn collect(&mut self) -> (i32, String);

    /// Waits up to `timeout` for the command to exit, then kills it when
    /// `force` is set. Returns whether nothing is left running.
    fn kill(&mut self, timeout: Duration, force: bool) -> Result<bool>;
}

/// Details recorded when a command cancels the render or skips frames.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShelloutOutcome {
    pub phase: String,
    pub reason: String,
    pub command: String,
    pub parameters: String,
    pub return_code: i32,
    pub output: String,
}

#[derive(Debug, Default)]
struct Flags {
    had_pre_scene: bool,
    had_post_scene: bool,
    had_user_abort: bool,
    skip_all_frames: bool,
    skip_next_frame: bool,
    cancel_render: bool,
    skip_callouts: bool,
    kill_requested: bool,
    command_prohibited: bool,
    process_start_requested: bool,
}

/// Runs the configured commands and tracks what they asked for.
pub struct ShelloutCoordinator {
    runner: Box<dyn CommandRunner>,
    actions: [ShelloutAction; 6],
    scene_name: String,
    output_file: String,
    width: u32,
    height: u32,
    clock: f64,
    frame: i64,
    flags: Flags,
    exit_code: i32,
    pending_event: Option<ShelloutEvent>,
    running_process_name: String,
    last_output: String,
    cancel: ShelloutOutcome,
    skip: ShelloutOutcome,
    cancel_format: String,
    skip_format: String,
}

impl std::fmt::Debug for ShelloutCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShelloutCoordinator")
            .field("scene_name", &self.scene_name)
            .field("flags", &self.flags)
            .field("exit_code", &self.exit_code)
            .field("pending_event", &self.pending_event)
            .finish_non_exhaustive()
    }
}

impl ShelloutCoordinator {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            runner,
            actions: Default::default(),
            scene_name: String::new(),
            output_file: String::new(),
            width: 0,
            height: 0,
            clock: 0.0,
            frame: 0,
            flags: Flags::default(),
            exit_code: 0,
            pending_event: None,
            running_process_name: String::new(),
            last_output: String::new(),
            cancel: ShelloutOutcome::default(),
            skip: ShelloutOutcome::default(),
            cancel_format: String::new(),
            skip_format: String::new(),
        }
    }

    /// Loads the commands for a new session and clears all state from the
    /// previous one. Message templates are kept.
    pub fn configure(&mut self, opts: &Options, scene_name: &str, width: u32, height: u32) {
        for event in ShelloutEvent::ALL {
            self.actions[event.index()] = ShelloutAction::from_options(opts, event.option_key());
        }
        self.scene_name = scene_name.to_owned();
        self.output_file.clear();
        self.width = width;
        self.height = height;
        self.clock = 0.0;
        self.frame = 0;
        self.flags = Flags::default();
        self.exit_code = 0;
        self.pending_event = None;
        self.running_process_name.clear();
        self.last_output.clear();
        self.cancel = ShelloutOutcome::default();
        self.skip = ShelloutOutcome::default();
    }

    pub fn set_cancel_message(&mut self, format: &str) {
        self.cancel_format = format.to_owned();
    }

    pub fn set_skip_message(&mut self, format: &str) {
        self.skip_format = format.to_owned();
    }

    pub fn set_output_file(&mut self, filename: &str) {
        self.output_file = filename.to_owned();
    }

    /// Moves to `frame`. Leaving the frame a skip was requested for clears
    /// the skip.
    pub fn set_frame_clock(&mut self, frame: i64, clock: f64) {
        if self.frame != frame {
            self.flags.skip_next_frame = false;
        }
        self.frame = frame;
        self.clock = clock;
    }

    pub fn action(&self, event: ShelloutEvent) -> &ShelloutAction {
        &self.actions[event.index()]
    }

    pub fn render_cancelled(&self) -> bool {
        self.flags.cancel_render
    }

    pub fn had_pre_scene(&self) -> bool {
        self.flags.had_pre_scene
    }

    pub fn had_post_scene(&self) -> bool {
        self.flags.had_post_scene
    }

    pub fn skip_all_frames(&self) -> bool {
        self.flags.skip_all_frames
    }

    pub fn skip_next_frame(&self) -> bool {
        self.flags.skip_next_frame
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn exit_desc(&self) -> &'static str {
        match self.exit_code {
            0 => "SUCCESS",
            2 => "USER ABORT",
            _ => "FATAL ERROR",
        }
    }

    pub fn cancel_outcome(&self) -> &ShelloutOutcome {
        &self.cancel
    }

    pub fn skip_outcome(&self) -> &ShelloutOutcome {
        &self.skip
    }

    pub fn cancel_message(&self) -> String {
        format_positional(
            &self.cancel_format,
            &[
                self.cancel.phase.clone(),
                self.exit_code.to_string(),
                self.exit_desc().to_owned(),
                self.exit_desc().to_lowercase(),
                self.cancel.reason.clone(),
                self.cancel.command.clone(),
                self.cancel.parameters.clone(),
                self.cancel.return_code.to_string(),
                self.cancel.output.clone(),
            ],
        )
    }

    pub fn skip_message(&self) -> String {
        format_positional(
            &self.skip_format,
            &[
                self.skip.phase.clone(),
                self.skip.reason.clone(),
                self.skip.command.clone(),
                self.skip.parameters.clone(),
                self.skip.return_code.to_string(),
                self.skip.output.clone(),
            ],
        )
    }

    /// Name of the command currently running, if any.
    pub fn process_name(&mut self) -> Result<Option<String>> {
        Ok(self.shellout_running()?.then(|| self.running_process_name.clone()))
    }

    /// Triggers `event`. Returns whether the render has been cancelled.
    pub fn process_event(&mut self, event: ShelloutEvent) -> Result<bool> {
        self.handle_process_event(event, false)
    }

    fn handle_process_event(&mut self, event: ShelloutEvent, internal: bool) -> Result<bool> {
        if self.flags.had_post_scene && event < ShelloutEvent::PostScene {
            return Ok(self.flags.cancel_render);
        }
        let event = if self.flags.had_pre_scene {
            event
        } else {
            ShelloutEvent::PreScene
        };

        let skip_was_set = self.flags.skip_callouts;
        match event {
            ShelloutEvent::PreScene => {
                if self.flags.had_pre_scene {
                    return Ok(self.flags.cancel_render);
                }
                self.flags.had_pre_scene = true;
            }
            ShelloutEvent::PostScene => {
                if self.flags.had_post_scene {
                    return Ok(self.flags.cancel_render);
                }
                self.flags.had_post_scene = true;
            }
            ShelloutEvent::PreFrame | ShelloutEvent::PostFrame => {
                if self.flags.skip_next_frame || self.flags.skip_all_frames {
                    return Ok(self.flags.cancel_render);
                }
            }
            ShelloutEvent::UserAbort => {
                if self.flags.had_user_abort {
                    return Ok(self.flags.cancel_render);
                }
                self.flags.had_user_abort = true;
            }
            ShelloutEvent::FatalError => {
                if self.flags.cancel_render && !internal {
                    return Ok(true);
                }
                self.flags.cancel_render = true;
                self.flags.skip_callouts = true;
                self.exit_code = 1;
            }
        }

        if skip_was_set {
            return Ok(self.flags.cancel_render);
        }
        let action = &mut self.actions[event.index()];
        if !action.is_set || !self.runner.supported() {
            return Ok(self.flags.cancel_render);
        }

        self.flags.process_start_requested = true;
        self.running_process_name = action.command.clone();
        self.pending_event = Some(event);
        self.flags.command_prohibited = false;

        action.parameters = expand_parameters(
            &action.raw_parameters,
            &TemplateValues {
                scene: &self.scene_name,
                output_file: &self.output_file,
                width: self.width,
                height: self.height,
                clock: self.clock,
                frame: self.frame,
            },
        );
        let (command, parameters) = (action.command.clone(), action.parameters.clone());

        if !self.runner.permitted(&command, &parameters) {
            self.flags.command_prohibited = true;
            return Err(FrontendError::CannotOpenFile(format!(
                "Execution of shellout '{command}' prohibited"
            )));
        }

        info!(phase = event.phase_name(), %command, %parameters, "running shellout");
        if let Err(err) = self.runner.execute(&command, &parameters) {
            self.flags.skip_callouts = true;
            return Err(err);
        }
        Ok(self.flags.cancel_render)
    }

    /// Polls the running command; once it has finished, applies its result.
    pub fn shellout_running(&mut self) -> Result<bool> {
        let running = self.runner.running();
        if self.flags.process_start_requested && !running {
            self.post_process_event()?;
        }
        Ok(running)
    }

    fn record_cancel(&mut self, event: ShelloutEvent, reason: &str, ret: i32) {
        let action = &self.actions[event.index()];
        self.cancel = ShelloutOutcome {
            phase: event.phase_name().to_owned(),
            reason: reason.to_owned(),
            command: action.command.clone(),
            parameters: action.parameters.clone(),
            return_code: ret,
            output: self.last_output.clone(),
        };
    }

    fn record_skip(&mut self, event: ShelloutEvent, reason: &str, ret: i32) {
        let action = &self.actions[event.index()];
        self.skip = ShelloutOutcome {
            phase: event.phase_name().to_owned(),
            reason: reason.to_owned(),
            command: action.command.clone(),
            parameters: action.parameters.clone(),
            return_code: ret,
            output: self.last_output.clone(),
        };
    }

    fn post_process_event(&mut self) -> Result<bool> {
        self.flags.process_start_requested = false;
        self.running_process_name.clear();
        let Some(event) = self.pending_event.take() else {
            return Ok(self.flags.cancel_render);
        };

        let (mut ret, output) = self.runner.collect();
        self.last_output = output;
        if ret == 0 && self.flags.command_prohibited {
            ret = 1;
        }
        if self.flags.kill_requested {
            return Ok(true);
        }
        debug!(phase = event.phase_name(), ret, "shellout finished");

        let (action, negate) = {
            let sh = &self.actions[event.index()];
            (sh.return_action, sh.negate)
        };
        let succeeded = (ret == 0) != negate;
        if succeeded || action == ReturnAction::Ignore {
            return Ok(self.flags.cancel_render);
        }

        if event < ShelloutEvent::UserAbort {
            match action {
                ReturnAction::Quit => {
                    self.flags.skip_callouts = true;
                    self.flags.cancel_render = true;
                    self.exit_code = 0;
                    self.record_cancel(event, "quit rendering", ret);
                    return Ok(true);
                }
                ReturnAction::Abort => {
                    self.flags.cancel_render = true;
                    self.exit_code = 2;
                    let chained = self.handle_process_event(ShelloutEvent::UserAbort, true);
                    self.record_cancel(event, "generate a user abort", ret);
                    chained?;
                    return Ok(true);
                }
                ReturnAction::Fatal => {
                    self.flags.cancel_render = true;
                    self.exit_code = 1;
                    let chained = self.handle_process_event(ShelloutEvent::FatalError, true);
                    self.record_cancel(event, "generate a fatal error", ret);
                    chained?;
                    return Ok(true);
                }
                _ => {}
            }
        }

        let skipping = matches!(action, ReturnAction::SkipOne | ReturnAction::SkipAll);
        match event {
            ShelloutEvent::PreScene if skipping => {
                self.flags.cancel_render = true;
                self.exit_code = 0;
                self.record_skip(event, "skip all frames", ret);
                self.record_cancel(event, "skip all frames", ret);
                if action == ReturnAction::SkipAll {
                    self.flags.skip_callouts = true;
                }
                return Ok(true);
            }
            ShelloutEvent::PreFrame if skipping => {
                if action == ReturnAction::SkipAll {
                    self.flags.cancel_render = true;
                    self.flags.skip_all_frames = true;
                    self.exit_code = 0;
                    self.record_skip(event, "skip all remaining frames", ret);
                    self.record_cancel(event, "skip all frames", ret);
                } else {
                    self.flags.skip_next_frame = true;
                    let reason = format!("skip frame {}", self.frame + 1);
                    self.record_skip(event, &reason, ret);
                }
            }
            ShelloutEvent::PostFrame if skipping => {
                self.flags.cancel_render = true;
                self.flags.skip_all_frames = true;
                self.record_skip(event, "skip all remaining frames", ret);
                self.record_cancel(event, "skip all remaining frames", ret);
            }
            ShelloutEvent::UserAbort => {
                self.flags.cancel_render = true;
                self.exit_code = 2;
                let mut reason = "generate a user abort";
                let mut chained = Ok(true);
                if action == ReturnAction::Fatal {
                    self.exit_code = 1;
                    chained = self.handle_process_event(ShelloutEvent::FatalError, true);
                    reason = "generate a fatal error";
                }
                self.record_cancel(event, reason, ret);
                chained?;
                return Ok(true);
            }
            _ => {}
        }
        Ok(self.flags.cancel_render)
    }

    /// Stops the running command. Its result is ignored afterwards.
    pub fn kill_shellouts(&mut self, timeout: Duration, force: bool) -> Result<bool> {
        self.flags.kill_requested = true;
        self.runner.kill(timeout, force)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records dispatches; each command finishes on the next poll with the
    /// next scripted exit code (0 when the script runs out).
    #[derive(Clone, Default)]
    struct Recorder {
        dispatched: Arc<Mutex<Vec<(String, String)>>>,
        codes: Arc<Mutex<VecDeque<i32>>>,
        refuse: bool,
    }

    struct RecordingRunner {
        recorder: Recorder,
        pending: Option<i32>,
    }

    impl CommandRunner for RecordingRunner {
        fn permitted(&self, _command: &str, _parameters: &str) -> bool {
            !self.recorder.refuse
        }

        fn execute(&mut self, command: &str, parameters: &str) -> Result<()> {
            self.recorder
                .dispatched
                .lock()
                .unwrap()
                .push((command.to_owned(), parameters.to_owned()));
            self.pending = Some(self.recorder.codes.lock().unwrap().pop_front().unwrap_or(0));
            Ok(())
        }

        fn running(&mut self) -> bool {
            false
        }

        fn collect(&mut self) -> (i32, String) {
            (self.pending.take().unwrap_or(NOTHING_TO_COLLECT), "out".to_owned())
        }

        fn kill(&mut self, _timeout: Duration, _force: bool) -> Result<bool> {
            Ok(true)
        }
    }

    fn command(cmd: &str, action: &str) -> Options {
        Options::new()
            .with(keys::COMMAND_STRING, cmd)
            .with(keys::RETURN_ACTION, action)
    }

    fn coordinator(opts: &Options, recorder: &Recorder) -> ShelloutCoordinator {
        let mut sc = ShelloutCoordinator::new(Box::new(RecordingRunner {
            recorder: recorder.clone(),
            pending: None,
        }));
        sc.configure(opts, "foo", 320, 240);
        sc
    }

    fn dispatched(recorder: &Recorder) -> Vec<String> {
        recorder.dispatched.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    #[test]
    fn pre_scene_runs_once() {
        let recorder = Recorder::default();
        let opts = Options::new().with(keys::PRE_SCENE_COMMAND, command("prep", "i"));
        let mut sc = coordinator(&opts, &recorder);
        assert!(!sc.process_event(ShelloutEvent::PreScene).unwrap());
        sc.shellout_running().unwrap();
        assert!(!sc.process_event(ShelloutEvent::PreScene).unwrap());
        assert_eq!(dispatched(&recorder), vec!["prep"]);
    }

    #[test]
    fn first_event_is_coerced_to_pre_scene() {
        let recorder = Recorder::default();
        let opts = Options::new()
            .with(keys::PRE_SCENE_COMMAND, command("scene-hook", "i"))
            .with(keys::PRE_FRAME_COMMAND, command("frame-hook", "i"));
        let mut sc = coordinator(&opts, &recorder);
        sc.process_event(ShelloutEvent::PreFrame).unwrap();
        sc.shellout_running().unwrap();
        assert_eq!(dispatched(&recorder), vec!["scene-hook"]);
        assert!(sc.had_pre_scene());

        sc.process_event(ShelloutEvent::PreFrame).unwrap();
        assert_eq!(dispatched(&recorder), vec!["scene-hook", "frame-hook"]);
    }

    #[test]
    fn quoted_command_is_unwrapped() {
        assert_eq!(
            extract_command(" 'my cmd' -x \"a b\" "),
            Some(("my cmd".to_owned(), "-x \"a b\"".to_owned()))
        );
        assert_eq!(
            extract_command(r"my\ tool --flag"),
            Some(("my tool".to_owned(), "--flag".to_owned()))
        );
        assert_eq!(extract_command("   "), None);
        assert_eq!(extract_command("''"), None);
        assert_eq!(extract_command(r"run C:\dir\x"), Some(("run".to_owned(), r"C:\dir\x".to_owned())));
    }

    #[test]
    fn parameter_template_expands() {
        let values = TemplateValues {
            scene: "foo",
            output_file: "/tmp/foo.png",
            width: 320,
            height: 240,
            clock: 1.5,
            frame: 3,
        };
        assert_eq!(
            expand_parameters("-i%s -o%o %wx%h @%k (%%)", &values),
            "-ifoo -o/tmp/foo.png 320x240 @1.500000 (%)"
        );
        assert_eq!(expand_parameters("frame %n %q 100%", &values), "frame 3 %q 100%");
    }

    #[test]
    fn return_actions_parse_with_negation() {
        assert_eq!(ReturnAction::parse("a"), Some((ReturnAction::SkipAll, false)));
        assert_eq!(ReturnAction::parse("F"), Some((ReturnAction::Fatal, true)));
        assert_eq!(ReturnAction::parse("!q"), Some((ReturnAction::Quit, true)));
        assert_eq!(ReturnAction::parse("-u"), Some((ReturnAction::Abort, true)));
        assert_eq!(ReturnAction::parse("x"), None);
        assert_eq!(ReturnAction::parse(""), None);
    }

    #[test]
    fn failing_pre_frame_skip_all_cancels() {
        let recorder = Recorder::default();
        recorder.codes.lock().unwrap().extend([0, 1]);
        let opts = Options::new().with(keys::PRE_FRAME_COMMAND, command("check %n", "a"));
        let mut sc = coordinator(&opts, &recorder);
        sc.set_skip_message("The %1% shell-out ('%3%') requested to %2%.");

        sc.set_frame_clock(1, 0.0);
        assert!(!sc.process_event(ShelloutEvent::PreFrame).unwrap());
        sc.shellout_running().unwrap();
        assert!(!sc.process_event(ShelloutEvent::PreFrame).unwrap());
        sc.shellout_running().unwrap();
        assert!(!sc.render_cancelled());

        sc.set_frame_clock(2, 0.25);
        sc.process_event(ShelloutEvent::PreFrame).unwrap();
        sc.shellout_running().unwrap();
        assert!(sc.render_cancelled());
        assert!(sc.skip_all_frames());
        assert_eq!(sc.exit_code(), 0);
        assert_eq!(sc.skip_outcome().phase, "pre-frame");
        assert_eq!(sc.skip_outcome().parameters, "2");
        assert_eq!(
            sc.skip_message(),
            "The pre-frame shell-out ('check') requested to skip all remaining frames."
        );

        sc.set_frame_clock(3, 0.5);
        sc.process_event(ShelloutEvent::PreFrame).unwrap();
        assert_eq!(dispatched(&recorder).len(), 2);
    }

    #[test]
    fn skip_one_only_skips_the_next_frame() {
        let recorder = Recorder::default();
        recorder.codes.lock().unwrap().extend([1]);
        let opts = Options::new().with(keys::PRE_FRAME_COMMAND, command("gate", "s"));
        let mut sc = coordinator(&opts, &recorder);
        sc.set_frame_clock(1, 0.0);
        sc.process_event(ShelloutEvent::PreScene).unwrap();
        sc.process_event(ShelloutEvent::PreFrame).unwrap();
        sc.shellout_running().unwrap();
        assert!(sc.skip_next_frame());
        assert!(!sc.render_cancelled());
        assert_eq!(sc.skip_outcome().reason, "skip frame 2");

        sc.set_frame_clock(1, 0.0);
        assert!(sc.skip_next_frame());
        sc.set_frame_clock(2, 0.5);
        assert!(!sc.skip_next_frame());
    }

    #[test]
    fn abort_chains_user_abort_command() {
        let recorder = Recorder::default();
        recorder.codes.lock().unwrap().extend([7]);
        let opts = Options::new()
            .with(keys::POST_FRAME_COMMAND, command("verify", "u"))
            .with(keys::USER_ABORT_COMMAND, command("cleanup", "i"));
        let mut sc = coordinator(&opts, &recorder);
        sc.set_cancel_message("Render halted because the %1% shell-out ('%6%') requested to %5%.");
        sc.process_event(ShelloutEvent::PreScene).unwrap();
        sc.process_event(ShelloutEvent::PostFrame).unwrap();
        sc.shellout_running().unwrap();

        assert!(sc.render_cancelled());
        assert_eq!(sc.exit_code(), 2);
        assert_eq!(sc.exit_desc(), "USER ABORT");
        assert_eq!(dispatched(&recorder), vec!["verify", "cleanup"]);
        assert_eq!(sc.cancel_outcome().return_code, 7);
        assert_eq!(
            sc.cancel_message(),
            "Render halted because the post-frame shell-out ('verify') requested to generate a user abort."
        );
    }

    #[test]
    fn fatal_error_event_suppresses_later_callouts() {
        let recorder = Recorder::default();
        let opts = Options::new()
            .with(keys::FATAL_ERROR_COMMAND, command("alert", "i"))
            .with(keys::POST_SCENE_COMMAND, command("done", "i"));
        let mut sc = coordinator(&opts, &recorder);
        sc.process_event(ShelloutEvent::PreScene).unwrap();
        assert!(sc.process_event(ShelloutEvent::FatalError).unwrap());
        sc.shellout_running().unwrap();
        assert_eq!(sc.exit_code(), 1);
        assert!(sc.process_event(ShelloutEvent::FatalError).unwrap());
        sc.process_event(ShelloutEvent::PostScene).unwrap();
        assert_eq!(dispatched(&recorder), vec!["alert"]);
    }

    #[test]
    fn prohibited_command_is_cannot_open_file() {
        let recorder = Recorder {
            refuse: true,
            ..Recorder::default()
        };
        let opts = Options::new().with(keys::PRE_SCENE_COMMAND, command("rm", "f"));
        let mut sc = coordinator(&opts, &recorder);
        let err = sc.process_event(ShelloutEvent::PreScene).unwrap_err();
        assert!(err.is_cannot_open_file());
        assert!(dispatched(&recorder).is_empty());
    }

    #[test]
    fn quit_after_kill_is_ignored() {
        let recorder = Recorder::default();
        recorder.codes.lock().unwrap().extend([1]);
        let opts = Options::new().with(keys::PRE_SCENE_COMMAND, command("slow", "q"));
        let mut sc = coordinator(&opts, &recorder);
        sc.process_event(ShelloutEvent::PreScene).unwrap();
        sc.kill_shellouts(Duration::from_millis(1), true).unwrap();
        sc.shellout_running().unwrap();
        assert_eq!(sc.cancel_outcome(), &ShelloutOutcome::default());
    }

    #[test]
    fn positional_format_handles_escapes() {
        let args = vec!["a".to_owned(), "b".to_owned()];
        assert_eq!(format_positional("%2%-%1% 100%% %3%", &args), "b-a 100% ");
    }
}
