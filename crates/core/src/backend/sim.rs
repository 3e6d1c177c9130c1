//! Deterministic in-process backend.
//!
//! Parsing takes a fixed number of poll steps and rendering walks the image
//! in square blocks, one batch per step, emitting final pixel blocks with
//! sequential `pixel_id`s. Failure switches in [`SimConfig`] drive the
//! error paths of the session core.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::{Address, Backend, Ident, Message, MessageClass, Reply};
use crate::error::codes;
use crate::options::{keys, Options, Value};
use crate::Result;

/// Behaviour switches for [`SimulatedBackend`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub parse_steps: u32,
    pub block_size: u32,
    pub blocks_per_step: u32,
    /// Reported back to the front end when parsing finishes.
    pub legacy_gamma_mode: Option<String>,
    pub fail_create_scene: bool,
    pub fail_parse: bool,
    pub fail_render: bool,
    pub fail_close_scene: bool,
    pub fail_close_view: bool,
    pub refuse_pause: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            parse_steps: 2,
            block_size: 8,
            blocks_per_step: 4,
            legacy_gamma_mode: None,
            fail_create_scene: false,
            fail_parse: false,
            fail_render: false,
            fail_close_scene: false,
            fail_close_view: false,
            refuse_pause: false,
        }
    }
}

impl SimConfig {
    pub fn parse_steps(mut self, steps: u32) -> Self {
        self.parse_steps = steps.max(1);
        self
    }

    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size.max(1);
        self
    }

    pub fn blocks_per_step(mut self, blocks: u32) -> Self {
        self.blocks_per_step = blocks.max(1);
        self
    }

    pub fn legacy_gamma_mode(mut self, mode: &str) -> Self {
        self.legacy_gamma_mode = Some(mode.to_owned());
        self
    }

    pub fn fail_create_scene(mut self) -> Self {
        self.fail_create_scene = true;
        self
    }

    pub fn fail_parse(mut self) -> Self {
        self.fail_parse = true;
        self
    }

    pub fn fail_render(mut self) -> Self {
        self.fail_render = true;
        self
    }

    pub fn fail_close(mut self) -> Self {
        self.fail_close_scene = true;
        self.fail_close_view = true;
        self
    }

    pub fn refuse_pause(mut self) -> Self {
        self.refuse_pause = true;
        self
    }
}

/// Shared record of every message the backend received.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Message>>>);

impl Journal {
    fn record(&self, msg: &Message) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(msg.clone());
    }

    pub fn entries(&self) -> Vec<Message> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, ident: Ident) -> usize {
        self.entries().iter().filter(|m| m.ident == ident).count()
    }

    pub fn last(&self, ident: Ident) -> Option<Message> {
        self.entries().into_iter().rev().find(|m| m.ident == ident)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Paused,
    Finished,
    Failed,
}

#[derive(Debug)]
struct SimScene {
    phase: Phase,
    remaining: u32,
    pending_files: usize,
    file_error: Option<String>,
}

#[derive(Debug)]
struct SimView {
    phase: Phase,
    width: u32,
    height: u32,
    next_block: i64,
    skip: BTreeSet<i64>,
    clock: f64,
    pixels_done: u64,
}

/// A backend that fakes parsing and rendering one step per empty poll.
#[derive(Debug)]
pub struct SimulatedBackend {
    address: Address,
    config: SimConfig,
    next_id: i64,
    scenes: BTreeMap<i64, SimScene>,
    views: BTreeMap<i64, SimView>,
    outbox: VecDeque<Message>,
    journal: Journal,
}

impl SimulatedBackend {
    pub fn new(address: Address, config: SimConfig) -> Self {
        Self {
            address,
            config,
            next_id: 1,
            scenes: BTreeMap::new(),
            views: BTreeMap::new(),
            outbox: VecDeque::new(),
            journal: Journal::default(),
        }
    }

    /// Handle for inspecting received messages after the backend moved.
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn emit(&mut self, class: MessageClass, ident: Ident, attrs: Options) {
        self.outbox
            .push_back(Message::with_attrs(class, ident, attrs).from_source(self.address));
    }

    fn scene_output(&mut self, scene: i64, ident: Ident, attrs: Options) {
        self.emit(MessageClass::SceneOutput, ident, attrs.with(keys::SCENE_ID, scene));
    }

    fn view_output(&mut self, view: i64, ident: Ident, attrs: Options) {
        self.emit(MessageClass::ViewOutput, ident, attrs.with(keys::VIEW_ID, view));
    }

    fn blocks_across(&self, view: &SimView) -> i64 {
        i64::from(view.width.div_ceil(self.config.block_size))
    }

    fn total_blocks(&self, view: &SimView) -> i64 {
        self.blocks_across(view) * i64::from(view.height.div_ceil(self.config.block_size))
    }

    fn block_message(&self, view_id: i64, view: &SimView, block: i64) -> (Message, u64) {
        let size = i64::from(self.config.block_size);
        let across = self.blocks_across(view);
        let left = (block % across) * size;
        let top = (block / across) * size;
        let right = (left + size).min(i64::from(view.width)) - 1;
        let bottom = (top + size).min(i64::from(view.height)) - 1;

        let span_x = f64::from(view.width.saturating_sub(1).max(1));
        let span_y = f64::from(view.height.saturating_sub(1).max(1));
        let mut pixels = Vec::new();
        for y in top..=bottom {
            for x in left..=right {
                pixels.push(Value::Float(x as f64 / span_x));
                pixels.push(Value::Float(y as f64 / span_y));
                pixels.push(Value::Float(view.clock.fract().abs()));
                pixels.push(Value::Float(0.0));
                pixels.push(Value::Float(0.0));
            }
        }
        let count = ((right - left + 1) * (bottom - top + 1)) as u64;

        let attrs = Options::new()
            .with(keys::VIEW_ID, view_id)
            .with(keys::PIXEL_ID, block)
            .with(keys::PIXEL_FINAL, true)
            .with(keys::PIXEL_SIZE, 1)
            .with(keys::LEFT, left)
            .with(keys::TOP, top)
            .with(keys::RIGHT, right)
            .with(keys::BOTTOM, bottom)
            .with(keys::PIXEL_BLOCK, pixels);
        let msg = Message::with_attrs(MessageClass::ViewImage, Ident::PixelBlockSet, attrs)
            .from_source(self.address);
        (msg, count)
    }

    fn step(&mut self) {
        let scene_ids: Vec<i64> = self.scenes.keys().copied().collect();
        for id in scene_ids {
            self.step_scene(id);
        }
        let view_ids: Vec<i64> = self.views.keys().copied().collect();
        for id in view_ids {
            self.step_view(id);
        }
    }

    fn step_scene(&mut self, id: i64) {
        let Some(scene) = self.scenes.get_mut(&id) else {
            return;
        };
        if scene.phase != Phase::Running || scene.pending_files > 0 {
            return;
        }
        scene.remaining = scene.remaining.saturating_sub(1);
        let remaining = scene.remaining;
        let file_error = scene.file_error.clone();
        if remaining > 0 {
            self.scene_output(id, Ident::Progress, Options::new().with(keys::ENGLISH_TEXT, "Parsing"));
            return;
        }

        let failure = if self.config.fail_parse {
            Some("Parse Error: simulated parser failure".to_owned())
        } else {
            file_error
        };
        match failure {
            Some(text) => {
                self.set_scene_phase(id, Phase::Failed);
                self.scene_output(id, Ident::Failed, Options::new().with(keys::ENGLISH_TEXT, text));
            }
            None => {
                self.set_scene_phase(id, Phase::Finished);
                let mut attrs = Options::new();
                if let Some(mode) = &self.config.legacy_gamma_mode {
                    attrs.set(keys::LEGACY_GAMMA_MODE, mode.as_str());
                }
                self.scene_output(id, Ident::Done, attrs);
            }
        }
    }

    fn set_scene_phase(&mut self, id: i64, phase: Phase) {
        if let Some(scene) = self.scenes.get_mut(&id) {
            scene.phase = phase;
        }
    }

    fn step_view(&mut self, id: i64) {
        let Some(view) = self.views.get(&id) else {
            return;
        };
        if view.phase != Phase::Running {
            return;
        }
        let total = self.total_blocks(view);
        let total_pixels = u64::from(view.width) * u64::from(view.height);
        let mut block = view.next_block;
        let mut emitted = 0;
        let mut rendered_pixels = 0;
        let mut produced = Vec::new();
        while emitted < self.config.blocks_per_step && block < total {
            if !view.skip.contains(&block) {
                let (msg, count) = self.block_message(id, view, block);
                produced.push(msg);
                rendered_pixels += count;
                emitted += 1;
            }
            block += 1;
        }

        let finished = block >= total;
        let pixels_done = view.pixels_done + rendered_pixels;
        if let Some(view) = self.views.get_mut(&id) {
            view.next_block = block;
            view.pixels_done = pixels_done;
            if finished {
                view.phase = if self.config.fail_render {
                    Phase::Failed
                } else {
                    Phase::Finished
                };
            }
        }
        self.outbox.extend(produced);
        self.view_output(
            id,
            Ident::Progress,
            Options::new()
                .with(keys::PIXELS_COMPLETED, pixels_done as i64)
                .with(keys::PIXELS_TOTAL, total_pixels as i64),
        );

        if finished {
            if self.config.fail_render {
                self.view_output(
                    id,
                    Ident::Failed,
                    Options::new().with(keys::ENGLISH_TEXT, "Render error: simulated renderer failure"),
                );
            } else {
                self.view_output(id, Ident::Statistics, Options::new().with(keys::ENGLISH_TEXT, "Render statistics"));
                self.view_output(id, Ident::Done, Options::new());
            }
        }
    }

    fn transition_scene(&mut self, msg: &Message, from: Phase, to: Phase) -> Reply {
        if self.config.refuse_pause && matches!(msg.ident, Ident::PauseParser) {
            return Reply::error(codes::NOT_NOW, "pause refused");
        }
        let id = msg.attrs.try_get_int(keys::SCENE_ID, -1);
        match self.scenes.get_mut(&id) {
            Some(scene) if scene.phase == from => {
                scene.phase = to;
                Reply::done(Options::new())
            }
            _ => Reply::error(codes::NOT_NOW, "scene is not in the expected state"),
        }
    }

    fn transition_view(&mut self, msg: &Message, from: Phase, to: Phase) -> Reply {
        if self.config.refuse_pause && matches!(msg.ident, Ident::PauseRender) {
            return Reply::error(codes::NOT_NOW, "pause refused");
        }
        let id = msg.attrs.try_get_int(keys::VIEW_ID, -1);
        match self.views.get_mut(&id) {
            Some(view) if view.phase == from => {
                view.phase = to;
                Reply::done(Options::new())
            }
            _ => Reply::error(codes::NOT_NOW, "view is not in the expected state"),
        }
    }

    fn stop_scene(&mut self, msg: &Message) -> Reply {
        let id = msg.attrs.try_get_int(keys::SCENE_ID, -1);
        match self.scenes.get_mut(&id) {
            Some(scene) if matches!(scene.phase, Phase::Running | Phase::Paused) => {
                scene.phase = Phase::Failed;
                self.scene_output(
                    id,
                    Ident::Failed,
                    Options::new().with(keys::ENGLISH_TEXT, "Parse halted by user"),
                );
                Reply::done(Options::new())
            }
            _ => Reply::error(codes::NOT_NOW, "scene is not parsing"),
        }
    }

    fn stop_view(&mut self, msg: &Message) -> Reply {
        let id = msg.attrs.try_get_int(keys::VIEW_ID, -1);
        match self.views.get_mut(&id) {
            Some(view) if matches!(view.phase, Phase::Running | Phase::Paused) => {
                view.phase = Phase::Failed;
                self.view_output(
                    id,
                    Ident::Failed,
                    Options::new().with(keys::ENGLISH_TEXT, "Render halted by user"),
                );
                Reply::done(Options::new())
            }
            _ => Reply::error(codes::NOT_NOW, "view is not rendering"),
        }
    }

    fn start_parser(&mut self, msg: &Message) {
        let id = msg.attrs.try_get_int(keys::SCENE_ID, -1);
        let includes: Vec<String> = msg
            .attrs
            .get_list(keys::INCLUDE_FILES)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default();
        let steps = self.config.parse_steps;
        let Some(scene) = self.scenes.get_mut(&id) else {
            warn!(scene = id, "start parser for unknown scene");
            return;
        };
        scene.phase = Phase::Running;
        scene.remaining = steps;
        scene.pending_files = includes.len();
        scene.file_error = None;
        for name in includes {
            self.emit(
                MessageClass::FileAccess,
                Ident::FindFile,
                Options::new()
                    .with(keys::SCENE_ID, id)
                    .with(keys::FILE_NAME, name),
            );
        }
    }

    fn start_render(&mut self, msg: &Message) {
        let id = msg.attrs.try_get_int(keys::VIEW_ID, -1);
        let Some(view) = self.views.get_mut(&id) else {
            warn!(view = id, "start render for unknown view");
            return;
        };
        view.width = msg.attrs.try_get_int(keys::WIDTH, i64::from(view.width)).max(1) as u32;
        view.height = msg.attrs.try_get_int(keys::HEIGHT, i64::from(view.height)).max(1) as u32;
        view.next_block = msg.attrs.try_get_int(keys::PIXEL_ID, 0).max(0);
        view.skip = msg.attrs.get_int_list(keys::PIXEL_SKIP_LIST).into_iter().collect();
        view.clock = msg.attrs.try_get_float(keys::CLOCK, 0.0);
        view.pixels_done = 0;
        view.phase = Phase::Running;
    }

    fn file_resolved(&mut self, msg: &Message) {
        let id = msg.attrs.try_get_int(keys::SCENE_ID, -1);
        let name = msg.attrs.try_get_str(keys::FILE_NAME, "").to_owned();
        let resolved = msg.attrs.try_get_str(keys::RESOLVED_FILE, "");
        if let Some(scene) = self.scenes.get_mut(&id) {
            scene.pending_files = scene.pending_files.saturating_sub(1);
            if resolved.is_empty() && scene.file_error.is_none() {
                scene.file_error = Some(format!("Cannot open include file '{name}'"));
            }
        }
    }
}

impl Backend for SimulatedBackend {
    fn address(&self) -> Address {
        self.address
    }

    fn request(&mut self, msg: Message) -> Result<Reply> {
        self.journal.record(&msg);
        debug!(ident = ?msg.ident, "simulated backend request");
        let reply = match msg.ident {
            Ident::CreateScene if self.config.fail_create_scene => {
                Reply::error(codes::GENERIC, "Cannot create scene")
            }
            Ident::CreateScene => {
                let id = self.allocate_id();
                self.scenes.insert(
                    id,
                    SimScene {
                        phase: Phase::Idle,
                        remaining: 0,
                        pending_files: 0,
                        file_error: None,
                    },
                );
                Reply::done(Options::new().with(keys::SCENE_ID, id))
            }
            Ident::CloseScene if self.config.fail_close_scene => {
                Reply::error(codes::GENERIC, "Cannot close scene")
            }
            Ident::CloseScene => {
                self.scenes.remove(&msg.attrs.try_get_int(keys::SCENE_ID, -1));
                Reply::done(Options::new())
            }
            Ident::PauseParser => self.transition_scene(&msg, Phase::Running, Phase::Paused),
            Ident::ResumeParser => self.transition_scene(&msg, Phase::Paused, Phase::Running),
            Ident::StopParser => self.stop_scene(&msg),
            Ident::CreateView => {
                let scene = msg.attrs.try_get_int(keys::SCENE_ID, -1);
                match self.scenes.get(&scene) {
                    Some(s) if s.phase == Phase::Finished => {
                        let id = self.allocate_id();
                        self.views.insert(
                            id,
                            SimView {
                                phase: Phase::Idle,
                                width: msg.attrs.try_get_int(keys::WIDTH, 160).max(1) as u32,
                                height: msg.attrs.try_get_int(keys::HEIGHT, 120).max(1) as u32,
                                next_block: 0,
                                skip: BTreeSet::new(),
                                clock: 0.0,
                                pixels_done: 0,
                            },
                        );
                        Reply::done(Options::new().with(keys::VIEW_ID, id))
                    }
                    _ => Reply::error(codes::NOT_NOW, "scene has not finished parsing"),
                }
            }
            Ident::CloseView if self.config.fail_close_view => {
                Reply::error(codes::GENERIC, "Cannot close view")
            }
            Ident::CloseView => {
                self.views.remove(&msg.attrs.try_get_int(keys::VIEW_ID, -1));
                Reply::done(Options::new())
            }
            Ident::PauseRender => self.transition_view(&msg, Phase::Running, Phase::Paused),
            Ident::ResumeRender => self.transition_view(&msg, Phase::Paused, Phase::Running),
            Ident::StopRender => self.stop_view(&msg),
            other => Reply::error(
                codes::CANNOT_HANDLE_REQUEST,
                format!("{other:?} cannot be requested"),
            ),
        };
        Ok(reply)
    }

    fn post(&mut self, msg: Message) -> Result<()> {
        self.journal.record(&msg);
        match (msg.class, msg.ident) {
            (_, Ident::StartParser) => self.start_parser(&msg),
            (_, Ident::StartRender) => self.start_render(&msg),
            (MessageClass::FileAccess, Ident::Done) => self.file_resolved(&msg),
            (class, ident) => debug!(?class, ?ident, "simulated backend ignores message"),
        }
        Ok(())
    }

    fn poll(&mut self) -> Option<Message> {
        if let Some(msg) = self.outbox.pop_front() {
            return Some(msg);
        }
        self.step();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(backend: &mut SimulatedBackend, steps: usize) -> Vec<Message> {
        let mut out = Vec::new();
        for _ in 0..steps {
            while let Some(msg) = backend.poll() {
                out.push(msg);
            }
        }
        out
    }

    fn create_and_parse(backend: &mut SimulatedBackend) -> i64 {
        let reply = backend
            .request(Message::new(MessageClass::BackendControl, Ident::CreateScene))
            .unwrap();
        let scene = reply.attrs.try_get_int(keys::SCENE_ID, -1);
        backend
            .post(Message::with_attrs(
                MessageClass::SceneControl,
                Ident::StartParser,
                Options::new().with(keys::SCENE_ID, scene),
            ))
            .unwrap();
        scene
    }

    #[test]
    fn parse_takes_configured_steps() {
        let mut backend = SimulatedBackend::new(Address(1), SimConfig::default().parse_steps(3));
        create_and_parse(&mut backend);
        let first = drain(&mut backend, 2);
        assert!(first.iter().all(|m| m.ident != Ident::Done));
        let rest = drain(&mut backend, 2);
        assert!(rest.iter().any(|m| m.ident == Ident::Done && m.class == MessageClass::SceneOutput));
    }

    #[test]
    fn render_honours_serial_and_skip_list() {
        let mut backend = SimulatedBackend::new(
            Address(1),
            SimConfig::default().parse_steps(1).block_size(4).blocks_per_step(100),
        );
        let scene = create_and_parse(&mut backend);
        drain(&mut backend, 2);

        let reply = backend
            .request(Message::with_attrs(
                MessageClass::SceneControl,
                Ident::CreateView,
                Options::new().with(keys::SCENE_ID, scene).with(keys::WIDTH, 8).with(keys::HEIGHT, 8),
            ))
            .unwrap();
        let view = reply.attrs.try_get_int(keys::VIEW_ID, -1);
        backend
            .post(Message::with_attrs(
                MessageClass::ViewControl,
                Ident::StartRender,
                Options::new()
                    .with(keys::VIEW_ID, view)
                    .with(keys::PIXEL_ID, 1)
                    .with(keys::PIXEL_SKIP_LIST, vec![Value::Int(3)]),
            ))
            .unwrap();

        let out = drain(&mut backend, 2);
        let ids: Vec<i64> = out
            .iter()
            .filter(|m| m.ident == Ident::PixelBlockSet)
            .map(|m| m.attrs.try_get_int(keys::PIXEL_ID, -1))
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(out.iter().any(|m| m.ident == Ident::Done && m.class == MessageClass::ViewOutput));
    }

    #[test]
    fn pause_outside_parsing_is_not_now() {
        let mut backend = SimulatedBackend::new(Address(1), SimConfig::default());
        let reply = backend
            .request(Message::with_attrs(
                MessageClass::SceneControl,
                Ident::PauseParser,
                Options::new().with(keys::SCENE_ID, 99),
            ))
            .unwrap();
        assert_eq!(reply.error_code(), codes::NOT_NOW);
    }
}
