//! Scene and view lifecycles on top of the backend request protocol.
//!
//! [`SessionManager`] keeps a table of scene records and a table of view
//! records. Each view record names its scene by id and is checked for
//! existence before use. Backend output is pulled with
//! [`SessionManager::pump`], which updates lifecycle states, feeds image
//! messages into the view targets and the state file, answers file lookups,
//! and returns everything meant for the user as [`Notice`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::backend::{Backend, Ident, Message, MessageClass, Reply, SceneId, ViewId};
use crate::backup::{backup_path, BackupStore, ResumeState};
use crate::error::codes;
use crate::files::{find_file, is_plain_file_name, AccessPolicy};
use crate::options::{keys, parse_switch, Options, Value};
use crate::raster::{Display, DisplayFactory, ImageBuffer, SceneGamma, ViewTarget};
use crate::{FrontendError, Result};

/// Upper bound on backend messages handled by one [`SessionManager::pump`].
const MAX_MESSAGES_PER_PUMP: usize = 4096;

const APPEND_BANNER: &str = "\n\
==============================================================================\n\
=                       Appending to stream output file                      =\n\
==============================================================================";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneState {
    Unknown,
    Created,
    Parsing,
    Paused,
    Stopping,
    Ready,
    Viewing,
    Closing,
    Failed,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Unknown,
    Created,
    Rendering,
    Paused,
    Stopping,
    Rendered,
    Closing,
    Failed,
    Invalid,
}

/// Outcome of a request the backend may decline with "not now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Applied,
    /// The backend answered "not now"; nothing changed.
    Deferred,
}

/// Text output streams of a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Banner,
    Status,
    Debug,
    Fatal,
    Render,
    Statistics,
    Warning,
    All,
}

impl Stream {
    const COUNT: usize = 8;

    fn index(self) -> usize {
        self as usize
    }

    /// Stream that backend output with `ident` is written to.
    pub fn for_ident(ident: Ident) -> Option<Self> {
        match ident {
            Ident::Banner => Some(Self::Banner),
            Ident::Warning => Some(Self::Warning),
            Ident::Error | Ident::FatalError => Some(Self::Fatal),
            Ident::DebugInfo => Some(Self::Debug),
            Ident::Statistics => Some(Self::Statistics),
            _ => None,
        }
    }
}

/// Stream file options: option key, stream, file name used for `true`.
const STREAM_FILES: [(&str, Stream, &str); 6] = [
    (keys::DEBUG_FILE, Stream::Debug, "debug.out"),
    (keys::FATAL_FILE, Stream::Fatal, "fatal.out"),
    (keys::RENDER_FILE, Stream::Render, "render.out"),
    (keys::STATISTICS_FILE, Stream::Statistics, "stats.out"),
    (keys::WARNING_FILE, Stream::Warning, "warning.out"),
    (keys::ALL_FILE, Stream::All, "alltext.out"),
];

/// Something the user should see, produced while pumping backend output.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Stream { stream: Stream, text: String, echo: bool },
    ParserOptions { attrs: Options, echo: bool },
    RenderOptions { attrs: Options, echo: bool },
    Progress { attrs: Options, echo: bool },
}

#[derive(Debug)]
struct StreamRouting {
    console: [bool; Stream::COUNT],
    files: Vec<Option<File>>,
}

impl StreamRouting {
    fn from_options(opts: &Options, output_path: &Path, policy: &dyn AccessPolicy) -> Result<Self> {
        let mut console = [true; Stream::COUNT];
        console[Stream::All.index()] = false;
        let configurable = [
            (keys::DEBUG_CONSOLE, Stream::Debug),
            (keys::FATAL_CONSOLE, Stream::Fatal),
            (keys::RENDER_CONSOLE, Stream::Render),
            (keys::STATISTICS_CONSOLE, Stream::Statistics),
            (keys::WARNING_CONSOLE, Stream::Warning),
        ];
        if let Some(all) = opts.get(keys::ALL_CONSOLE).and_then(Value::as_bool) {
            for (_, stream) in configurable {
                console[stream.index()] = all;
            }
        } else {
            for (key, stream) in configurable {
                if let Some(on) = opts.get(key).and_then(Value::as_bool) {
                    console[stream.index()] = on;
                }
            }
        }

        let append = opts.try_get_bool(keys::CONTINUE_TRACE, false)
            || opts.try_get_bool(keys::APPEND_CONSOLE_FILES, false);
        let mut files: Vec<Option<File>> = (0..Stream::COUNT).map(|_| None).collect();
        for (key, stream, default_name) in STREAM_FILES {
            let name = match opts.get(key) {
                None | Some(Value::Bool(false)) => continue,
                Some(Value::Bool(true)) => default_name.to_owned(),
                Some(Value::String(text)) => match parse_switch(text) {
                    Some(true) => default_name.to_owned(),
                    Some(false) => continue,
                    None => text.clone(),
                },
                Some(other) => {
                    return Err(FrontendError::Param(format!("Invalid stream file name for '{key}': {other:?}")))
                }
            };
            if name.is_empty() {
                continue;
            }
            if !is_plain_file_name(&name) {
                return Err(FrontendError::Param(
                    "Stream output files must reside in same directory as image output file.".into(),
                ));
            }
            let path = output_path.join(&name);
            if !policy.allow_write(&path) {
                return Err(FrontendError::CannotOpenFile(format!(
                    "IO Restrictions prohibit write access to '{}'",
                    path.display()
                )));
            }
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&path)
                .map_err(|err| FrontendError::CannotOpenFile(format!("Cannot open '{}': {err}", path.display())))?;
            if append && stream != Stream::Debug {
                writeln!(file, "{APPEND_BANNER}")?;
            }
            files[stream.index()] = Some(file);
        }
        Ok(Self { console, files })
    }

    /// Writes to the stream's own file and to the all-text file.
    fn write(&mut self, stream: Stream, text: &str) {
        let targets: &[Stream] = if stream == Stream::All {
            &[Stream::All]
        } else {
            &[stream, Stream::All]
        };
        for &target in targets {
            if let Some(file) = self.files[target.index()].as_mut() {
                if let Err(err) = writeln!(file, "{text}") {
                    warn!(%err, ?target, "stream file write failed");
                }
            }
        }
    }
}

#[derive(Debug)]
struct SceneRecord {
    state: SceneState,
    scene_dir: PathBuf,
    output_path: PathBuf,
    search_paths: Vec<PathBuf>,
    verbose: bool,
    routing: StreamRouting,
    /// Backward compatibility attributes from the parser's completion.
    compat: Options,
    gamma: Option<SceneGamma>,
    views: BTreeSet<ViewId>,
}

#[derive(Debug)]
struct ViewRecord {
    scene: SceneId,
    state: ViewState,
    target: ViewTarget,
    backup: Option<BackupStore>,
}

/// Lifecycle bookkeeping for the scenes and views of one backend.
pub struct SessionManager {
    backend: Box<dyn Backend>,
    policy: Box<dyn AccessPolicy>,
    scenes: BTreeMap<SceneId, SceneRecord>,
    views: BTreeMap<ViewId, ViewRecord>,
    // Last scene and view dropped after a failed close; reported as Invalid.
    invalid_scene: Option<SceneId>,
    invalid_view: Option<ViewId>,
    notices: Vec<Notice>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("address", &self.backend.address())
            .field("scenes", &self.scenes)
            .field("views", &self.views)
            .finish_non_exhaustive()
    }
}

fn tolerate(reply: Reply) -> Result<Control> {
    if reply.is_done() {
        return Ok(Control::Applied);
    }
    match reply.error_code() {
        codes::NO_ERROR => Ok(Control::Applied),
        codes::NOT_NOW => Ok(Control::Deferred),
        _ => Err(reply.into_error()),
    }
}

fn with_id(opts: &Options, key: &str, id: i64) -> Options {
    let mut attrs = opts.clone();
    attrs.set(key, id);
    attrs
}

fn id_only(key: &str, id: i64) -> Options {
    Options::new().with(key, id)
}

impl SessionManager {
    pub fn new(backend: Box<dyn Backend>, policy: Box<dyn AccessPolicy>) -> Self {
        Self {
            backend,
            policy,
            scenes: BTreeMap::new(),
            views: BTreeMap::new(),
            invalid_scene: None,
            invalid_view: None,
            notices: Vec::new(),
        }
    }

    pub fn policy(&self) -> &dyn AccessPolicy {
        self.policy.as_ref()
    }

    pub fn scene_state(&self, sid: SceneId) -> SceneState {
        match self.scenes.get(&sid) {
            Some(scene) => scene.state,
            None if self.invalid_scene == Some(sid) => SceneState::Invalid,
            None => SceneState::Unknown,
        }
    }

    pub fn view_state(&self, vid: ViewId) -> ViewState {
        match self.views.get(&vid) {
            Some(view) => view.state,
            None if self.invalid_view == Some(vid) => ViewState::Invalid,
            None => ViewState::Unknown,
        }
    }

    pub fn image(&self, vid: ViewId) -> Option<&ImageBuffer> {
        self.views.get(&vid).and_then(|view| view.target.image.as_ref())
    }

    pub fn display_mut(&mut self, vid: ViewId) -> Option<&mut (dyn Display + 'static)> {
        self.views.get_mut(&vid).and_then(|view| view.target.display.as_deref_mut())
    }

    /// Search paths used to resolve files for `sid`.
    pub fn search_paths(&self, sid: SceneId) -> Vec<PathBuf> {
        self.scenes
            .get(&sid)
            .map(|scene| {
                std::iter::once(scene.scene_dir.clone())
                    .chain(scene.search_paths.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn scene_mut(&mut self, sid: SceneId, operation: &'static str) -> Result<&mut SceneRecord> {
        self.scenes
            .get_mut(&sid)
            .ok_or_else(|| FrontendError::not_now(operation, SceneState::Unknown))
    }

    fn view_mut(&mut self, vid: ViewId, operation: &'static str) -> Result<&mut ViewRecord> {
        self.views
            .get_mut(&vid)
            .ok_or_else(|| FrontendError::not_now(operation, ViewState::Unknown))
    }

    /// Creates a scene on the backend and records how its output is routed.
    ///
    /// When `output_path` is empty it is derived from the directory of
    /// `output_file` and written back into `opts`.
    pub fn create_scene(&mut self, opts: &mut Options) -> Result<SceneId> {
        let reply = self
            .backend
            .request(Message::new(MessageClass::BackendControl, Ident::CreateScene))?;
        if !reply.is_done() {
            return Err(reply.into_error());
        }
        let sid = SceneId {
            address: self.backend.address(),
            id: reply.attrs.try_get_int(keys::SCENE_ID, -1),
        };

        match self.scene_record(opts) {
            Ok(record) => {
                info!(scene = sid.id, "scene created");
                self.scenes.insert(sid, record);
                Ok(sid)
            }
            Err(err) => {
                let close = Message::with_attrs(
                    MessageClass::BackendControl,
                    Ident::CloseScene,
                    id_only(keys::SCENE_ID, sid.id),
                );
                if let Err(close_err) = self.backend.request(close) {
                    debug!(%close_err, "closing half-created scene failed");
                }
                Err(err)
            }
        }
    }

    fn scene_record(&self, opts: &mut Options) -> Result<SceneRecord> {
        let scene_dir = Path::new(opts.try_get_str(keys::INPUT_FILE, ""))
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut output_path = PathBuf::from(opts.try_get_str(keys::OUTPUT_PATH, ""));
        if output_path.as_os_str().is_empty() {
            output_path = Path::new(opts.try_get_str(keys::OUTPUT_FILE, ""))
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            if !output_path.as_os_str().is_empty() {
                opts.set(keys::OUTPUT_PATH, output_path.to_string_lossy().into_owned());
            }
        }

        let routing = StreamRouting::from_options(opts, &output_path, self.policy.as_ref())?;

        let search_paths = opts
            .get_list(keys::LIBRARY_PATH)
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_str)
            .filter(|path| !path.is_empty())
            .map(|path| {
                let mut path = path.to_owned();
                if !path.ends_with('/') && !path.ends_with(std::path::MAIN_SEPARATOR) {
                    path.push(std::path::MAIN_SEPARATOR);
                }
                PathBuf::from(path)
            })
            .collect();

        Ok(SceneRecord {
            state: SceneState::Created,
            scene_dir,
            output_path,
            search_paths,
            verbose: opts.try_get_bool(keys::VERBOSE, true),
            routing,
            compat: Options::new(),
            gamma: None,
            views: BTreeSet::new(),
        })
    }

    /// Asks the backend to start parsing. Does not wait for it.
    pub fn start_parser(&mut self, sid: SceneId, opts: &Options) -> Result<()> {
        let scene = self.scene_mut(sid, "start parser")?;
        if scene.state != SceneState::Created {
            return Err(FrontendError::not_now("start parser", scene.state));
        }
        let echo = scene.verbose;
        self.backend.post(Message::with_attrs(
            MessageClass::SceneControl,
            Ident::StartParser,
            with_id(opts, keys::SCENE_ID, sid.id),
        ))?;
        self.scene_mut(sid, "start parser")?.state = SceneState::Parsing;
        self.notices.push(Notice::ParserOptions {
            attrs: opts.clone(),
            echo,
        });
        Ok(())
    }

    fn scene_request(&mut self, sid: SceneId, ident: Ident) -> Result<Control> {
        let reply = self.backend.request(Message::with_attrs(
            MessageClass::SceneControl,
            ident,
            id_only(keys::SCENE_ID, sid.id),
        ))?;
        tolerate(reply)
    }

    pub fn pause_parser(&mut self, sid: SceneId) -> Result<Control> {
        let state = self.scene_state(sid);
        if state != SceneState::Parsing {
            return Err(FrontendError::not_now("pause parser", state));
        }
        let control = self.scene_request(sid, Ident::PauseParser)?;
        if control == Control::Applied {
            self.scene_mut(sid, "pause parser")?.state = SceneState::Paused;
        }
        Ok(control)
    }

    pub fn resume_parser(&mut self, sid: SceneId) -> Result<Control> {
        let state = self.scene_state(sid);
        if state != SceneState::Paused {
            return Err(FrontendError::not_now("resume parser", state));
        }
        let control = self.scene_request(sid, Ident::ResumeParser)?;
        if control == Control::Applied {
            self.scene_mut(sid, "resume parser")?.state = SceneState::Parsing;
        }
        Ok(control)
    }

    /// Marks the scene as stopping before the request goes out.
    pub fn stop_parser(&mut self, sid: SceneId) -> Result<Control> {
        let scene = self.scene_mut(sid, "stop parser")?;
        if !matches!(scene.state, SceneState::Parsing | SceneState::Paused) {
            return Err(FrontendError::not_now("stop parser", scene.state));
        }
        scene.state = SceneState::Stopping;
        self.scene_request(sid, Ident::StopParser)
    }

    /// Closes a scene that has no open views.
    ///
    /// A backend failure leaves the scene [`SceneState::Invalid`] and drops
    /// its record.
    pub fn close_scene(&mut self, sid: SceneId) -> Result<()> {
        let Some(scene) = self.scenes.get_mut(&sid) else {
            return Ok(());
        };
        if !matches!(scene.state, SceneState::Created | SceneState::Ready | SceneState::Failed) {
            return Err(FrontendError::not_now("close scene", scene.state));
        }
        if !scene.views.is_empty() {
            return Err(FrontendError::not_now("close scene", "views still open"));
        }
        scene.state = SceneState::Closing;

        let result = self
            .backend
            .request(Message::with_attrs(
                MessageClass::BackendControl,
                Ident::CloseScene,
                id_only(keys::SCENE_ID, sid.id),
            ))
            .and_then(|reply| if reply.is_done() { Ok(()) } else { Err(reply.into_error()) });
        self.scenes.remove(&sid);
        match result {
            Ok(()) => {
                debug!(scene = sid.id, "scene closed");
                Ok(())
            }
            Err(err) => {
                warn!(%err, scene = sid.id, "closing scene failed; scene is invalid");
                self.invalid_scene = Some(sid);
                Err(err)
            }
        }
    }

    /// Creates a view of a parsed scene.
    ///
    /// The display gamma is negotiated here; `opts` receives the working and
    /// file gamma that go with it. A supplied `image` is reused only if its
    /// size matches the requested resolution.
    pub fn create_view(
        &mut self,
        sid: SceneId,
        opts: &mut Options,
        image: Option<ImageBuffer>,
        display_factory: Option<&mut DisplayFactory>,
    ) -> Result<ViewId> {
        let scene = self.scene_mut(sid, "create view")?;
        if scene.state != SceneState::Ready {
            return Err(FrontendError::not_now("create view", scene.state));
        }
        let width = u32::try_from(opts.try_get_int(keys::WIDTH, 160).max(1))
            .map_err(|_| FrontendError::Param("Image width is out of range.".into()))?;
        let height = u32::try_from(opts.try_get_int(keys::HEIGHT, 120).max(1))
            .map_err(|_| FrontendError::Param("Image height is out of range.".into()))?;

        let mut gamma = match scene.gamma.take() {
            Some(gamma) => gamma,
            None => SceneGamma::from_parser_attrs(&scene.compat)?,
        };
        let negotiated = gamma.negotiate(opts);
        scene.gamma = Some(gamma);
        let (display_gamma, advisory) = negotiated?;
        if let Some(text) = advisory {
            self.output(sid, Stream::Warning, text);
        }

        let reply = self.backend.request(Message::with_attrs(
            MessageClass::SceneControl,
            Ident::CreateView,
            with_id(opts, keys::SCENE_ID, sid.id),
        ))?;
        if !reply.is_done() {
            return Err(reply.into_error());
        }
        let vid = ViewId {
            address: sid.address,
            id: reply.attrs.try_get_int(keys::VIEW_ID, -1),
        };

        let image = if opts.try_get_bool(keys::OUTPUT_TO_FILE, true) {
            match image {
                Some(img) if img.width() != width || img.height() != height => {
                    let close = Message::with_attrs(
                        MessageClass::SceneControl,
                        Ident::CloseView,
                        id_only(keys::VIEW_ID, vid.id),
                    );
                    if let Err(err) = self.backend.request(close) {
                        debug!(%err, "closing rejected view failed");
                    }
                    return Err(FrontendError::Param(
                        "Invalid partial rendered image. Image size does not match!".into(),
                    ));
                }
                Some(img) => Some(img),
                None => Some(ImageBuffer::new(width, height)),
            }
        } else {
            None
        };
        let display = match display_factory {
            Some(factory) if opts.try_get_bool(keys::DISPLAY, true) => Some(factory(width, height)),
            _ => None,
        };
        let mut target = ViewTarget::new(width, height, image, display, display_gamma);
        target.greyscale = opts.try_get_bool(keys::GRAYSCALE_OUTPUT, false);

        self.views.insert(
            vid,
            ViewRecord {
                scene: sid,
                state: ViewState::Created,
                target,
                backup: None,
            },
        );
        let scene = self.scene_mut(sid, "create view")?;
        scene.views.insert(vid);
        scene.state = SceneState::Viewing;
        info!(scene = sid.id, view = vid.id, width, height, "view created");
        Ok(vid)
    }

    /// Closes a view. The scene becomes ready again once its last view is gone.
    ///
    /// A backend failure leaves the view [`ViewState::Invalid`] and drops its
    /// record, so the scene can still be closed.
    pub fn close_view(&mut self, vid: ViewId) -> Result<()> {
        let Some(view) = self.views.get(&vid) else {
            return Ok(());
        };
        if !matches!(view.state, ViewState::Created | ViewState::Rendered | ViewState::Failed) {
            return Err(FrontendError::not_now("close view", view.state));
        }

        let result = self
            .backend
            .request(Message::with_attrs(
                MessageClass::SceneControl,
                Ident::CloseView,
                id_only(keys::VIEW_ID, vid.id),
            ))
            .and_then(|reply| if reply.is_done() { Ok(()) } else { Err(reply.into_error()) });
        if let Some(view) = self.views.remove(&vid) {
            if let Some(scene) = self.scenes.get_mut(&view.scene) {
                scene.views.remove(&vid);
                if scene.views.is_empty() {
                    scene.state = SceneState::Ready;
                }
            }
        }
        match result {
            Ok(()) => {
                debug!(view = vid.id, "view closed");
                Ok(())
            }
            Err(err) => {
                warn!(%err, view = vid.id, "closing view failed; view is invalid");
                self.invalid_view = Some(vid);
                Err(err)
            }
        }
    }

    /// Starts rendering a view.
    ///
    /// With `continue_trace` set, a finished output image ends the call with
    /// [`FrontendError::ImageAlreadyRendered`]; otherwise the state file of
    /// the previous attempt is replayed and `pixel_id` / `pixel_skip_list`
    /// are set in `opts` so the backend skips completed blocks. When there is
    /// nothing to continue from, a fresh state file is created if backups
    /// are enabled and the output is a real file.
    pub fn start_render(&mut self, vid: ViewId, opts: &mut Options) -> Result<()> {
        let view = self.view_mut(vid, "start render")?;
        if !matches!(view.state, ViewState::Created | ViewState::Rendered) {
            return Err(FrontendError::not_now("start render", view.state));
        }
        let scene = view.scene;

        let output_path = PathBuf::from(opts.try_get_str(keys::OUTPUT_PATH, ""));
        let filename = opts.try_get_str(keys::OUTPUT_FILE, "").to_owned();
        let to_stdout = matches!(filename.as_str(), "-" | "stdout" | "stderr");
        let backup_trace = opts.try_get_bool(keys::BACKUP_TRACE, opts.try_get_bool(keys::OUTPUT_TO_FILE, true));
        let mut continued = false;

        if opts.try_get_bool(keys::CONTINUE_TRACE, false) {
            if to_stdout && backup_trace {
                return Err(FrontendError::CannotHandleRequest(
                    "Cannot continue trace if output to STDOUT or STDERR is specified".into(),
                ));
            }
            let rendered = !filename.is_empty()
                && std::fs::metadata(&filename).map(|meta| meta.len() > 0).unwrap_or(false);
            if rendered {
                return Err(FrontendError::ImageAlreadyRendered);
            }
            if backup_trace {
                match self.continue_backup(vid, opts, &output_path) {
                    Ok(Some(resume)) => {
                        opts.set(keys::PIXEL_ID, resume.next_serial);
                        if !resume.skip.is_empty() {
                            let skip: Vec<Value> = resume.skip.iter().copied().map(Value::Int).collect();
                            opts.set(keys::PIXEL_SKIP_LIST, skip);
                        }
                        info!(
                            view = vid.id,
                            next = resume.next_serial,
                            skipped = resume.skip.len(),
                            "continuing from render state file"
                        );
                        continued = true;
                    }
                    Ok(None) => debug!(view = vid.id, "no render state file to continue from"),
                    Err(err) => {
                        warn!(%err, view = vid.id, "render state file unusable; starting over");
                        self.view_mut(vid, "start render")?.backup = None;
                    }
                }
            }
        }

        if !continued && !to_stdout && backup_trace {
            let path = backup_path(opts, &output_path);
            let output = (!filename.is_empty()).then(|| Path::new(&filename));
            let store = BackupStore::create_new(&path, output, self.policy.as_ref())?;
            self.view_mut(vid, "start render")?.backup = Some(store);
        }

        self.backend.post(Message::with_attrs(
            MessageClass::ViewControl,
            Ident::StartRender,
            with_id(opts, keys::VIEW_ID, vid.id),
        ))?;
        self.view_mut(vid, "start render")?.state = ViewState::Rendering;
        let echo = self.scenes.get(&scene).is_some_and(|s| s.verbose);
        self.notices.push(Notice::RenderOptions {
            attrs: opts.clone(),
            echo,
        });
        Ok(())
    }

    fn continue_backup(&mut self, vid: ViewId, opts: &Options, output_path: &Path) -> Result<Option<ResumeState>> {
        let path = backup_path(opts, output_path);
        let policy = self.policy.as_ref();
        let view = self
            .views
            .get_mut(&vid)
            .ok_or_else(|| FrontendError::not_now("continue render", ViewState::Unknown))?;
        view.backup = None;
        let Some(resume) = BackupStore::replay(&path, policy, |msg| view.target.apply(msg))? else {
            return Ok(None);
        };
        view.backup = Some(BackupStore::reopen(&path, &resume, policy)?);
        Ok(Some(resume))
    }

    fn view_request(&mut self, vid: ViewId, ident: Ident) -> Result<Control> {
        let reply = self.backend.request(Message::with_attrs(
            MessageClass::ViewControl,
            ident,
            id_only(keys::VIEW_ID, vid.id),
        ))?;
        tolerate(reply)
    }

    pub fn pause_render(&mut self, vid: ViewId) -> Result<Control> {
        let state = self.view_state(vid);
        if state != ViewState::Rendering {
            return Err(FrontendError::not_now("pause render", state));
        }
        let control = self.view_request(vid, Ident::PauseRender)?;
        if control == Control::Applied {
            self.view_mut(vid, "pause render")?.state = ViewState::Paused;
        }
        Ok(control)
    }

    pub fn resume_render(&mut self, vid: ViewId) -> Result<Control> {
        let state = self.view_state(vid);
        if state != ViewState::Paused {
            return Err(FrontendError::not_now("resume render", state));
        }
        let control = self.view_request(vid, Ident::ResumeRender)?;
        if control == Control::Applied {
            self.view_mut(vid, "resume render")?.state = ViewState::Rendering;
        }
        Ok(control)
    }

    /// Marks the view as stopping before the request goes out.
    pub fn stop_render(&mut self, vid: ViewId) -> Result<Control> {
        let view = self.view_mut(vid, "stop render")?;
        if !matches!(view.state, ViewState::Rendering | ViewState::Paused) {
            return Err(FrontendError::not_now("stop render", view.state));
        }
        view.state = ViewState::Stopping;
        self.view_request(vid, Ident::StopRender)
    }

    /// Handles pending backend output and returns the resulting notices.
    pub fn pump(&mut self) -> Vec<Notice> {
        for _ in 0..MAX_MESSAGES_PER_PUMP {
            let Some(msg) = self.backend.poll() else {
                break;
            };
            self.dispatch(msg);
        }
        std::mem::take(&mut self.notices)
    }

    fn dispatch(&mut self, msg: Message) {
        match msg.class {
            MessageClass::SceneOutput => self.parser_message(msg),
            MessageClass::ViewOutput => self.render_message(msg),
            MessageClass::ViewImage => self.image_message(msg),
            MessageClass::FileAccess => self.file_message(msg),
            MessageClass::BackendControl => {
                let text = match msg.text() {
                    "" => "Unknown failure in backend!".to_owned(),
                    text => text.to_owned(),
                };
                warn!(%text, "backend reported a failure");
                self.notices.push(Notice::Stream {
                    stream: Stream::Fatal,
                    text,
                    echo: true,
                });
            }
            MessageClass::SceneControl | MessageClass::ViewControl => {
                debug!(ident = ?msg.ident, "ignoring control message from backend");
            }
        }
    }

    /// Writes `text` to a scene's stream files and queues it for the console.
    fn output(&mut self, sid: SceneId, stream: Stream, text: &str) {
        let echo = match self.scenes.get_mut(&sid) {
            Some(scene) => {
                scene.routing.write(stream, text);
                scene.routing.console[stream.index()]
            }
            None => true,
        };
        self.notices.push(Notice::Stream {
            stream,
            text: text.to_owned(),
            echo,
        });
    }

    fn parser_message(&mut self, msg: Message) {
        let sid = msg.scene_id();
        let Some(scene) = self.scenes.get_mut(&sid) else {
            debug!(scene = sid.id, ident = ?msg.ident, "output for unknown scene");
            return;
        };
        match msg.ident {
            Ident::Done => {
                scene.compat = msg.attrs;
                scene.gamma = None;
                scene.state = SceneState::Ready;
                info!(scene = sid.id, "parsing finished");
            }
            Ident::Failed => {
                scene.state = SceneState::Failed;
                let text = match msg.text() {
                    "" => "Unknown failure!",
                    text => text,
                };
                self.output(sid, Stream::Fatal, &format!("Fatal error in parser: {text}"));
            }
            Ident::Progress => {
                let echo = scene.verbose;
                self.notices.push(Notice::Progress { attrs: msg.attrs, echo });
            }
            ident => match Stream::for_ident(ident) {
                Some(stream) => self.output(sid, stream, msg.text()),
                None => debug!(?ident, "unhandled parser message"),
            },
        }
    }

    fn render_message(&mut self, msg: Message) {
        let vid = msg.view_id();
        let Some(view) = self.views.get_mut(&vid) else {
            debug!(view = vid.id, ident = ?msg.ident, "output for unknown view");
            return;
        };
        let sid = view.scene;
        match msg.ident {
            Ident::Done => {
                view.state = ViewState::Rendered;
                if let Some(backup) = view.backup.take() {
                    if let Err(err) = backup.discard() {
                        warn!(%err, "could not delete render state file");
                    }
                }
                info!(view = vid.id, "render finished");
            }
            Ident::Failed => {
                view.state = ViewState::Failed;
                view.backup = None;
                let text = match msg.text() {
                    "" => "Unknown failure!",
                    text => text,
                };
                self.output(sid, Stream::Fatal, &format!("Fatal error in renderer: {text}"));
            }
            Ident::Progress => {
                let echo = self.scenes.get(&sid).is_some_and(|scene| scene.verbose);
                self.notices.push(Notice::Progress { attrs: msg.attrs, echo });
            }
            Ident::Statistics => self.output(sid, Stream::Statistics, msg.text()),
            ident => match Stream::for_ident(ident) {
                Some(stream) => self.output(sid, stream, msg.text()),
                None => self.output(sid, Stream::Render, msg.text()),
            },
        }
    }

    fn image_message(&mut self, msg: Message) {
        let vid = msg.view_id();
        let Some(view) = self.views.get_mut(&vid) else {
            debug!(view = vid.id, "image data for unknown view");
            return;
        };
        if let Err(err) = view.target.apply(&msg) {
            warn!(%err, view = vid.id, "bad image message");
            return;
        }
        if msg.is_final() {
            if let Some(backup) = view.backup.as_mut() {
                if let Err(err) = backup.append(&msg) {
                    warn!(%err, "render state file write failed; no longer recording");
                    view.backup = None;
                }
            }
        }
    }

    fn file_message(&mut self, msg: Message) {
        if msg.ident != Ident::FindFile {
            debug!(ident = ?msg.ident, "unhandled file access message");
            return;
        }
        let sid = msg.scene_id();
        let requested = msg.attrs.try_get_str(keys::FILE_NAME, "").to_owned();
        let resolved = find_file(&self.search_paths(sid), &requested)
            .filter(|path| self.policy.allow_read(path))
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_default();
        if resolved.is_empty() {
            debug!(file = %requested, "file not found");
        }
        let answer = Message::with_attrs(
            MessageClass::FileAccess,
            Ident::Done,
            Options::new()
                .with(keys::SCENE_ID, sid.id)
                .with(keys::FILE_NAME, requested)
                .with(keys::RESOLVED_FILE, resolved),
        );
        if let Err(err) = self.backend.post(answer) {
            warn!(%err, "could not answer file lookup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Address, Journal, SimConfig, SimulatedBackend};
    use crate::config::{IoRestrictions, Restriction};
    use crate::files::Unrestricted;
    use crate::raster::{GammaCurve, MemoryDisplay};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tracefront-session-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(config: SimConfig) -> (SessionManager, Journal) {
        let backend = SimulatedBackend::new(Address(1), config);
        let journal = backend.journal();
        (SessionManager::new(Box::new(backend), Box::new(Unrestricted)), journal)
    }

    fn base_options(dir: &Path) -> Options {
        Options::new()
            .with(keys::INPUT_FILE, dir.join("scene.pov").to_string_lossy().into_owned())
            .with(keys::OUTPUT_FILE, dir.join("scene.png").to_string_lossy().into_owned())
            .with(keys::WIDTH, 16)
            .with(keys::HEIGHT, 16)
    }

    fn pump_until(session: &mut SessionManager, mut done: impl FnMut(&SessionManager) -> bool) -> Vec<Notice> {
        let mut notices = Vec::new();
        for _ in 0..100 {
            notices.extend(session.pump());
            if done(session) {
                return notices;
            }
        }
        panic!("session did not reach the expected state");
    }

    fn parsed_scene(session: &mut SessionManager, opts: &mut Options) -> SceneId {
        let sid = session.create_scene(opts).unwrap();
        session.start_parser(sid, opts).unwrap();
        pump_until(session, |s| s.scene_state(sid) == SceneState::Ready);
        sid
    }

    #[test]
    fn lifecycle_runs_from_create_to_close() {
        let dir = scratch_dir("lifecycle");
        let (mut session, journal) = manager(SimConfig::default().block_size(8));
        let mut opts = base_options(&dir);
        let sid = session.create_scene(&mut opts).unwrap();
        assert_eq!(session.scene_state(sid), SceneState::Created);
        assert_eq!(opts.try_get_str(keys::OUTPUT_PATH, ""), dir.to_string_lossy());

        session.start_parser(sid, &opts).unwrap();
        assert_eq!(session.scene_state(sid), SceneState::Parsing);
        pump_until(&mut session, |s| s.scene_state(sid) == SceneState::Ready);

        let vid = session.create_view(sid, &mut opts, None, None).unwrap();
        assert_eq!(session.scene_state(sid), SceneState::Viewing);
        assert_eq!(session.view_state(vid), ViewState::Created);
        assert!(session.close_scene(sid).unwrap_err().is_not_now());

        session.start_render(vid, &mut opts).unwrap();
        let state_file = backup_path(&opts, &dir);
        assert!(state_file.is_file());
        pump_until(&mut session, |s| s.view_state(vid) == ViewState::Rendered);
        assert!(!state_file.exists());
        let image = session.image(vid).unwrap();
        assert!(image.get(15, 15).unwrap().red > 0.9);

        session.close_view(vid).unwrap();
        assert_eq!(session.scene_state(sid), SceneState::Ready);
        session.close_scene(sid).unwrap();
        assert_eq!(session.scene_state(sid), SceneState::Unknown);
        assert_eq!(journal.count(Ident::CloseScene), 1);
    }

    #[test]
    fn operations_out_of_order_are_not_now() {
        let dir = scratch_dir("order");
        let (mut session, _) = manager(SimConfig::default());
        let mut opts = base_options(&dir);
        let sid = session.create_scene(&mut opts).unwrap();
        assert!(session.pause_parser(sid).unwrap_err().is_not_now());
        assert!(session.create_view(sid, &mut opts, None, None).unwrap_err().is_not_now());
        session.start_parser(sid, &opts).unwrap();
        assert!(session.start_parser(sid, &opts).unwrap_err().is_not_now());
        let unknown = ViewId { address: Address(1), id: 77 };
        assert!(session.start_render(unknown, &mut opts).unwrap_err().is_not_now());
    }

    #[test]
    fn refused_pause_is_deferred() {
        let dir = scratch_dir("refused");
        let (mut session, _) = manager(SimConfig::default().parse_steps(50).refuse_pause());
        let mut opts = base_options(&dir);
        let sid = session.create_scene(&mut opts).unwrap();
        session.start_parser(sid, &opts).unwrap();
        assert_eq!(session.pause_parser(sid).unwrap(), Control::Deferred);
        assert_eq!(session.scene_state(sid), SceneState::Parsing);
    }

    #[test]
    fn pause_resume_and_stop_parser() {
        let dir = scratch_dir("pause");
        let (mut session, _) = manager(SimConfig::default().parse_steps(50));
        let mut opts = base_options(&dir);
        let sid = session.create_scene(&mut opts).unwrap();
        session.start_parser(sid, &opts).unwrap();
        assert_eq!(session.pause_parser(sid).unwrap(), Control::Applied);
        assert_eq!(session.scene_state(sid), SceneState::Paused);
        assert_eq!(session.resume_parser(sid).unwrap(), Control::Applied);
        assert_eq!(session.scene_state(sid), SceneState::Parsing);

        session.stop_parser(sid).unwrap();
        assert_eq!(session.scene_state(sid), SceneState::Stopping);
        let notices = pump_until(&mut session, |s| s.scene_state(sid) == SceneState::Failed);
        assert!(notices.iter().any(|n| matches!(
            n,
            Notice::Stream { stream: Stream::Fatal, text, .. } if text == "Fatal error in parser: Parse halted by user"
        )));
    }

    #[test]
    fn failed_close_invalidates_scene() {
        let dir = scratch_dir("close");
        let (mut session, _) = manager(SimConfig::default().fail_close());
        let mut opts = base_options(&dir);
        let sid = session.create_scene(&mut opts).unwrap();
        assert!(session.close_scene(sid).is_err());
        assert_eq!(session.scene_state(sid), SceneState::Invalid);
        assert!(session.scenes.is_empty());
    }

    #[test]
    fn failed_view_close_does_not_pin_the_scene() {
        let dir = scratch_dir("close-view");
        let sim = SimConfig {
            fail_close_view: true,
            ..SimConfig::default()
        };
        let (mut session, journal) = manager(sim);
        for frame in 0..3 {
            let mut opts = base_options(&dir);
            let sid = parsed_scene(&mut session, &mut opts);
            let vid = session.create_view(sid, &mut opts, None, None).unwrap();
            assert!(session.close_view(vid).is_err(), "frame {frame}");
            assert_eq!(session.view_state(vid), ViewState::Invalid);
            assert_eq!(session.scene_state(sid), SceneState::Ready);
            session.close_scene(sid).unwrap();
            assert_eq!(session.scene_state(sid), SceneState::Unknown);
        }
        assert!(session.scenes.is_empty());
        assert!(session.views.is_empty());
        assert_eq!(journal.count(Ident::CloseScene), 3);
    }

    #[test]
    fn old_scene_gamma_is_upgraded_with_advisory() {
        let dir = scratch_dir("gamma");
        let (mut session, _) = manager(SimConfig::default().legacy_gamma_mode("none"));
        let mut opts = base_options(&dir).with(keys::VERSION, 3.8);
        let sid = parsed_scene(&mut session, &mut opts);
        session.create_view(sid, &mut opts, None, None).unwrap();
        let notices = session.pump();
        assert!(notices.iter().any(|n| matches!(
            n,
            Notice::Stream { stream: Stream::Warning, text, .. } if text.contains("assumed_gamma")
        )));
        assert_eq!(opts.try_get_float(keys::WORKING_GAMMA, 0.0), 1.0);
    }

    #[test]
    fn mismatched_partial_image_is_rejected() {
        let dir = scratch_dir("partial");
        let (mut session, _) = manager(SimConfig::default());
        let mut opts = base_options(&dir);
        let sid = parsed_scene(&mut session, &mut opts);
        let err = session
            .create_view(sid, &mut opts, Some(ImageBuffer::new(3, 3)), None)
            .unwrap_err();
        assert!(matches!(err, FrontendError::Param(_)));
        assert_eq!(session.scene_state(sid), SceneState::Ready);
    }

    #[test]
    fn display_receives_blocks() {
        let dir = scratch_dir("display");
        let (mut session, _) = manager(SimConfig::default().block_size(8));
        let mut opts = base_options(&dir);
        let sid = parsed_scene(&mut session, &mut opts);
        let display = MemoryDisplay::new(16, 16);
        let shared = display.clone();
        let mut factory: DisplayFactory = Box::new(move |_, _| Box::new(shared.clone()) as Box<dyn Display>);
        let vid = session.create_view(sid, &mut opts, None, Some(&mut factory)).unwrap();
        session.start_render(vid, &mut opts).unwrap();
        pump_until(&mut session, |s| s.view_state(vid) == ViewState::Rendered);
        assert_eq!(display.pixel(15, 0).map(|p| p.alpha), Some(255));
    }

    #[test]
    fn include_files_are_resolved_through_search_paths() {
        let dir = scratch_dir("includes");
        let lib = dir.join("lib");
        std::fs::create_dir_all(&lib).unwrap();
        std::fs::write(lib.join("colors.inc"), "").unwrap();
        let (mut session, journal) = manager(SimConfig::default());
        let mut opts = base_options(&dir)
            .with(keys::LIBRARY_PATH, vec![Value::from(lib.to_string_lossy().into_owned())])
            .with(keys::INCLUDE_FILES, vec![Value::from("colors.inc")]);
        let sid = parsed_scene(&mut session, &mut opts);
        assert_eq!(session.scene_state(sid), SceneState::Ready);
        let answer = journal.last(Ident::Done).unwrap();
        assert!(answer.attrs.try_get_str(keys::RESOLVED_FILE, "").ends_with("colors.inc"));

        let mut missing = base_options(&dir).with(keys::INCLUDE_FILES, vec![Value::from("nowhere.inc")]);
        let sid = session.create_scene(&mut missing).unwrap();
        session.start_parser(sid, &missing).unwrap();
        let notices = pump_until(&mut session, |s| s.scene_state(sid) == SceneState::Failed);
        assert!(notices.iter().any(|n| matches!(
            n,
            Notice::Stream { text, .. } if text.contains("nowhere.inc")
        )));
    }

    #[test]
    fn stream_files_are_plain_names_in_output_dir() {
        let dir = scratch_dir("streams");
        let (mut session, _) = manager(SimConfig::default().fail_parse());
        let mut bad = base_options(&dir).with(keys::FATAL_FILE, "sub/fatal.log");
        assert!(matches!(session.create_scene(&mut bad), Err(FrontendError::Param(_))));

        let mut opts = base_options(&dir)
            .with(keys::FATAL_FILE, true)
            .with(keys::ALL_FILE, "everything.log")
            .with(keys::ALL_CONSOLE, false);
        let sid = session.create_scene(&mut opts).unwrap();
        session.start_parser(sid, &opts).unwrap();
        let notices = pump_until(&mut session, |s| s.scene_state(sid) == SceneState::Failed);
        let fatal: Vec<&Notice> = notices
            .iter()
            .filter(|n| matches!(n, Notice::Stream { stream: Stream::Fatal, .. }))
            .collect();
        assert_eq!(fatal.len(), 1);
        assert!(matches!(fatal[0], Notice::Stream { echo: false, .. }));

        let written = std::fs::read_to_string(dir.join("fatal.out")).unwrap();
        assert!(written.contains("Fatal error in parser: Parse Error"));
        let all = std::fs::read_to_string(dir.join("everything.log")).unwrap();
        assert_eq!(all, written);
    }

    #[test]
    fn continued_renders_append_to_stream_files() {
        let dir = scratch_dir("append");
        std::fs::write(dir.join("warning.out"), "earlier\n").unwrap();
        let (mut session, _) = manager(SimConfig::default());
        let mut opts = base_options(&dir)
            .with(keys::WARNING_FILE, "on")
            .with(keys::APPEND_CONSOLE_FILES, true);
        session.create_scene(&mut opts).unwrap();
        let written = std::fs::read_to_string(dir.join("warning.out")).unwrap();
        assert!(written.starts_with("earlier\n"));
        assert!(written.contains("Appending to stream output file"));
    }

    #[test]
    fn write_restrictions_block_state_file() {
        let dir = scratch_dir("restricted");
        let backend = SimulatedBackend::new(Address(1), SimConfig::default());
        let policy = IoRestrictions {
            write: Restriction::AllowedDirs,
            allowed_dirs: vec![],
            working_dir: Some(dir.join("elsewhere")),
            ..IoRestrictions::default()
        };
        let mut session = SessionManager::new(Box::new(backend), Box::new(policy));
        let mut opts = base_options(&dir);
        let sid = parsed_scene(&mut session, &mut opts);
        let vid = session.create_view(sid, &mut opts, None, None).unwrap();
        let err = session.start_render(vid, &mut opts).unwrap_err();
        assert!(err.is_cannot_open_file());
        assert_eq!(session.view_state(vid), ViewState::Created);
    }

    fn pixel(view: i64, id: i64, x: i64, y: i64, value: f64) -> Message {
        Message::with_attrs(
            MessageClass::ViewImage,
            Ident::PixelSet,
            Options::new()
                .with(keys::VIEW_ID, view)
                .with(keys::PIXEL_ID, id)
                .with(keys::PIXEL_FINAL, true)
                .with(keys::PIXEL_SIZE, 1)
                .with(keys::PIXEL_POSITIONS, vec![Value::Int(x), Value::Int(y)])
                .with(keys::PIXEL_COLORS, vec![
                    Value::Float(value),
                    Value::Float(1.0 - value),
                    Value::Float(0.25),
                    Value::Float(0.0),
                    Value::Float(0.0),
                ]),
        )
    }

    #[test]
    fn replayed_state_rebuilds_the_same_image() {
        let dir = scratch_dir("replay");
        let path = dir.join("scene.tracefront-state");
        let messages: Vec<Message> = (0..12)
            .map(|id| pixel(3, id, id % 4, id / 4, id as f64 / 12.0))
            .collect();

        let mut direct = ViewTarget::new(4, 3, Some(ImageBuffer::new(4, 3)), None, GammaCurve::Neutral);
        let mut store = BackupStore::create_new(&path, None, &Unrestricted).unwrap();
        for msg in &messages {
            direct.apply(msg).unwrap();
            store.append(msg).unwrap();
        }
        drop(store);

        let mut rebuilt = ViewTarget::new(4, 3, Some(ImageBuffer::new(4, 3)), None, GammaCurve::Neutral);
        let resume = BackupStore::replay(&path, &Unrestricted, |msg| rebuilt.apply(msg))
            .unwrap()
            .unwrap();
        assert_eq!(rebuilt.image, direct.image);
        assert_eq!(resume.highest_contiguous(), Some(11));
        assert!(resume.skip.is_empty());
    }

    /// Renders half a view, then drops the session so the state file stays.
    fn interrupted_render(dir: &Path) -> Options {
        let (mut session, _) = manager(SimConfig::default().block_size(4).blocks_per_step(3));
        let mut opts = base_options(dir);
        let sid = parsed_scene(&mut session, &mut opts);
        let vid = session.create_view(sid, &mut opts, None, None).unwrap();
        session.start_render(vid, &mut opts).unwrap();
        session.pump();
        session.pump();
        session.stop_render(vid).unwrap();
        pump_until(&mut session, |s| s.view_state(vid) == ViewState::Failed);
        opts
    }

    #[test]
    fn continue_trace_resumes_after_completed_blocks() {
        let dir = scratch_dir("continue");
        interrupted_render(&dir);
        let state_file = dir.join("scene.tracefront-state");
        // Two steps of three blocks made it into the file before the stop.
        let before = BackupStore::inspect(&state_file).unwrap();
        assert_eq!(before.next_serial, 6);
        assert_eq!(before.highest_contiguous(), Some(5));

        let (mut session, journal) = manager(SimConfig::default().block_size(4).blocks_per_step(3));
        let mut opts = base_options(&dir).with(keys::CONTINUE_TRACE, true);
        let sid = parsed_scene(&mut session, &mut opts);
        let vid = session.create_view(sid, &mut opts, None, None).unwrap();
        session.start_render(vid, &mut opts).unwrap();
        assert_eq!(opts.try_get_int(keys::PIXEL_ID, -1), 6);
        assert_eq!(journal.last(Ident::StartRender).unwrap().attrs.try_get_int(keys::PIXEL_ID, -1), 6);
        assert!(session.image(vid).unwrap().get(3, 0).unwrap().red > 0.0);

        pump_until(&mut session, |s| s.view_state(vid) == ViewState::Rendered);
        assert!(!state_file.exists());
    }

    #[test]
    fn continue_without_file_output_ignores_state_file() {
        let dir = scratch_dir("no-file-output");
        interrupted_render(&dir);
        let state_file = dir.join("scene.tracefront-state");
        let before = std::fs::metadata(&state_file).unwrap().len();

        let (mut session, journal) = manager(SimConfig::default().block_size(4).blocks_per_step(3));
        let mut opts = base_options(&dir)
            .with(keys::CONTINUE_TRACE, true)
            .with(keys::OUTPUT_TO_FILE, false);
        let sid = parsed_scene(&mut session, &mut opts);
        let vid = session.create_view(sid, &mut opts, None, None).unwrap();
        session.start_render(vid, &mut opts).unwrap();
        assert!(!opts.contains(keys::PIXEL_ID));
        assert_eq!(journal.last(Ident::StartRender).unwrap().attrs.try_get_int(keys::PIXEL_ID, -1), -1);
        assert_eq!(std::fs::metadata(&state_file).unwrap().len(), before);

        let (mut session, _) = manager(SimConfig::default());
        let mut piped = base_options(&dir)
            .with(keys::CONTINUE_TRACE, true)
            .with(keys::OUTPUT_TO_FILE, false)
            .with(keys::OUTPUT_FILE, "-");
        let sid = parsed_scene(&mut session, &mut piped);
        let vid = session.create_view(sid, &mut piped, None, None).unwrap();
        session.start_render(vid, &mut piped).unwrap();
    }

    #[test]
    fn corrupt_header_starts_a_fresh_state_file() {
        let dir = scratch_dir("corrupt");
        interrupted_render(&dir);
        let state_file = dir.join("scene.tracefront-state");
        let mut bytes = std::fs::read(&state_file).unwrap();
        bytes[0] = b'X';
        std::fs::write(&state_file, bytes).unwrap();

        let (mut session, journal) = manager(SimConfig::default().block_size(4));
        let mut opts = base_options(&dir).with(keys::CONTINUE_TRACE, true);
        let sid = parsed_scene(&mut session, &mut opts);
        let vid = session.create_view(sid, &mut opts, None, None).unwrap();
        session.start_render(vid, &mut opts).unwrap();
        assert!(!opts.contains(keys::PIXEL_ID));
        assert!(!journal.last(Ident::StartRender).unwrap().attrs.contains(keys::PIXEL_ID));
        assert_eq!(BackupStore::inspect(&state_file).unwrap().records, 0);
    }

    #[test]
    fn missing_state_file_behaves_like_corrupt_one() {
        let dir = scratch_dir("missing");
        let (mut session, _) = manager(SimConfig::default());
        let mut opts = base_options(&dir).with(keys::CONTINUE_TRACE, true);
        let sid = parsed_scene(&mut session, &mut opts);
        let vid = session.create_view(sid, &mut opts, None, None).unwrap();
        session.start_render(vid, &mut opts).unwrap();
        assert!(!opts.contains(keys::PIXEL_ID));
        assert!(dir.join("scene.tracefront-state").is_file());
    }

    #[test]
    fn continue_on_finished_image_is_already_rendered() {
        let dir = scratch_dir("finished");
        std::fs::write(dir.join("scene.png"), b"not empty").unwrap();
        let (mut session, _) = manager(SimConfig::default());
        let mut opts = base_options(&dir).with(keys::CONTINUE_TRACE, true);
        let sid = parsed_scene(&mut session, &mut opts);
        let vid = session.create_view(sid, &mut opts, None, None).unwrap();
        assert!(session.start_render(vid, &mut opts).unwrap_err().is_already_rendered());

        let mut piped = base_options(&dir)
            .with(keys::CONTINUE_TRACE, true)
            .with(keys::OUTPUT_FILE, "-");
        assert!(matches!(
            session.start_render(vid, &mut piped),
            Err(FrontendError::CannotHandleRequest(_))
        ));
    }
}
