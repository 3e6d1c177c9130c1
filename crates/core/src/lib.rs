//! Core library for the Tracefront render front end.
//!
//! A front end sits between a user interface and a render backend. It owns
//! the lifecycle of scenes (parsed descriptions) and views (renders of a
//! scene), runs configured shell commands around scenes and frames, steps
//! through animation frames and keeps a state file so an interrupted render
//! can be continued. [`Frontend`] ties these together behind a polled state
//! machine.

pub mod animation;
pub mod backend;
pub mod backup;
pub mod config;
pub mod error;
pub mod files;
pub mod frontend;
pub mod options;
pub mod raster;
pub mod session;
pub mod shellout;

pub use animation::AnimationSequencer;
pub use backend::{Address, Backend, Message, SceneId, SimConfig, SimulatedBackend, ViewId};
pub use backup::{BackupStore, ResumeState};
pub use config::{FrontendConfig, IoRestrictions, Restriction, ShelloutConfig};
pub use error::{FrontendError, Result};
pub use frontend::{Frontend, LogHooks, MessageHooks, SessionLog, State};
pub use options::Options;
pub use session::{SceneState, SessionManager, Stream, ViewState};
pub use shellout::{CommandRunner, ProcessRunner, ShelloutCoordinator, ShelloutEvent};
