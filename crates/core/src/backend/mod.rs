//! Message model shared with the render backend.
//!
//! The backend is an external engine that owns scenes and views. The front
//! end talks to it with [`Message`]s: control requests either wait for a
//! [`Reply`] ([`Backend::request`]) or are posted without one
//! ([`Backend::post`]), and progress, text and pixel output comes back
//! through [`Backend::poll`].

use serde::{Deserialize, Serialize};

use crate::error::codes;
use crate::options::{keys, Options};
use crate::{FrontendError, Result};

mod channel;
pub mod sim;

pub use channel::{spawn, ChannelBackend};
pub use sim::{Journal, SimConfig, SimulatedBackend};

/// Address of a backend instance on the message bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(pub u32);

/// Handle of a scene owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SceneId {
    pub address: Address,
    pub id: i64,
}

/// Handle of a view owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId {
    pub address: Address,
    pub id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    BackendControl,
    SceneControl,
    ViewControl,
    SceneOutput,
    ViewOutput,
    ViewImage,
    FileAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ident {
    CreateScene,
    CloseScene,
    StartParser,
    PauseParser,
    ResumeParser,
    StopParser,
    CreateView,
    CloseView,
    StartRender,
    PauseRender,
    ResumeRender,
    StopRender,
    Done,
    Failed,
    Progress,
    ParserOptions,
    RenderOptions,
    Banner,
    Warning,
    Error,
    FatalError,
    DebugInfo,
    Statistics,
    PixelSet,
    PixelBlockSet,
    PixelRowSet,
    RectangleFrameSet,
    FilledRectangleSet,
    FindFile,
}

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub class: MessageClass,
    pub ident: Ident,
    #[serde(default)]
    pub source: Address,
    #[serde(default)]
    pub attrs: Options,
}

impl Message {
    pub fn new(class: MessageClass, ident: Ident) -> Self {
        Self {
            class,
            ident,
            source: Address::default(),
            attrs: Options::new(),
        }
    }

    pub fn with_attrs(class: MessageClass, ident: Ident, attrs: Options) -> Self {
        Self {
            class,
            ident,
            source: Address::default(),
            attrs,
        }
    }

    pub fn from_source(mut self, source: Address) -> Self {
        self.source = source;
        self
    }

    pub fn scene_id(&self) -> SceneId {
        SceneId {
            address: self.source,
            id: self.attrs.try_get_int(keys::SCENE_ID, -1),
        }
    }

    pub fn view_id(&self) -> ViewId {
        ViewId {
            address: self.source,
            id: self.attrs.try_get_int(keys::VIEW_ID, -1),
        }
    }

    pub fn text(&self) -> &str {
        self.attrs.try_get_str(keys::ENGLISH_TEXT, "")
    }

    /// Whether the message carries a block for the final image.
    pub fn is_final(&self) -> bool {
        self.attrs.contains(keys::PIXEL_FINAL)
    }
}

/// Answer to a blocking request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ident: Ident,
    #[serde(default)]
    pub attrs: Options,
}

impl Reply {
    pub fn done(attrs: Options) -> Self {
        Self {
            ident: Ident::Done,
            attrs,
        }
    }

    pub fn error(code: i64, text: impl Into<String>) -> Self {
        Self {
            ident: Ident::Failed,
            attrs: Options::new()
                .with(keys::ERROR_NUMBER, code)
                .with(keys::ENGLISH_TEXT, text.into()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.ident == Ident::Done
    }

    pub fn error_code(&self) -> i64 {
        self.attrs.try_get_int(keys::ERROR_NUMBER, codes::NO_ERROR)
    }

    /// Turns a failed reply into the matching error.
    pub fn into_error(self) -> FrontendError {
        let code = self.error_code();
        let text = self.attrs.try_get_str(keys::ENGLISH_TEXT, "").to_owned();
        FrontendError::from_code(code, text)
    }
}

/// Transport to a render backend.
pub trait Backend: Send {
    fn address(&self) -> Address;

    /// Sends `msg` and waits for the reply.
    fn request(&mut self, msg: Message) -> Result<Reply>;

    /// Sends `msg` without waiting for anything.
    fn post(&mut self, msg: Message) -> Result<()>;

    /// Returns the next pending output message, if any. Never blocks.
    fn poll(&mut self) -> Option<Message>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn address(&self) -> Address {
        (**self).address()
    }

    fn request(&mut self, msg: Message) -> Result<Reply> {
        (**self).request(msg)
    }

    fn post(&mut self, msg: Message) -> Result<()> {
        (**self).post(msg)
    }

    fn poll(&mut self) -> Option<Message> {
        (**self).poll()
    }
}
