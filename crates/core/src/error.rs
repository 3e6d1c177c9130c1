/// Result alias that carries the custom [`FrontendError`] type.
pub type Result<T> = std::result::Result<T, FrontendError>;

/// Integer error codes exchanged with the backend in `error_number` attributes.
pub mod codes {
    pub const NO_ERROR: i64 = 0;
    pub const NOT_NOW: i64 = -1;
    pub const CANNOT_OPEN_FILE: i64 = -2;
    pub const FILE_DATA: i64 = -3;
    pub const IMAGE_ALREADY_RENDERED: i64 = -4;
    pub const CANNOT_HANDLE_REQUEST: i64 = -5;
    pub const PARAM: i64 = -6;
    pub const INVALID_DATA_SIZE: i64 = -7;
    pub const GENERIC: i64 = -100;
}

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum FrontendError {
    /// An operation was attempted in a lifecycle state that does not allow it.
    #[error("{operation} is not possible while {state}")]
    NotNow {
        operation: &'static str,
        state: String,
    },
    /// Error code reported by the backend in a reply message.
    #[error("backend error {code}: {message}")]
    Backend { code: i64, message: String },
    #[error("{0}")]
    CannotOpenFile(String),
    #[error("{0}")]
    FileData(String),
    /// Continue was requested but the output image is already complete.
    #[error("output image has already been rendered")]
    ImageAlreadyRendered,
    #[error("{0}")]
    CannotHandleRequest(String),
    #[error("{0}")]
    Param(String),
    #[error("{0}")]
    InvalidDataSize(String),
    /// Free-form failure that does not fit one of the categories above.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Image(#[from] image::ImageError),
}

impl FrontendError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn not_now(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        Self::NotNow {
            operation,
            state: format!("{state:?}"),
        }
    }

    /// Rebuilds an error from a backend reply code.
    pub fn from_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            codes::CANNOT_OPEN_FILE => Self::CannotOpenFile(message),
            codes::FILE_DATA => Self::FileData(message),
            codes::IMAGE_ALREADY_RENDERED => Self::ImageAlreadyRendered,
            codes::CANNOT_HANDLE_REQUEST => Self::CannotHandleRequest(message),
            codes::PARAM => Self::Param(message),
            codes::INVALID_DATA_SIZE => Self::InvalidDataSize(message),
            _ => Self::Backend { code, message },
        }
    }

    /// Stable integer code, suitable for an `error_number` attribute.
    pub fn code(&self) -> i64 {
        match self {
            Self::NotNow { .. } => codes::NOT_NOW,
            Self::Backend { code, .. } => *code,
            Self::CannotOpenFile(_) => codes::CANNOT_OPEN_FILE,
            Self::FileData(_) => codes::FILE_DATA,
            Self::ImageAlreadyRendered => codes::IMAGE_ALREADY_RENDERED,
            Self::CannotHandleRequest(_) => codes::CANNOT_HANDLE_REQUEST,
            Self::Param(_) => codes::PARAM,
            Self::InvalidDataSize(_) => codes::INVALID_DATA_SIZE,
            Self::Io(_) => codes::CANNOT_OPEN_FILE,
            Self::Message(_) | Self::Json(_) | Self::Image(_) => codes::GENERIC,
        }
    }

    pub fn is_not_now(&self) -> bool {
        self.code() == codes::NOT_NOW
    }

    /// Permission problems and shellout prohibitions land here.
    pub fn is_cannot_open_file(&self) -> bool {
        matches!(self, Self::CannotOpenFile(_))
            || matches!(self, Self::Backend { code, .. } if *code == codes::CANNOT_OPEN_FILE)
    }

    pub fn is_already_rendered(&self) -> bool {
        matches!(self, Self::ImageAlreadyRendered)
    }
}

impl From<&str> for FrontendError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for FrontendError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_codes_map_back_to_variants() {
        let err = FrontendError::from_code(codes::CANNOT_OPEN_FILE, "denied");
        assert!(err.is_cannot_open_file());
        assert_eq!(err.to_string(), "denied");

        let err = FrontendError::from_code(codes::IMAGE_ALREADY_RENDERED, "");
        assert!(err.is_already_rendered());

        let err = FrontendError::from_code(42, "odd");
        assert_eq!(err.code(), 42);
        assert!(!err.is_not_now());
    }

    #[test]
    fn not_now_reports_operation_and_state() {
        #[derive(Debug)]
        enum Phase {
            Parsing,
        }
        let err = FrontendError::not_now("create view", Phase::Parsing);
        assert!(err.is_not_now());
        assert_eq!(err.to_string(), "create view is not possible while Parsing");
    }
}
