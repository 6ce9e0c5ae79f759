use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Navigation failed: {0}")]
    NavigationError(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Element not interactable: {0}")]
    NotInteractable(String),

    #[error("Action validation failed: {0}")]
    ActionValidationFailed(String),

    #[error("Timed out waiting for: {0}")]
    WaitTimeout(String),

    #[error("Step timed out: {0}")]
    StepTimeout(String),

    #[error("Cyclic dependency involving step: {0}")]
    CyclicDependency(String),

    #[error("Unknown dependency '{dependency}' declared by step '{step}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Duplicate step id: {0}")]
    DuplicateStep(String),

    #[error("Self-healing exhausted for step: {0}")]
    SelfHealingExhausted(String),

    #[error("JavaScript error: {0}")]
    JsError(String),

    #[error("Screenshot failed: {0}")]
    ScreenshotError(String),

    #[error("CDP error: {0}")]
    CdpError(#[from] chromiumoxide::error::CdpError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Coarse classification used by self-healing trigger matching.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::LaunchFailed(_) => ErrorKind::LaunchFailed,
            Error::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Error::NavigationError(_) => ErrorKind::Navigation,
            Error::ElementNotFound(_) => ErrorKind::ElementNotFound,
            Error::NotInteractable(_) => ErrorKind::NotInteractable,
            Error::ActionValidationFailed(_) => ErrorKind::ActionValidationFailed,
            Error::WaitTimeout(_) => ErrorKind::WaitTimeout,
            Error::StepTimeout(_) => ErrorKind::StepTimeout,
            Error::CyclicDependency(_) => ErrorKind::CyclicDependency,
            Error::UnknownDependency { .. } => ErrorKind::UnknownDependency,
            Error::SelfHealingExhausted(_) => ErrorKind::SelfHealingExhausted,
            _ => ErrorKind::Other,
        }
    }
}

/// Message-free error classification, serializable so step results and
/// self-healing triggers can refer to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    LaunchFailed,
    SessionNotFound,
    Navigation,
    ElementNotFound,
    NotInteractable,
    ActionValidationFailed,
    WaitTimeout,
    StepTimeout,
    CyclicDependency,
    UnknownDependency,
    SelfHealingExhausted,
    Other,
}

pub type Result<T> = std::result::Result<T, Error>;
