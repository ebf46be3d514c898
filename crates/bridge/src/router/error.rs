use http::StatusCode;
use thiserror::Error;

/// A call could not be matched to a route.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("no route for {method} {path}{}", version_suffix(.version))]
    NotFound { method: String, path: String, version: Option<String> },

    #[error("{method} {path} has no unversioned route and {candidates} versioned ones, a version is required")]
    AmbiguousRoute { method: String, path: String, candidates: usize },
}

fn version_suffix(version: &Option<String>) -> String {
    version.as_ref().map(|v| format!(" version {v}")).unwrap_or_default()
}

/// A matched route failed while running.
#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("arguments could not be bound: {reason}")]
    BadRequest { reason: String },

    #[error("handler failed: {reason}")]
    Handler { reason: String },
}

impl InvokeError {
    pub fn bad_request<S: ToString>(str: S) -> Self {
        Self::BadRequest { reason: str.to_string() }
    }

    pub fn handler<S: ToString>(str: S) -> Self {
        Self::Handler { reason: str.to_string() }
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Route(RouteError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Route(RouteError::AmbiguousRoute { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Invoke(InvokeError::BadRequest { .. }) => StatusCode::BAD_REQUEST,
            Self::Invoke(InvokeError::Handler { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The route table is inconsistent; reported once, when the router is built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterBuildError {
    #[error("{method} {path} has more than one unversioned route")]
    DuplicateDefault { method: String, path: String },

    #[error("{method} {path} declares version {version} more than once")]
    DuplicateVersion { method: String, path: String, version: String },

    #[error("invalid route path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
}
