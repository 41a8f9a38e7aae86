//! Site lifecycle errors and their JSON rendering at the API edge

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;

use crate::docker::GatewayError;

/// Step of site provisioning an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    ClaimIdentifier,
    CreateDatabase,
    SeedDatabase,
    CreateContainer,
    StartContainer,
    Install,
    Readiness,
    Configure,
    VerifyHttps,
    Register,
}

impl ProvisionStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionStep::ClaimIdentifier => "claim_identifier",
            ProvisionStep::CreateDatabase => "create_database",
            ProvisionStep::SeedDatabase => "seed_database",
            ProvisionStep::CreateContainer => "create_container",
            ProvisionStep::StartContainer => "start_container",
            ProvisionStep::Install => "install",
            ProvisionStep::Readiness => "readiness",
            ProvisionStep::Configure => "configure",
            ProvisionStep::VerifyHttps => "verify_https",
            ProvisionStep::Register => "register",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("site {site_id}: {step} failed: {source}")]
    Provision {
        site_id: String,
        step: ProvisionStep,
        #[source]
        source: Box<SiteError>,
    },

    #[error("container runtime error: {0}")]
    Runtime(#[from] GatewayError),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database '{0}' already exists")]
    DuplicateName(String),

    #[error("no unused site identifier after {0} attempts")]
    IdentifiersExhausted(u32),

    #[error("database engine not ready after {attempts} attempts")]
    DatabaseNotReady { attempts: u32 },

    #[error("{target} not ready after {attempts} attempts")]
    ProbeTimeout { target: String, attempts: u32 },

    #[error("interrupted by shutdown")]
    Cancelled,

    #[error("{step} exited with status {exit_code}: {output}")]
    CommandFailed {
        step: String,
        exit_code: i64,
        output: String,
    },

    #[error("image '{0}' is not available")]
    ImageMissing(String),

    #[error("golden image '{0}' has not been built yet")]
    GoldenImageMissing(String),

    #[error("committing '{0}' produced no image id")]
    CommitProducedNoImage(String),

    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("site '{0}' not found")]
    SiteNotFound(String),

    #[error("no valid login token for site '{0}'")]
    LoginTokenUnavailable(String),
}

pub type SiteResult<T> = Result<T, SiteError>;

impl SiteError {
    /// Attach the site id and failing step, unless already attached
    pub fn at(self, site_id: &str, step: ProvisionStep) -> Self {
        match self {
            err @ SiteError::Provision { .. } => err,
            err => SiteError::Provision {
                site_id: site_id.to_string(),
                step,
                source: Box::new(err),
            },
        }
    }

    /// Innermost error, past any provisioning context
    pub fn root(&self) -> &SiteError {
        match self {
            SiteError::Provision { source, .. } => source.root(),
            err => err,
        }
    }

    /// Whether retrying with a fresh identifier can succeed
    pub fn is_name_collision(&self) -> bool {
        matches!(self.root(), SiteError::DuplicateName(_))
    }

    pub fn is_probe_timeout(&self) -> bool {
        matches!(self.root(), SiteError::ProbeTimeout { .. })
    }

    pub fn code(&self) -> ApiErrorCode {
        match self.root() {
            SiteError::InvalidIdentifier(_) => ApiErrorCode::BadRequest,
            SiteError::SiteNotFound(_) | SiteError::LoginTokenUnavailable(_) => {
                ApiErrorCode::NotFound
            }
            SiteError::GoldenImageMissing(_) | SiteError::ImageMissing(_) => {
                ApiErrorCode::ImageUnavailable
            }
            SiteError::DatabaseNotReady { .. } => ApiErrorCode::DatabaseUnavailable,
            SiteError::ProbeTimeout { .. } => ApiErrorCode::SiteNotReady,
            SiteError::DuplicateName(_) | SiteError::IdentifiersExhausted(_) => {
                ApiErrorCode::Conflict
            }
            SiteError::Runtime(_)
            | SiteError::Http(_)
            | SiteError::CommandFailed { .. }
            | SiteError::CommitProducedNoImage(_) => ApiErrorCode::ProvisioningFailed,
            SiteError::Cancelled => ApiErrorCode::ShuttingDown,
            SiteError::Store(_) | SiteError::Provision { .. } => ApiErrorCode::InternalError,
        }
    }
}

/// Error codes returned in API error bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    /// Malformed request body or path
    BadRequest,
    /// Unknown route or site
    NotFound,
    /// Method not supported on this route
    MethodNotAllowed,
    /// Golden or base image not available yet
    ImageUnavailable,
    /// MySQL engine did not answer in time
    DatabaseUnavailable,
    /// Site never became ready and was rolled back
    SiteNotReady,
    /// Identifier space exhausted or name collision
    Conflict,
    /// A runtime call or in-container command failed
    ProvisioningFailed,
    /// Orchestrator is shutting down
    ShuttingDown,
    InternalError,
}

impl ApiErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiErrorCode::ImageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::DatabaseUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::SiteNotReady => StatusCode::GATEWAY_TIMEOUT,
            ApiErrorCode::Conflict => StatusCode::CONFLICT,
            ApiErrorCode::ProvisioningFailed => StatusCode::BAD_GATEWAY,
            ApiErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::BadRequest => "BAD_REQUEST",
            ApiErrorCode::NotFound => "NOT_FOUND",
            ApiErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ApiErrorCode::ImageUnavailable => "IMAGE_UNAVAILABLE",
            ApiErrorCode::DatabaseUnavailable => "DATABASE_UNAVAILABLE",
            ApiErrorCode::SiteNotReady => "SITE_NOT_READY",
            ApiErrorCode::Conflict => "CONFLICT",
            ApiErrorCode::ProvisioningFailed => "PROVISIONING_FAILED",
            ApiErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always false
    pub success: bool,
    /// Human-readable error message
    pub error: String,
    pub code: ApiErrorCode,
}

impl ErrorResponse {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
            code,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"error":"{}","code":"{}"}}"#,
                self.error.replace('\"', "\\\""),
                self.code.as_str()
            )
        })
    }
}

/// Create a JSON error response
pub fn json_error_response(
    code: ApiErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
