pub mod client;
pub mod paginate;
pub mod rate_limit;
pub mod retry;

pub use client::{HttpClient, HttpClientBuilder, LineStream};
pub use paginate::{PageFetcher, Paginator};
pub use rate_limit::{RateLimit, RateLimiter};
pub use retry::RetryPolicy;

use crate::auth::AuthError;
use crate::error::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("credentials unavailable: {0}")]
    Credentials(#[from] AuthError),

    #[error("still rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header: {0}")]
    Header(String),

    #[error("shutdown requested")]
    Shutdown,
}

impl HttpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HttpError::Auth(_) => ErrorKind::Auth,
            HttpError::Credentials(e) => e.kind(),
            HttpError::Json(_) => ErrorKind::Parse,
            HttpError::Header(_) => ErrorKind::Config,
            HttpError::Shutdown => ErrorKind::Shutdown,
            // Exhausted rate limiting is reported as a transient failure
            HttpError::Request(_)
            | HttpError::Status { .. }
            | HttpError::RateLimited { .. }
            | HttpError::Exhausted { .. } => ErrorKind::Transient,
        }
    }

    /// HTTP status, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            HttpError::RateLimited { .. } => Some(429),
            HttpError::Auth(_) => Some(401),
            _ => None,
        }
    }
}
