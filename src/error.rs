use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Missing required field '{field}' in {path}")]
    MissingField { path: PathBuf, field: &'static str },
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Token request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Token endpoint returned {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("Token response did not contain an access token")]
    MissingAccessToken,
}

/// Both the refresh and the full re-authentication failed. The run cannot continue.
#[derive(Error, Debug)]
pub enum ReauthError {
    #[error("Unable to reload credentials: {0}")]
    Credentials(#[from] ConfigError),
    #[error("Re-authentication failed: {0}")]
    Auth(#[from] AuthError),
}

/// The initial login could not be performed.
#[derive(Error, Debug)]
pub enum LoginError {
    #[error(transparent)]
    Credentials(#[from] ConfigError),
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
}

#[derive(Error, Debug)]
pub enum PaginationError {
    #[error("Catalog request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },
    #[error("Catalog request to {url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Catalog returned an already visited next link: {url}")]
    RepeatedLink { url: String },
}

/// A single failed download attempt.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Download request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Download endpoint returned {0}")]
    Status(reqwest::StatusCode),
    #[error("Unable to write download: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
#[error("Giving up on {product} after {attempts} attempts: {last}")]
pub struct DownloadExhaustedError {
    pub product: String,
    pub attempts: u32,
    pub last: DownloadError,
}

/// Why a single task stopped. Only `Reauth` ends the run.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Exhausted(#[from] DownloadExhaustedError),
    #[error(transparent)]
    Reauth(#[from] ReauthError),
}
