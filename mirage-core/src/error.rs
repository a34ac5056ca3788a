use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Rejections raised while configuring an image source, before any I/O.
#[derive(Debug, Error)]
pub enum ImageSourceError {
    #[error("an image source is required: provide a file path, url, base64 payload, or decoded image")]
    NoSource,

    #[error("image sources are mutually exclusive, got {}", .got.join(" and "))]
    MultipleSources { got: Vec<&'static str> },

    #[error("image file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("invalid image url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Failures on first materialization of a lazy image. Never raised at
/// construction time.
#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("failed to read image file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to fetch image from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Schema-construction failures. Messages carry the accepted values so a
/// caller can correct the request without consulting the docs.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("unrecognized control mode {mode:?}, valid modes are: {}", .valid.join(", "))]
    UnknownMode {
        mode: String,
        valid: Vec<&'static str>,
    },

    #[error("{first} and {second} are mutually exclusive, set only one")]
    ConflictingFields {
        first: &'static str,
        second: &'static str,
    },

    #[error("unsupported image input, accepted forms are: {accepted}")]
    UnsupportedInput { accepted: &'static str },

    #[error(transparent)]
    Source(#[from] ImageSourceError),
}

/// Failures while resolving a path-or-url reference to a local file.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(
        "unauthorized access to gated resource {url}: this resource requires an access token; \
         log in with `huggingface-cli login` or set HF_TOKEN to a user access token"
    )]
    Unauthorized { url: String },

    #[error("request for {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("http client setup failed: {0}")]
    Client(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
