//! Deferred-loading image handles.
//!
//! Request graphs routinely reference many images that are never used by the
//! sampler that ends up running. A [`LazyImage`] validates its source eagerly
//! but performs no file, network, or decode work until the pixels are first
//! asked for, so building a large request stays free of I/O.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use image::DynamicImage;
use reqwest::Url;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::{ImageLoadError, ImageSourceError, ValidationError};
use crate::util;

/// Remote fetches are bounded; file and base64 loads are not.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// How far into a string we look for a path-like token before assuming the
/// string is a base64 payload.
const PATH_SCAN_PREFIX: usize = 50;

/// Where the pixels will come from on first materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Url(Url),
    Base64(String),
    /// Decoded at construction; the cache cell is pre-populated.
    Decoded,
}

/// An image handle that defers loading until first access.
///
/// Exactly one source is configured at construction. The decoded buffer is
/// owned by this instance and populated at most once.
pub struct LazyImage {
    source: ImageSource,
    loaded: OnceLock<DynamicImage>,
}

impl LazyImage {
    /// Wraps a file path. The file must exist now; it is read later.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ImageSourceError> {
        let path = path.into();
        if !path.exists() {
            return Err(ImageSourceError::FileNotFound(path));
        }
        Ok(Self {
            source: ImageSource::Path(path),
            loaded: OnceLock::new(),
        })
    }

    /// Wraps a remote url, which must parse as http(s) with a host.
    pub fn from_url(url: &str) -> Result<Self, ImageSourceError> {
        let parsed = Url::parse(url).map_err(|e| ImageSourceError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ImageSourceError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {:?}", parsed.scheme()),
            });
        }
        if parsed.host_str().is_none() {
            return Err(ImageSourceError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".to_string(),
            });
        }
        Ok(Self {
            source: ImageSource::Url(parsed),
            loaded: OnceLock::new(),
        })
    }

    /// Wraps a base64-encoded image payload. Decoded lazily, so a corrupt
    /// payload only surfaces on first access.
    pub fn from_base64(data: impl Into<String>) -> Self {
        Self {
            source: ImageSource::Base64(data.into()),
            loaded: OnceLock::new(),
        }
    }

    /// Wraps an already-decoded image. No further I/O will ever happen.
    pub fn from_image(img: DynamicImage) -> Self {
        let loaded = OnceLock::new();
        let _ = loaded.set(img);
        Self {
            source: ImageSource::Decoded,
            loaded,
        }
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    /// True once the pixel buffer has been populated.
    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Loads and caches the decoded image. Idempotent: the first call does
    /// the configured I/O, every later call returns the cached buffer.
    pub fn materialize(&self) -> Result<&DynamicImage, ImageLoadError> {
        if let Some(img) = self.loaded.get() {
            return Ok(img);
        }
        let img = match &self.source {
            ImageSource::Path(path) => {
                debug!(path = %path.display(), "loading image from file");
                let bytes = fs::read(path).map_err(|source| ImageLoadError::Read {
                    path: path.clone(),
                    source,
                })?;
                util::decode_image(&bytes)?
            }
            ImageSource::Url(url) => {
                debug!(%url, "fetching image");
                let bytes = fetch_image_bytes(url)?;
                util::decode_image(&bytes)?
            }
            ImageSource::Base64(data) => util::image_from_base64(data)?,
            // from_image pre-populates the cell, so the early return above
            // already covered this source.
            ImageSource::Decoded => {
                return Err(ImageLoadError::Fetch {
                    url: String::new(),
                    reason: "decoded image cell was empty".to_string(),
                })
            }
        };
        Ok(self.loaded.get_or_init(|| img))
    }

    /// The decoded image, loading it first if needed.
    pub fn image(&self) -> Result<&DynamicImage, ImageLoadError> {
        self.materialize()
    }

    pub fn width(&self) -> Result<u32, ImageLoadError> {
        Ok(self.materialize()?.width())
    }

    pub fn height(&self) -> Result<u32, ImageLoadError> {
        Ok(self.materialize()?.height())
    }

    pub fn dimensions(&self) -> Result<(u32, u32), ImageLoadError> {
        let img = self.materialize()?;
        Ok((img.width(), img.height()))
    }

    /// Encodes the image as a base64 PNG string, materializing it first.
    pub fn to_base64_png(&self) -> Result<String, ImageLoadError> {
        Ok(util::image_to_base64_png(self.materialize()?)?)
    }

    /// Normalizes any accepted input shape into a lazy image.
    pub fn normalize(input: ImageInput) -> Result<Self, ValidationError> {
        input.try_into()
    }
}

impl Clone for LazyImage {
    fn clone(&self) -> Self {
        let loaded = OnceLock::new();
        if let Some(img) = self.loaded.get() {
            let _ = loaded.set(img.clone());
        }
        Self {
            source: self.source.clone(),
            loaded,
        }
    }
}

// Debug and equality must stay I/O-free; both look only at the source and at
// whatever has already been loaded.
impl std::fmt::Debug for LazyImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyImage")
            .field("source", &self.source)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl PartialEq for LazyImage {
    fn eq(&self, other: &Self) -> bool {
        if self.source != other.source {
            return false;
        }
        match (&self.source, self.loaded.get(), other.loaded.get()) {
            (ImageSource::Decoded, Some(a), Some(b)) => a == b,
            (ImageSource::Decoded, _, _) => false,
            _ => true,
        }
    }
}

impl From<DynamicImage> for LazyImage {
    fn from(img: DynamicImage) -> Self {
        Self::from_image(img)
    }
}

impl Serialize for LazyImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = self.to_base64_png().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for LazyImage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let input = ImageInput::deserialize(deserializer).map_err(|_| {
            D::Error::custom(ValidationError::UnsupportedInput {
                accepted: "a path string, a base64 string, or a mapping of \
                           constructor arguments (path, url, base64)",
            })
        })?;
        LazyImage::normalize(input).map_err(D::Error::custom)
    }
}

/// Constructor arguments accepted as a mapping. Exactly one field must be
/// set; zero or several is a construction error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LazyImageSpec {
    pub path: Option<PathBuf>,
    pub url: Option<String>,
    pub base64: Option<String>,
}

impl LazyImageSpec {
    pub fn build(self) -> Result<LazyImage, ImageSourceError> {
        let mut set = Vec::new();
        if self.path.is_some() {
            set.push("path");
        }
        if self.url.is_some() {
            set.push("url");
        }
        if self.base64.is_some() {
            set.push("base64");
        }
        match set.len() {
            0 => Err(ImageSourceError::NoSource),
            1 => {
                if let Some(path) = self.path {
                    LazyImage::from_path(path)
                } else if let Some(url) = self.url {
                    LazyImage::from_url(&url)
                } else if let Some(data) = self.base64 {
                    Ok(LazyImage::from_base64(data))
                } else {
                    Err(ImageSourceError::NoSource)
                }
            }
            _ => Err(ImageSourceError::MultipleSources { got: set }),
        }
    }
}

/// Every shape a schema image field accepts at the boundary.
///
/// A plain string is treated as a file path when a path-like token appears in
/// its first [`PATH_SCAN_PREFIX`] characters, otherwise as a base64 payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ImageInput {
    Text(String),
    Spec(LazyImageSpec),
}

// Only `.` qualifies as a path token: base64's alphabet includes `/` and
// `+` but never `.`, while file names nearly always carry an extension.
fn looks_like_path(value: &str) -> bool {
    value.chars().take(PATH_SCAN_PREFIX).any(|c| c == '.')
}

impl TryFrom<ImageInput> for LazyImage {
    type Error = ValidationError;

    fn try_from(input: ImageInput) -> Result<Self, Self::Error> {
        match input {
            ImageInput::Text(value) => {
                if looks_like_path(&value) {
                    Ok(LazyImage::from_path(Path::new(&value))?)
                } else {
                    Ok(LazyImage::from_base64(value))
                }
            }
            ImageInput::Spec(spec) => Ok(spec.build()?),
        }
    }
}

fn fetch_image_bytes(url: &Url) -> Result<Vec<u8>, ImageLoadError> {
    let map_err = |e: reqwest::Error| ImageLoadError::Fetch {
        url: url.to_string(),
        reason: e.to_string(),
    };
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(map_err)?;
    let response = client
        .get(url.clone())
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(map_err)?;
    let bytes = response.bytes().map_err(map_err)?;
    Ok(bytes.to_vec())
}
