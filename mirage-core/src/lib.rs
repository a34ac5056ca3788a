pub mod debug_info;
pub mod device_map;
pub mod downloads;
pub mod error;
pub mod lazy_image;
pub mod schema;
mod util;

pub use debug_info::{runtime_info, RuntimeInfo};
pub use device_map::*;
pub use downloads::{DownloadCache, HttpFetcher, RemoteFetcher, HUGGINGFACE_DOMAIN};
pub use error::{DownloadError, ImageLoadError, ImageSourceError, ValidationError};
pub use lazy_image::{ImageInput, ImageSource, LazyImage, LazyImageSpec};
pub use schema::{
    ControlInput, ControlMode, ImageRequest, ImageRequestBuilder, WeightedPrompt, CONTROL_MODES,
};
pub use util::{decode_image, image_from_base64, image_to_base64_png};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
