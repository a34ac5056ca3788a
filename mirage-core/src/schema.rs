//! Validated request schemas for the generation pipeline.
//!
//! Every numeric strength is range-checked at construction, defaults
//! included, so an [`ImageRequest`] that exists is a request the sampler can
//! run without re-validating anything.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::lazy_image::LazyImage;

pub const DEFAULT_PROMPT_WEIGHT: f32 = 1.0;
pub const DEFAULT_CONTROL_STRENGTH: f32 = 1.0;
pub const DEFAULT_INIT_IMAGE_STRENGTH: f32 = 0.2;
pub const DEFAULT_PROMPT_IMAGE_STRENGTH: f32 = 0.5;
pub const DEFAULT_PROMPT_STRENGTH: f32 = 7.5;

/// Recognized control-input shortcuts, matching the conditioning networks the
/// pipeline ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Canny,
    Depth,
    Normal,
    Hed,
    Openpose,
    Shuffle,
    Edit,
    Inpaint,
    Details,
    Colorize,
    Qrcode,
}

pub const CONTROL_MODES: &[&str] = &[
    "canny", "depth", "normal", "hed", "openpose", "shuffle", "edit", "inpaint", "details",
    "colorize", "qrcode",
];

serde_plain::derive_display_from_serialize!(ControlMode);

impl std::str::FromStr for ControlMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_plain::from_str(s).map_err(|_| ValidationError::UnknownMode {
            mode: s.to_string(),
            valid: CONTROL_MODES.to_vec(),
        })
    }
}

fn check_range(
    field: &'static str,
    value: f32,
    min: f32,
    max: f32,
) -> Result<f32, ValidationError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

/// A text fragment paired with a relative influence weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWeightedPrompt")]
pub struct WeightedPrompt {
    text: String,
    weight: f32,
}

#[derive(Deserialize)]
struct RawWeightedPrompt {
    text: String,
    weight: Option<f32>,
}

impl WeightedPrompt {
    /// A prompt with the default weight. The default still runs through
    /// range validation.
    pub fn new(text: impl Into<String>) -> Result<Self, ValidationError> {
        Self::with_weight(text, DEFAULT_PROMPT_WEIGHT)
    }

    pub fn with_weight(text: impl Into<String>, weight: f32) -> Result<Self, ValidationError> {
        Ok(Self {
            text: text.into(),
            weight: check_range("prompt weight", weight, 0.0, f32::INFINITY)?,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }
}

impl TryFrom<RawWeightedPrompt> for WeightedPrompt {
    type Error = ValidationError;

    fn try_from(raw: RawWeightedPrompt) -> Result<Self, Self::Error> {
        match raw.weight {
            Some(weight) => Self::with_weight(raw.text, weight),
            None => Self::new(raw.text),
        }
    }
}

/// An auxiliary conditioning image with a mode and strength.
///
/// `image` carries a reference the pipeline will preprocess for the mode;
/// `image_raw` carries one that is passed through untouched. At most one of
/// the two may be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawControlInput")]
pub struct ControlInput {
    mode: ControlMode,
    image: Option<LazyImage>,
    image_raw: Option<LazyImage>,
    strength: f32,
}

#[derive(Deserialize)]
struct RawControlInput {
    mode: String,
    image: Option<LazyImage>,
    image_raw: Option<LazyImage>,
    strength: Option<f32>,
}

impl ControlInput {
    pub fn new(
        mode: ControlMode,
        image: Option<LazyImage>,
        image_raw: Option<LazyImage>,
        strength: Option<f32>,
    ) -> Result<Self, ValidationError> {
        if image.is_some() && image_raw.is_some() {
            return Err(ValidationError::ConflictingFields {
                first: "image",
                second: "image_raw",
            });
        }
        let strength = check_range(
            "control strength",
            strength.unwrap_or(DEFAULT_CONTROL_STRENGTH),
            0.0,
            1000.0,
        )?;
        Ok(Self {
            mode,
            image,
            image_raw,
            strength,
        })
    }

    pub fn mode(&self) -> ControlMode {
        self.mode
    }

    pub fn image(&self) -> Option<&LazyImage> {
        self.image.as_ref()
    }

    pub fn image_raw(&self) -> Option<&LazyImage> {
        self.image_raw.as_ref()
    }

    pub fn strength(&self) -> f32 {
        self.strength
    }
}

impl TryFrom<RawControlInput> for ControlInput {
    type Error = ValidationError;

    fn try_from(raw: RawControlInput) -> Result<Self, Self::Error> {
        let mode = raw.mode.parse()?;
        Self::new(mode, raw.image, raw.image_raw, raw.strength)
    }
}

/// A fully validated top-level generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawImageRequest")]
pub struct ImageRequest {
    prompts: Vec<WeightedPrompt>,
    negative_prompts: Vec<WeightedPrompt>,
    init_image: Option<LazyImage>,
    init_image_strength: f32,
    prompt_images: Vec<LazyImage>,
    prompt_image_strength: f32,
    control_inputs: Vec<ControlInput>,
    prompt_strength: f32,
}

#[derive(Deserialize)]
struct RawImageRequest {
    #[serde(default)]
    prompts: Vec<WeightedPrompt>,
    #[serde(default)]
    negative_prompts: Vec<WeightedPrompt>,
    init_image: Option<LazyImage>,
    init_image_strength: Option<f32>,
    #[serde(default)]
    prompt_images: Vec<LazyImage>,
    prompt_image_strength: Option<f32>,
    #[serde(default)]
    control_inputs: Vec<ControlInput>,
    prompt_strength: Option<f32>,
}

impl ImageRequest {
    pub fn builder() -> ImageRequestBuilder {
        ImageRequestBuilder::default()
    }

    pub fn prompts(&self) -> &[WeightedPrompt] {
        &self.prompts
    }

    pub fn negative_prompts(&self) -> &[WeightedPrompt] {
        &self.negative_prompts
    }

    pub fn init_image(&self) -> Option<&LazyImage> {
        self.init_image.as_ref()
    }

    pub fn init_image_strength(&self) -> f32 {
        self.init_image_strength
    }

    pub fn prompt_images(&self) -> &[LazyImage] {
        &self.prompt_images
    }

    pub fn prompt_image_strength(&self) -> f32 {
        self.prompt_image_strength
    }

    pub fn control_inputs(&self) -> &[ControlInput] {
        &self.control_inputs
    }

    pub fn prompt_strength(&self) -> f32 {
        self.prompt_strength
    }
}

impl TryFrom<RawImageRequest> for ImageRequest {
    type Error = ValidationError;

    fn try_from(raw: RawImageRequest) -> Result<Self, Self::Error> {
        let mut builder = ImageRequestBuilder {
            prompts: raw.prompts,
            negative_prompts: raw.negative_prompts,
            init_image: raw.init_image,
            prompt_images: raw.prompt_images,
            control_inputs: raw.control_inputs,
            ..Default::default()
        };
        builder.init_image_strength = raw.init_image_strength;
        builder.prompt_image_strength = raw.prompt_image_strength;
        builder.prompt_strength = raw.prompt_strength;
        builder.build()
    }
}

/// Collects request fields and validates everything, defaults included, in
/// [`ImageRequestBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct ImageRequestBuilder {
    prompts: Vec<WeightedPrompt>,
    negative_prompts: Vec<WeightedPrompt>,
    init_image: Option<LazyImage>,
    init_image_strength: Option<f32>,
    prompt_images: Vec<LazyImage>,
    prompt_image_strength: Option<f32>,
    control_inputs: Vec<ControlInput>,
    prompt_strength: Option<f32>,
}

impl ImageRequestBuilder {
    pub fn prompt(mut self, prompt: WeightedPrompt) -> Self {
        self.prompts.push(prompt);
        self
    }

    pub fn negative_prompt(mut self, prompt: WeightedPrompt) -> Self {
        self.negative_prompts.push(prompt);
        self
    }

    pub fn init_image(mut self, image: LazyImage) -> Self {
        self.init_image = Some(image);
        self
    }

    pub fn init_image_strength(mut self, strength: f32) -> Self {
        self.init_image_strength = Some(strength);
        self
    }

    pub fn prompt_image(mut self, image: LazyImage) -> Self {
        self.prompt_images.push(image);
        self
    }

    pub fn prompt_image_strength(mut self, strength: f32) -> Self {
        self.prompt_image_strength = Some(strength);
        self
    }

    pub fn control_input(mut self, input: ControlInput) -> Self {
        self.control_inputs.push(input);
        self
    }

    pub fn prompt_strength(mut self, strength: f32) -> Self {
        self.prompt_strength = Some(strength);
        self
    }

    pub fn build(self) -> Result<ImageRequest, ValidationError> {
        Ok(ImageRequest {
            prompts: self.prompts,
            negative_prompts: self.negative_prompts,
            init_image: self.init_image,
            init_image_strength: check_range(
                "init image strength",
                self.init_image_strength
                    .unwrap_or(DEFAULT_INIT_IMAGE_STRENGTH),
                0.0,
                1.0,
            )?,
            prompt_images: self.prompt_images,
            prompt_image_strength: check_range(
                "prompt image strength",
                self.prompt_image_strength
                    .unwrap_or(DEFAULT_PROMPT_IMAGE_STRENGTH),
                0.0,
                1.0,
            )?,
            control_inputs: self.control_inputs,
            prompt_strength: check_range(
                "prompt strength",
                self.prompt_strength.unwrap_or(DEFAULT_PROMPT_STRENGTH),
                -50.0,
                50.0,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0.0; "zero")]
    #[test_case(1.0; "default")]
    #[test_case(2.5; "heavier")]
    fn prompt_weight_in_range_is_accepted(weight: f32) {
        assert!(WeightedPrompt::with_weight("a cat", weight).is_ok());
    }

    #[test_case(-0.1)]
    #[test_case(f32::NAN)]
    #[test_case(f32::NEG_INFINITY)]
    fn prompt_weight_out_of_range_is_rejected(weight: f32) {
        let err = WeightedPrompt::with_weight("a cat", weight).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test]
    fn prompt_default_weight_is_validated_and_applied() {
        let prompt = WeightedPrompt::new("a cat").unwrap();
        assert_eq!(prompt.weight(), DEFAULT_PROMPT_WEIGHT);
    }

    #[test]
    fn unknown_mode_error_lists_all_valid_modes() {
        let err = "sketch".parse::<ControlMode>().unwrap_err();
        match &err {
            ValidationError::UnknownMode { mode, valid } => {
                assert_eq!(mode, "sketch");
                assert_eq!(valid.as_slice(), CONTROL_MODES);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let msg = err.to_string();
        for mode in CONTROL_MODES {
            assert!(msg.contains(mode), "{msg:?} missing {mode}");
        }
    }

    #[test]
    fn every_registered_mode_parses() {
        for mode in CONTROL_MODES {
            assert!(mode.parse::<ControlMode>().is_ok(), "{mode} failed");
        }
    }

    #[test]
    fn control_input_rejects_both_image_fields() {
        let a = LazyImage::from_base64("aGVsbG8=");
        let b = LazyImage::from_base64("d29ybGQ=");
        let err = ControlInput::new(ControlMode::Canny, Some(a), Some(b), None).unwrap_err();
        assert!(matches!(err, ValidationError::ConflictingFields { .. }));
    }

    #[test]
    fn control_input_accepts_exactly_one_image_field() {
        let img = LazyImage::from_base64("aGVsbG8=");
        assert!(ControlInput::new(ControlMode::Depth, Some(img.clone()), None, None).is_ok());
        assert!(ControlInput::new(ControlMode::Depth, None, Some(img), None).is_ok());
        assert!(ControlInput::new(ControlMode::Depth, None, None, None).is_ok());
    }

    #[test_case(-1.0)]
    #[test_case(1000.5)]
    fn control_strength_out_of_range_is_rejected(strength: f32) {
        let err = ControlInput::new(ControlMode::Canny, None, None, Some(strength)).unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test]
    fn request_defaults_are_validated_and_applied() {
        let request = ImageRequest::builder()
            .prompt(WeightedPrompt::new("a rusty robot on a beach").unwrap())
            .build()
            .unwrap();
        assert_eq!(request.init_image_strength(), DEFAULT_INIT_IMAGE_STRENGTH);
        assert_eq!(
            request.prompt_image_strength(),
            DEFAULT_PROMPT_IMAGE_STRENGTH
        );
        assert_eq!(request.prompt_strength(), DEFAULT_PROMPT_STRENGTH);
    }

    #[test_case(-0.1; "below")]
    #[test_case(1.1; "above")]
    fn init_image_strength_out_of_range_is_rejected(strength: f32) {
        let err = ImageRequest::builder()
            .init_image_strength(strength)
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test_case(-0.1; "below")]
    #[test_case(1.1; "above")]
    fn prompt_image_strength_out_of_range_is_rejected(strength: f32) {
        let err = ImageRequest::builder()
            .prompt_image_strength(strength)
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test_case(-50.1; "below")]
    #[test_case(50.1; "above")]
    fn prompt_strength_out_of_range_is_rejected(strength: f32) {
        let err = ImageRequest::builder()
            .prompt_strength(strength)
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::OutOfRange { .. }));
    }

    #[test]
    fn deserialization_runs_the_same_validation() {
        let ok: Result<ImageRequest, _> = serde_json::from_str(
            r#"{
                "prompts": [{ "text": "a cat" }],
                "control_inputs": [{ "mode": "canny", "strength": 0.7 }],
                "prompt_strength": 12.0
            }"#,
        );
        let request = ok.unwrap();
        assert_eq!(request.prompts()[0].weight(), DEFAULT_PROMPT_WEIGHT);
        assert_eq!(request.control_inputs()[0].mode(), ControlMode::Canny);

        let bad: Result<ImageRequest, _> =
            serde_json::from_str(r#"{ "prompt_strength": 99.0 }"#);
        assert!(bad.is_err());

        let bad_mode: Result<ImageRequest, _> = serde_json::from_str(
            r#"{ "control_inputs": [{ "mode": "sketch" }] }"#,
        );
        let msg = bad_mode.unwrap_err().to_string();
        assert!(msg.contains("canny"));
    }
}
