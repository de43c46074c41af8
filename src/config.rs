use crate::error::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0:9999".to_string()
}

// Card photos arrive base64-encoded, so allow ~4/3 of a multi-megapixel JPEG.
fn default_max_message_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    pub cccd_images_dir: PathBuf,
    pub captured_faces_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    pub detector_path: PathBuf,
    pub recognizer_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
    #[serde(default = "default_normalization")]
    pub normalization_mean: f32,
    #[serde(default = "default_normalization")]
    pub normalization_std: f32,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }
fn default_normalization() -> f32 { 128.0 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            detection_confidence: default_detection_confidence(),
            normalization_mean: default_normalization(),
            normalization_std: default_normalization(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_recognizer_input")]
    pub input_size: u32,
    #[serde(default = "default_normalization")]
    pub normalization_value: f32,
}

fn default_recognizer_input() -> u32 { 112 }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: default_recognizer_input(),
            normalization_value: default_normalization(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VerificationConfig {
    /// Distance threshold for the library-native criterion (lower is stricter).
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,
    /// Second criterion: derived confidence must be at least this value.
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,
    /// Matches at or above this confidence are reported as high confidence.
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f32,
}

fn default_tolerance() -> f32 { 0.55 }
fn default_confidence_floor() -> f32 { 0.50 }
fn default_high_confidence() -> f32 { 0.75 }

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            confidence_floor: default_confidence_floor(),
            high_confidence: default_high_confidence(),
        }
    }
}

impl Config {
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "Config file not found: {}. Please create it from the example.",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| VerifyError::Other(anyhow::anyhow!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_message_bytes == 0 {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "max_message_bytes must be greater than 0"
            )));
        }

        if self.verification.tolerance <= 0.0 || self.verification.tolerance > 1.0 {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "Tolerance must be between 0.0 and 1.0, got {}",
                self.verification.tolerance
            )));
        }
        if self.verification.confidence_floor < 0.0 || self.verification.confidence_floor > 1.0 {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "Confidence floor must be between 0.0 and 1.0, got {}",
                self.verification.confidence_floor
            )));
        }
        if self.verification.high_confidence < self.verification.confidence_floor
            || self.verification.high_confidence > 1.0
        {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "High-confidence threshold must be between the confidence floor and 1.0, got {}",
                self.verification.high_confidence
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_width > 4096 {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "Detector input width must be between 1 and 4096, got {}",
                self.detector.input_width
            )));
        }
        if self.detector.input_height == 0 || self.detector.input_height > 4096 {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "Detector input height must be between 1 and 4096, got {}",
                self.detector.input_height
            )));
        }
        if self.detector.detection_confidence < 0.0 || self.detector.detection_confidence > 1.0 {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.detection_confidence
            )));
        }

        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(VerifyError::Other(anyhow::anyhow!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }

        Ok(())
    }
}
