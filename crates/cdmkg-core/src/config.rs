//! cdmkg Configuration Management
//!
//! Handles configuration from environment variables and TOML files,
//! with defaults matching the free-tier settings used for the paper runs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Document segmentation
    pub segmentation: SegmentationConfig,

    /// Triple extraction runs
    pub extraction: ExtractionConfig,

    /// Retrieval evaluation
    pub evaluation: EvaluationConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // LLM
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider.parse()?;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.llm.openai_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.llm.openai_base_url = Some(url);
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            config.llm.ollama_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }

        // Extraction
        if let Ok(workers) = std::env::var("EXTRACT_CONCURRENCY") {
            config.extraction.concurrency =
                workers.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "EXTRACT_CONCURRENCY".to_string(),
                    value: workers,
                })?;
        }
        if let Ok(attempts) = std::env::var("EXTRACT_MAX_ATTEMPTS") {
            config.extraction.max_attempts =
                attempts.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "EXTRACT_MAX_ATTEMPTS".to_string(),
                    value: attempts,
                })?;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        let env_config = Self::from_env()?;
        let defaults = Self::default();

        // Only override if env values differ from defaults
        if env_config.llm.provider != defaults.llm.provider {
            self.llm.provider = env_config.llm.provider;
        }
        if env_config.llm.model != defaults.llm.model {
            self.llm.model = env_config.llm.model;
        }
        if env_config.llm.ollama_url != defaults.llm.ollama_url {
            self.llm.ollama_url = env_config.llm.ollama_url;
        }
        if env_config.extraction.concurrency != defaults.extraction.concurrency {
            self.extraction.concurrency = env_config.extraction.concurrency;
        }
        if env_config.extraction.max_attempts != defaults.extraction.max_attempts {
            self.extraction.max_attempts = env_config.extraction.max_attempts;
        }
        if env_config.logging.level != defaults.logging.level {
            self.logging.level = env_config.logging.level;
        }

        // Always use env for sensitive values
        if env_config.llm.openai_api_key.is_some() {
            self.llm.openai_api_key = env_config.llm.openai_api_key;
        }
        if env_config.llm.openai_base_url.is_some() {
            self.llm.openai_base_url = env_config.llm.openai_base_url;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extraction.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "extraction.concurrency".to_string(),
                value: "0".to_string(),
            });
        }
        if self.extraction.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "extraction.max_attempts".to_string(),
                value: "0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.evaluation.min_token_recall) {
            return Err(ConfigError::InvalidValue {
                key: "evaluation.min_token_recall".to_string(),
                value: self.evaluation.min_token_recall.to_string(),
            });
        }
        if self.segmentation.mode == SegmentationMode::MaxLength
            && self.segmentation.max_segment_chars.is_none()
        {
            return Err(ConfigError::MissingRequired(
                "segmentation.max_segment_chars (required in max_length mode)".to_string(),
            ));
        }
        Ok(())
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// LLM provider to use
    pub provider: LlmProvider,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// OpenAI API base URL (for Azure or compatible APIs)
    pub openai_base_url: Option<String>,

    /// Ollama server URL
    pub ollama_url: String,

    /// Model name to use
    pub model: String,

    /// Maximum tokens for completion
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// HTTP timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            openai_api_key: None,
            openai_base_url: None,
            ollama_url: "http://localhost:11434".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
            temperature: 0.0,
            timeout_secs: 120,
        }
    }
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Ollama,
    Azure,
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            "azure" => Ok(Self::Azure),
            _ => Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// How the source text is cut into segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    /// One segment per boundary marker ("Milestone N:")
    Markers,
    /// Paragraphs packed up to a length threshold
    MaxLength,
}

/// Segmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub mode: SegmentationMode,

    /// Regex marking the start of an atomic block
    pub marker_pattern: String,

    /// Length threshold in characters
    pub max_segment_chars: Option<usize>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            mode: SegmentationMode::Markers,
            marker_pattern: r"(?i)\bmilestone\s+\d+\s*:".to_string(),
            max_segment_chars: Some(6000),
        }
    }
}

/// What the aggregator does when a segment is extracted a second time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReextractPolicy {
    /// Reject with `DuplicateSegment` (append-only table)
    #[default]
    Reject,
    /// Replace the segment's unannotated rows
    Overwrite,
}

/// Triple extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Total attempts per segment, including the first
    pub max_attempts: u32,

    /// First retry delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay
    pub max_backoff_ms: u64,

    /// Segments extracted concurrently
    pub concurrency: usize,

    /// Minimum gap between consecutive service calls
    pub request_interval_ms: u64,

    /// Per-call timeout in seconds
    pub request_timeout_secs: u64,

    /// Time in-flight calls get to finish after cancellation
    pub cancel_grace_secs: u64,

    pub reextract_policy: ReextractPolicy,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            // Free-tier rate limits: one worker, four seconds between calls
            concurrency: 1,
            request_interval_ms: 4_000,
            request_timeout_secs: 180,
            cancel_grace_secs: 30,
            reextract_policy: ReextractPolicy::Reject,
        }
    }
}

/// Rows the evaluator may retrieve from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowFilter {
    /// Only rows annotated `good = true`
    #[default]
    GoodOnly,
    /// Every row regardless of annotation
    All,
}

/// Answer correctness criterion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Normalised equality with a retrieved subject/object or the answer
    Exact,
    /// Normalised substring, or token recall at least `min_token_recall`
    #[default]
    Fuzzy,
}

/// Retrieval evaluation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Triples in the short context window
    pub short_window: usize,

    /// Upper bound on triples in the long context window
    pub long_window: usize,

    pub match_mode: MatchMode,

    /// Fraction of expected-answer tokens required by fuzzy matching
    pub min_token_recall: f64,

    pub row_filter: RowFilter,

    /// Ask the LLM to answer from the window instead of scoring the window
    pub llm_answers: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            short_window: 5,
            long_window: 200,
            match_mode: MatchMode::Fuzzy,
            min_token_recall: 0.8,
            row_filter: RowFilter::GoodOnly,
            llm_answers: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,

    /// Include file/line in logs
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            include_location: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}
