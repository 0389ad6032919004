//! # Anonymization settings
//!
//! The configuration is loaded once, validated, and then passed by reference
//! to every rewriting, aggregation and noise function.
//!

use serde::{Deserialize, Serialize};
use std::{error, fmt, result};

/// Upper bound of every numeric setting
pub const MAX_NUMERIC_CONFIG: u32 = 1000;
/// Upper bound of the noise cutoff
pub const MAX_NOISE_CUTOFF: f64 = 1e7;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    InvalidConfig(String),
    ParsingError(String),
}

impl Error {
    pub fn invalid_config(desc: impl fmt::Display) -> Error {
        Error::InvalidConfig(desc.to_string())
    }
    pub fn parsing_error(desc: impl fmt::Display) -> Error {
        Error::ParsingError(desc.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidConfig(desc) => writeln!(f, "InvalidConfig: {}", desc),
            Error::ParsingError(desc) => writeln!(f, "ParsingError: {}", desc),
        }
    }
}

impl error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParsingError(err.to_string())
    }
}

pub type Result<T> = result::Result<T, Error>;

/// What a user without a special role may see
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Queries run untouched
    #[default]
    Direct,
    /// Queries are anonymized before they run
    Publish,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::Direct => write!(f, "direct"),
            AccessLevel::Publish => write!(f, "publish"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Access level for users without special roles
    pub default_access_level: AccessLevel,
    /// Seed used for initializing noise layers
    pub noise_seed: String,
    /// Standard deviation of noise added to aggregates
    pub noise_sigma: f64,
    /// Maximum absolute noise value
    pub noise_cutoff: f64,
    /// The minimum number of distinct AIDs that can be in a reported bucket
    pub minimum_allowed_aids: u32,
    /// Minimum outlier count (inclusive)
    pub outlier_count_min: u32,
    /// Maximum outlier count (inclusive)
    pub outlier_count_max: u32,
    /// Minimum top contributors count (inclusive)
    pub top_count_min: u32,
    /// Maximum top contributors count (inclusive)
    pub top_count_max: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_access_level: AccessLevel::Direct,
            noise_seed: "diffix".to_string(),
            noise_sigma: 1.0,
            noise_cutoff: 5.0,
            minimum_allowed_aids: 2,
            outlier_count_min: 1,
            outlier_count_max: 2,
            top_count_min: 4,
            top_count_max: 6,
        }
    }
}

fn check_range<T: PartialOrd + fmt::Display>(name: &str, value: T, min: T, max: T) -> Result<()> {
    if value < min || value > max {
        Err(Error::invalid_config(format!(
            "{name} = {value} is out of range [{min}, {max}]"
        )))
    } else {
        Ok(())
    }
}

impl Config {
    /// Parse a JSON configuration, missing settings take their default value
    pub fn from_json(json: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        log::debug!("Config {}", config);
        Ok(config)
    }

    pub fn with_noise_seed<S: Into<String>>(mut self, noise_seed: S) -> Self {
        self.noise_seed = noise_seed.into();
        self
    }

    pub fn with_noise(mut self, noise_sigma: f64, noise_cutoff: f64) -> Self {
        self.noise_sigma = noise_sigma;
        self.noise_cutoff = noise_cutoff;
        self
    }

    pub fn with_minimum_allowed_aids(mut self, minimum_allowed_aids: u32) -> Self {
        self.minimum_allowed_aids = minimum_allowed_aids;
        self
    }

    pub fn with_outlier_count(mut self, min: u32, max: u32) -> Self {
        self.outlier_count_min = min;
        self.outlier_count_max = max;
        self
    }

    pub fn with_top_count(mut self, min: u32, max: u32) -> Self {
        self.top_count_min = min;
        self.top_count_max = max;
        self
    }

    pub fn with_access_level(mut self, access_level: AccessLevel) -> Self {
        self.default_access_level = access_level;
        self
    }

    /// Check the settings are mutually consistent
    pub fn validate(&self) -> Result<()> {
        if !self.noise_sigma.is_finite() {
            return Err(Error::invalid_config("noise_sigma must be finite"));
        }
        if !self.noise_cutoff.is_finite() {
            return Err(Error::invalid_config("noise_cutoff must be finite"));
        }
        check_range("noise_sigma", self.noise_sigma, 0., MAX_NUMERIC_CONFIG as f64)?;
        check_range("noise_cutoff", self.noise_cutoff, 0., MAX_NOISE_CUTOFF)?;
        check_range("minimum_allowed_aids", self.minimum_allowed_aids, 2, MAX_NUMERIC_CONFIG)?;
        check_range("outlier_count_min", self.outlier_count_min, 0, MAX_NUMERIC_CONFIG)?;
        check_range("outlier_count_max", self.outlier_count_max, 0, MAX_NUMERIC_CONFIG)?;
        check_range("top_count_min", self.top_count_min, 1, MAX_NUMERIC_CONFIG)?;
        check_range("top_count_max", self.top_count_max, 1, MAX_NUMERIC_CONFIG)?;
        if self.outlier_count_min > self.outlier_count_max {
            return Err(Error::invalid_config(
                "outlier_count_min must not be greater than outlier_count_max",
            ));
        }
        if self.top_count_min > self.top_count_max {
            return Err(Error::invalid_config(
                "top_count_min must not be greater than top_count_max",
            ));
        }
        Ok(())
    }

    /// Number of contributors a contribution tracker has to rank
    pub fn top_contributors_capacity(&self) -> usize {
        (self.outlier_count_max + self.top_count_max) as usize
    }

    /// Queries run at this access level must be anonymized
    pub fn requires_anonymization(&self, access_level: Option<AccessLevel>) -> bool {
        access_level.unwrap_or(self.default_access_level) == AccessLevel::Publish
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{DIFFIX_CONFIG :default_access_level {} :noise_seed \"{}\"",
            self.default_access_level, self.noise_seed,
        )?;
        write!(
            f,
            " :noise_sigma {:.6} :noise_cutoff {:.6} :minimum_allowed_aids {}",
            self.noise_sigma, self.noise_cutoff, self.minimum_allowed_aids,
        )?;
        write!(
            f,
            " :outlier_count_min {} :outlier_count_max {} :top_count_min {} :top_count_max {}}}",
            self.outlier_count_min, self.outlier_count_max, self.top_count_min, self.top_count_max,
        )
    }
}
