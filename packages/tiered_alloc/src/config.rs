use serde::{Deserialize, Serialize};

use crate::{ConfigError, Tier};

pub(crate) const DEFAULT_SMALL_POOL_SIZE: u64 = 1 << 20;
pub(crate) const DEFAULT_MEDIUM_POOL_SIZE: u64 = 1 << 24;
pub(crate) const DEFAULT_LARGE_POOL_SIZE: u64 = 1 << 28;

const DEFAULT_GROWTH_FACTOR: f64 = 1.3;

const DEFAULT_LOW_WATERMARK: f64 = 0.50;
const DEFAULT_MEDIUM_WATERMARK: f64 = 0.75;
const DEFAULT_HIGH_WATERMARK: f64 = 0.85;
const DEFAULT_CRITICAL_WATERMARK: f64 = 0.95;

const DEFAULT_COOLDOWN_CYCLES: i32 = 5;
const DEFAULT_CHECKPOINT_FREQ: i32 = 100;
const DEFAULT_MAX_CACHE_ENTRIES: i32 = 1000;

/// Schema version of an [`AllocatorConfig`].
///
/// The version decides which validation rules apply. Documents that declare any other
/// version are rejected with [`ConfigError::UnsupportedVersion`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ConfigVersion {
    /// The original schema.
    #[default]
    V1,

    /// Schema-compatible successor of [`ConfigVersion::V1`], validated with the same rules.
    V2,
}

impl ConfigVersion {
    /// The string used for this version in configuration documents.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }

    pub(crate) fn parse(version: &str) -> Option<Self> {
        match version {
            "v1" => Some(Self::V1),
            "v2" => Some(Self::V2),
            _ => None,
        }
    }
}

/// Tuning parameters of an [`Allocator`][crate::Allocator].
///
/// A configuration is only ever observed by the allocator after it has been published through
/// a [`ConfigRegistry`][crate::ConfigRegistry], which validates it first. Once published, a
/// configuration is immutable - changing it means publishing a new one.
///
/// # Examples
///
/// ```
/// use tiered_alloc::AllocatorConfig;
///
/// let mut config = AllocatorConfig::default();
/// config.high_watermark = 0.80;
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct AllocatorConfig {
    /// Schema version that determines the validation rules.
    pub version: ConfigVersion,

    /// Nominal capacity of the small tier, in bytes.
    pub small_pool_size: u64,

    /// Nominal capacity of the medium tier, in bytes. Must exceed `small_pool_size`.
    pub medium_pool_size: u64,

    /// Nominal capacity of the large tier, in bytes. Must exceed `medium_pool_size`.
    pub large_pool_size: u64,

    /// Over-allocation multiplier applied when a tier grows a new block. Must exceed 1.0.
    pub growth_factor: f64,

    /// Below this pressure the reclamation cooldown decays.
    pub low_watermark: f64,

    /// Above this pressure an individual tier is pre-armed for reclamation.
    pub medium_watermark: f64,

    /// Above this pressure an allocation triggers compaction unless a cooldown is active.
    pub high_watermark: f64,

    /// Above this pressure an allocation always triggers compaction. Must be below 1.0.
    pub critical_watermark: f64,

    /// Number of checkpoint ticks to wait after a remediation before the next one.
    pub cooldown_cycles: i32,

    /// Checkpoint budget armed when pressure crosses a watermark.
    pub checkpoint_freq: i32,

    /// Upper bound on the number of entries in the size cache.
    pub max_cache_entries: i32,

    /// Whether mixed-precision layout is in effect. Changing it invalidates the size cache.
    #[serde(alias = "mixed_precision")]
    pub mixed_precision_enabled: bool,

    /// Whether the size cache is consulted and populated.
    #[serde(alias = "enable_auto_tuning")]
    pub auto_tuning_enabled: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            version: ConfigVersion::V1,
            small_pool_size: DEFAULT_SMALL_POOL_SIZE,
            medium_pool_size: DEFAULT_MEDIUM_POOL_SIZE,
            large_pool_size: DEFAULT_LARGE_POOL_SIZE,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            low_watermark: DEFAULT_LOW_WATERMARK,
            medium_watermark: DEFAULT_MEDIUM_WATERMARK,
            high_watermark: DEFAULT_HIGH_WATERMARK,
            critical_watermark: DEFAULT_CRITICAL_WATERMARK,
            cooldown_cycles: DEFAULT_COOLDOWN_CYCLES,
            checkpoint_freq: DEFAULT_CHECKPOINT_FREQ,
            max_cache_entries: DEFAULT_MAX_CACHE_ENTRIES,
            mixed_precision_enabled: false,
            auto_tuning_enabled: true,
        }
    }
}

impl AllocatorConfig {
    /// Checks the configuration against the rules of its schema version.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first constraint that does not hold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.version {
            ConfigVersion::V1 | ConfigVersion::V2 => self.validate_v1(),
        }
    }

    fn validate_v1(&self) -> Result<(), ConfigError> {
        if self.small_pool_size == 0 || self.medium_pool_size == 0 || self.large_pool_size == 0 {
            return Err(ConfigError::invalid("all pool sizes must be positive"));
        }

        if self.small_pool_size >= self.medium_pool_size
            || self.medium_pool_size >= self.large_pool_size
        {
            return Err(ConfigError::invalid(
                "pool sizes must be strictly increasing (small < medium < large)",
            ));
        }

        if !self.growth_factor.is_finite() || self.growth_factor <= 1.0 {
            return Err(ConfigError::invalid(
                "growth_factor must be a finite number greater than 1.0",
            ));
        }

        let watermarks = [
            self.low_watermark,
            self.medium_watermark,
            self.high_watermark,
            self.critical_watermark,
        ];

        if watermarks.iter().any(|w| w.is_nan()) {
            return Err(ConfigError::invalid("watermarks must be numbers"));
        }

        if self.low_watermark <= 0.0 {
            return Err(ConfigError::invalid("low_watermark must be greater than 0"));
        }

        if self.medium_watermark <= self.low_watermark {
            return Err(ConfigError::invalid(
                "medium_watermark must be greater than low_watermark",
            ));
        }

        if self.high_watermark <= self.medium_watermark {
            return Err(ConfigError::invalid(
                "high_watermark must be greater than medium_watermark",
            ));
        }

        if self.critical_watermark <= self.high_watermark {
            return Err(ConfigError::invalid(
                "critical_watermark must be greater than high_watermark",
            ));
        }

        if self.critical_watermark >= 1.0 {
            return Err(ConfigError::invalid("critical_watermark must be less than 1"));
        }

        if self.cooldown_cycles < 0 {
            return Err(ConfigError::invalid("cooldown_cycles must be non-negative"));
        }

        if self.checkpoint_freq < 1 {
            return Err(ConfigError::invalid("checkpoint_freq must be positive"));
        }

        if self.max_cache_entries < 1 {
            return Err(ConfigError::invalid("max_cache_entries must be positive"));
        }

        Ok(())
    }

    /// Summarizes the parts of the configuration that affect block layout.
    ///
    /// Two configurations with different fingerprints cannot share size-cache entries.
    pub(crate) fn layout_fingerprint(&self) -> u64 {
        self.small_pool_size
            ^ self.medium_pool_size.rotate_left(21)
            ^ self.large_pool_size.rotate_left(42)
            ^ u64::from(self.mixed_precision_enabled)
    }

    /// Nominal capacity of a tier, used as the pressure denominator until the tier has grown
    /// beyond it.
    pub(crate) fn nominal_capacity(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Small => self.small_pool_size,
            Tier::Medium => self.medium_pool_size,
            Tier::Large => self.large_pool_size,
        }
    }

    #[expect(clippy::cast_sign_loss, reason = "validated to be non-negative")]
    pub(crate) fn cooldown(&self) -> u32 {
        self.cooldown_cycles.max(0) as u32
    }

    #[expect(clippy::cast_sign_loss, reason = "validated to be positive")]
    pub(crate) fn cache_capacity(&self) -> usize {
        self.max_cache_entries.max(1) as usize
    }
}
