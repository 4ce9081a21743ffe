use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::{AllocatorConfig, ConfigError, ConfigVersion};

/// Holds the currently published [`AllocatorConfig`] and validates candidates before they
/// replace it.
///
/// Readers never block: [`get_current()`][Self::get_current] returns an immutable snapshot
/// that stays valid (and unchanged) for as long as the caller holds it, even if a newer
/// configuration is published in the meantime. A rejected candidate leaves the published
/// configuration untouched.
///
/// One registry may be shared (via `Arc`) by any number of allocators and pipelines.
///
/// # Examples
///
/// ```
/// use tiered_alloc::{AllocatorConfig, ConfigRegistry};
///
/// let registry = ConfigRegistry::new();
///
/// let mut candidate = AllocatorConfig::default();
/// candidate.growth_factor = 1.5;
/// registry.update(candidate).unwrap();
///
/// assert_eq!(registry.get_current().growth_factor, 1.5);
/// assert_eq!(registry.generation(), 1);
/// ```
#[derive(Debug)]
pub struct ConfigRegistry {
    // We use `ArcSwap` here because reads vastly outnumber writes: every acquire loads the
    // config while updates are rare operator actions.
    current: ArcSwap<AllocatorConfig>,

    /// Number of successful publishes since the registry was created.
    generation: AtomicU64,

    /// Serializes publishers so that the generation counter follows publish order.
    publish_lock: Mutex<()>,
}

impl ConfigRegistry {
    /// Creates a registry that publishes the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial(AllocatorConfig::default())
    }

    /// Creates a registry that publishes `initial` as generation 0.
    ///
    /// # Errors
    ///
    /// Returns an error if `initial` fails validation.
    pub fn try_with_initial(initial: AllocatorConfig) -> Result<Self, ConfigError> {
        initial.validate()?;
        Ok(Self::with_initial(initial))
    }

    fn with_initial(initial: AllocatorConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            generation: AtomicU64::new(0),
            publish_lock: Mutex::new(()),
        }
    }

    /// Returns an immutable snapshot of the currently published configuration.
    #[must_use]
    pub fn get_current(&self) -> Arc<AllocatorConfig> {
        self.current.load_full()
    }

    /// Number of configurations published since the registry was created.
    #[must_use]
    pub fn generation(&self) -> u64 {
        // Acquire pairs with the Release in `update()` so a caller that observes a new
        // generation also observes the configuration published with it.
        self.generation.load(Ordering::Acquire)
    }

    /// Validates `candidate` and, only if it is valid, publishes a copy of it as the
    /// current configuration.
    ///
    /// Calls in flight elsewhere keep using whichever snapshot they already loaded.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first failing constraint. The previously
    /// published configuration remains in effect.
    pub fn update(&self, candidate: AllocatorConfig) -> Result<(), ConfigError> {
        if let Err(e) = candidate.validate() {
            warn!(error = %e, "rejected allocator configuration candidate");
            return Err(e);
        }

        let _guard = self.publish_lock.lock();

        self.current.store(Arc::new(candidate));
        let generation = self
            .generation
            .fetch_add(1, Ordering::Release)
            .wrapping_add(1);

        info!(
            version = candidate.version.as_str(),
            generation, "published allocator configuration"
        );

        Ok(())
    }

    /// Parses a JSON configuration document and publishes it via [`update()`][Self::update].
    ///
    /// Fields missing from the document take their default values. A document without a
    /// `version` key is read as [`ConfigVersion::V1`]. The keys `mixed_precision` and
    /// `enable_auto_tuning` are accepted as aliases; any other unknown key is a parse error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is malformed,
    /// [`ConfigError::UnsupportedVersion`] if it declares an unknown schema version and
    /// [`ConfigError::Invalid`] if it fails validation.
    pub fn load_json(&self, document: &str) -> Result<(), ConfigError> {
        let candidate = parse_document(document, "json", |d| {
            serde_json::from_str(d).map_err(|e| e.to_string())
        })?;

        self.update(candidate)
    }

    /// Parses a TOML configuration document and publishes it via [`update()`][Self::update].
    ///
    /// Fields missing from the document take their default values. A document without a
    /// `version` key is read as [`ConfigVersion::V1`]. The keys `mixed_precision` and
    /// `enable_auto_tuning` are accepted as aliases; any other unknown key is a parse error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the document is malformed,
    /// [`ConfigError::UnsupportedVersion`] if it declares an unknown schema version and
    /// [`ConfigError::Invalid`] if it fails validation.
    pub fn load_toml(&self, document: &str) -> Result<(), ConfigError> {
        let candidate = parse_document(document, "toml", |d| {
            toml::from_str(d).map_err(|e| e.to_string())
        })?;

        self.update(candidate)
    }
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Only the version is read in the first pass, so that an unknown schema is reported as
/// such instead of as whatever field mismatch it happens to cause.
#[derive(Deserialize)]
struct VersionHeader {
    version: Option<String>,
}

fn parse_document<F>(
    document: &str,
    format: &'static str,
    decode: F,
) -> Result<AllocatorConfig, ConfigError>
where
    F: Fn(&str) -> Result<serde_json::Value, String>,
{
    let parse_error = |message: String| ConfigError::Parse { format, message };

    let raw = decode(document).map_err(parse_error)?;

    let header: VersionHeader = from_value(&raw).map_err(parse_error)?;

    if let Some(version) = header.version
        && ConfigVersion::parse(&version).is_none()
    {
        return Err(ConfigError::UnsupportedVersion { version });
    }

    from_value(&raw).map_err(parse_error)
}

fn from_value<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, String> {
    T::deserialize(value).map_err(|e| e.to_string())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ConfigRegistry: Send, Sync);

    #[test]
    fn starts_with_defaults_at_generation_zero() {
        let registry = ConfigRegistry::new();

        assert_eq!(*registry.get_current(), AllocatorConfig::default());
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn try_with_initial_rejects_invalid() {
        let mut config = AllocatorConfig::default();
        config.checkpoint_freq = 0;

        assert!(matches!(
            ConfigRegistry::try_with_initial(config),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn update_publishes_valid_candidate() {
        let registry = ConfigRegistry::new();

        let mut candidate = AllocatorConfig::default();
        candidate.cooldown_cycles = 9;
        registry.update(candidate).unwrap();

        assert_eq!(registry.get_current().cooldown_cycles, 9);
        assert_eq!(registry.generation(), 1);
    }

    #[test]
    fn rejected_update_leaves_previous_config() {
        let registry = ConfigRegistry::new();
        let before = registry.get_current();

        let mut candidate = AllocatorConfig::default();
        candidate.low_watermark = 0.9;

        let result = registry.update(candidate);

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
        assert_eq!(*registry.get_current(), *before);
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_publish() {
        let registry = ConfigRegistry::new();
        let snapshot = registry.get_current();

        let mut candidate = AllocatorConfig::default();
        candidate.growth_factor = 2.0;
        registry.update(candidate).unwrap();

        assert_eq!(snapshot.growth_factor, AllocatorConfig::default().growth_factor);
        assert_eq!(registry.get_current().growth_factor, 2.0);
    }

    #[test]
    fn load_json_applies_partial_document() {
        let registry = ConfigRegistry::new();

        registry
            .load_json(r#"{ "version": "v2", "growth_factor": 1.75, "cooldown_cycles": 2 }"#)
            .unwrap();

        let current = registry.get_current();
        assert_eq!(current.version, ConfigVersion::V2);
        assert_eq!(current.growth_factor, 1.75);
        assert_eq!(current.cooldown_cycles, 2);
        assert_eq!(
            current.small_pool_size,
            AllocatorConfig::default().small_pool_size
        );
    }

    #[test]
    fn load_json_reports_unknown_version_distinctly() {
        let registry = ConfigRegistry::new();

        let result = registry.load_json(r#"{ "version": "v9", "growth_factor": 0.1 }"#);

        match result {
            Err(ConfigError::UnsupportedVersion { version }) => assert_eq!(version, "v9"),
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
        assert_eq!(registry.generation(), 0);
    }

    #[test]
    fn load_json_reports_malformed_document() {
        let registry = ConfigRegistry::new();

        let result = registry.load_json("{ not json");

        assert!(matches!(
            result,
            Err(ConfigError::Parse { format: "json", .. })
        ));
    }

    #[test]
    fn load_json_validates_after_parsing() {
        let registry = ConfigRegistry::new();

        let result = registry.load_json(r#"{ "small_pool_size": 0 }"#);

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn load_toml_applies_document() {
        let registry = ConfigRegistry::new();

        registry
            .load_toml(
                r#"
                version = "v1"
                high_watermark = 0.9
                critical_watermark = 0.97
                auto_tuning_enabled = false
                "#,
            )
            .unwrap();

        let current = registry.get_current();
        assert_eq!(current.high_watermark, 0.9);
        assert_eq!(current.critical_watermark, 0.97);
        assert!(!current.auto_tuning_enabled);
    }

    #[test]
    fn load_toml_reports_unknown_version_distinctly() {
        let registry = ConfigRegistry::new();

        let result = registry.load_toml(r#"version = "v0""#);

        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedVersion { .. })
        ));
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn concurrent_publishers_each_bump_generation() {
        let registry = ConfigRegistry::new();

        thread::scope(|s| {
            for i in 0..8_u32 {
                let registry = &registry;
                s.spawn(move || {
                    let mut candidate = AllocatorConfig::default();
                    candidate.growth_factor = 1.5 + f64::from(i) / 10.0;
                    registry.update(candidate).unwrap();
                });
            }
        });

        assert_eq!(registry.generation(), 8);
        assert!(registry.get_current().growth_factor >= 1.5);
    }
}
