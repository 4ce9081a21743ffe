//! Integration tests for configuration validation, publishing and loading.

use std::sync::Arc;

use testing::f64_diff_abs;
use tiered_alloc::{Allocator, AllocatorConfig, ConfigError, ConfigRegistry, ConfigVersion};

fn assert_rejected(registry: &ConfigRegistry, candidate: AllocatorConfig) {
    let before = registry.get_current();
    let generation = registry.generation();

    let result = registry.update(candidate);

    assert!(
        matches!(result, Err(ConfigError::Invalid { .. })),
        "{candidate:?} was not rejected: {result:?}"
    );
    assert_eq!(*registry.get_current(), *before);
    assert_eq!(registry.generation(), generation);
}

#[test]
fn invalid_candidates_leave_current_config_in_place() {
    let registry = ConfigRegistry::new();

    let mutations: [fn(&mut AllocatorConfig); 11] = [
        |c| c.small_pool_size = 0,
        |c| c.medium_pool_size = c.small_pool_size,
        |c| c.large_pool_size = c.medium_pool_size - 1,
        |c| c.growth_factor = 1.0,
        |c| c.low_watermark = 0.0,
        |c| c.medium_watermark = c.low_watermark,
        |c| c.high_watermark = c.medium_watermark,
        |c| c.critical_watermark = c.high_watermark,
        |c| c.critical_watermark = 1.0,
        |c| c.checkpoint_freq = 0,
        |c| c.max_cache_entries = 0,
    ];

    for mutate in mutations {
        let mut candidate = AllocatorConfig::default();
        mutate(&mut candidate);

        assert_rejected(&registry, candidate);
    }
}

#[test]
fn valid_candidate_is_published() {
    let registry = ConfigRegistry::new();

    let mut candidate = AllocatorConfig::default();
    candidate.low_watermark = 0.4;
    candidate.medium_watermark = 0.6;
    candidate.high_watermark = 0.8;
    candidate.critical_watermark = 0.9;

    registry.update(candidate).unwrap();

    assert_eq!(*registry.get_current(), candidate);
    assert_eq!(registry.generation(), 1);
}

#[test]
fn snapshots_survive_later_publishes() {
    let registry = ConfigRegistry::new();
    let snapshot = registry.get_current();

    let mut candidate = AllocatorConfig::default();
    candidate.growth_factor = 2.0;
    registry.update(candidate).unwrap();

    assert_eq!(f64_diff_abs(snapshot.growth_factor, 1.3, 1e-9), 0.0);
    assert_eq!(f64_diff_abs(registry.get_current().growth_factor, 2.0, 1e-9), 0.0);
}

#[test]
fn json_document_fills_missing_fields_with_defaults() {
    let registry = ConfigRegistry::new();

    registry
        .load_json(
            r#"{
                "version": "v2",
                "small_pool_size": 2048,
                "auto_tuning_enabled": false
            }"#,
        )
        .unwrap();

    let current = registry.get_current();
    assert_eq!(current.version, ConfigVersion::V2);
    assert_eq!(current.small_pool_size, 2048);
    assert!(!current.auto_tuning_enabled);
    assert_eq!(current.medium_pool_size, AllocatorConfig::default().medium_pool_size);
}

#[test]
fn toml_document_is_loaded() {
    let registry = ConfigRegistry::new();

    registry
        .load_toml(
            r#"
            version = "v1"
            growth_factor = 1.5
            cooldown_cycles = 2
            mixed_precision_enabled = true
            "#,
        )
        .unwrap();

    let current = registry.get_current();
    assert_eq!(f64_diff_abs(current.growth_factor, 1.5, 1e-9), 0.0);
    assert_eq!(current.cooldown_cycles, 2);
    assert!(current.mixed_precision_enabled);
}

#[test]
fn unknown_version_is_unsupported_not_invalid() {
    let registry = ConfigRegistry::new();

    let result = registry.load_json(r#"{ "version": "v3" }"#);

    assert!(
        matches!(&result, Err(ConfigError::UnsupportedVersion { version }) if version == "v3"),
        "{result:?}"
    );
    assert_eq!(registry.generation(), 0);
}

#[test]
fn malformed_documents_are_parse_errors() {
    let registry = ConfigRegistry::new();

    assert!(matches!(
        registry.load_json("{ not json"),
        Err(ConfigError::Parse { format: "json", .. })
    ));
    assert!(matches!(
        registry.load_toml("growth_factor = "),
        Err(ConfigError::Parse { format: "toml", .. })
    ));
    assert!(matches!(
        registry.load_json(r#"{ "growth_factor": "fast" }"#),
        Err(ConfigError::Parse { format: "json", .. })
    ));
}

#[test]
fn invalid_document_is_rejected_after_parsing() {
    let registry = ConfigRegistry::new();

    let result = registry.load_toml("high_watermark = 0.99\ncritical_watermark = 0.98");

    assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    assert_eq!(*registry.get_current(), AllocatorConfig::default());
}

#[test]
fn shared_registry_reaches_every_allocator() {
    let registry = Arc::new(ConfigRegistry::new());

    let first = Allocator::builder()
        .config_registry(Arc::clone(&registry))
        .adaptive_checkpointing(false)
        .build();
    let second = Allocator::builder()
        .config_registry(Arc::clone(&registry))
        .adaptive_checkpointing(false)
        .build();

    let mut candidate = AllocatorConfig::default();
    candidate.auto_tuning_enabled = false;
    first.update_config(candidate).unwrap();

    assert!(!second.config().auto_tuning_enabled);
    assert!(!second.metrics().auto_tuning_enabled);
    assert_eq!(registry.generation(), 1);
}

#[test]
fn legacy_key_names_are_accepted() {
    let registry = ConfigRegistry::new();

    registry
        .load_json(
            r#"{ "version": "v1", "enable_auto_tuning": false, "mixed_precision": true }"#,
        )
        .unwrap();

    let current = registry.get_current();
    assert!(!current.auto_tuning_enabled);
    assert!(current.mixed_precision_enabled);
    assert_eq!(registry.generation(), 1);
}

#[test]
fn unknown_keys_are_parse_errors() {
    let registry = ConfigRegistry::new();

    let result = registry.load_json(r#"{ "version": "v1", "growth_fator": 0.5 }"#);

    assert!(
        matches!(
            &result,
            Err(ConfigError::Parse { format: "json", message }) if message.contains("growth_fator")
        ),
        "{result:?}"
    );
    assert!(matches!(
        registry.load_toml("auto_tuning = false"),
        Err(ConfigError::Parse { format: "toml", .. })
    ));

    assert_eq!(*registry.get_current(), AllocatorConfig::default());
    assert_eq!(registry.generation(), 0);
}

#[test]
fn document_without_version_is_read_as_v1() {
    let registry = ConfigRegistry::new();

    registry.load_json(r#"{ "cooldown_cycles": 7 }"#).unwrap();

    let current = registry.get_current();
    assert_eq!(current.version, ConfigVersion::V1);
    assert_eq!(current.cooldown_cycles, 7);
}
