//! Configuration layering: defaults, pipeline file, environment

use restload_ingest::config::{DestinationKind, PipelineConfig};
use restload_ingest::{Concurrency, MergeStrategy};
use serial_test::serial;
use std::env;
use std::io::Write;
use tempfile::NamedTempFile;

const VARS: [&str; 7] = [
    "RESTLOAD_DATASET_NAME",
    "RESTLOAD_BASE_URL",
    "RESTLOAD_EXTRACT__WORKERS",
    "RESTLOAD_EXTRACT__FILE_ROTATION",
    "RESTLOAD_HTTP__MAX_ATTEMPTS",
    "RESTLOAD_DESTINATION",
    "RESTLOAD_FULL_REFRESH",
];

// ============================================================================
// Helpers
// ============================================================================

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

fn pipeline_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

// ============================================================================
// Tests
// ============================================================================

#[test]
#[serial]
fn test_env_overrides_defaults() {
    clear_env();
    env::set_var("RESTLOAD_DATASET_NAME", "shop_raw");
    env::set_var("RESTLOAD_EXTRACT__WORKERS", "6");
    env::set_var("RESTLOAD_EXTRACT__FILE_ROTATION", "2MB");
    env::set_var("RESTLOAD_DESTINATION", "memory");
    env::set_var("RESTLOAD_FULL_REFRESH", "true");

    let config = PipelineConfig::default().merge_env().unwrap();
    clear_env();

    assert_eq!(config.dataset_name, "shop_raw");
    assert_eq!(config.workers.extract, 6);
    assert_eq!(config.buffer.file_rotation_bytes().unwrap(), 2_000_000);
    assert_eq!(config.destination.kind, DestinationKind::Memory);
    assert!(config.full_refresh);
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_unparsable_env_value_is_an_error() {
    clear_env();
    env::set_var("RESTLOAD_HTTP__MAX_ATTEMPTS", "many");

    let result = PipelineConfig::default().merge_env();
    clear_env();

    assert!(result.is_err());
}

#[test]
#[serial]
fn test_file_then_env() {
    clear_env();
    let file = pipeline_file(
        r#"
        pipeline_name = "jaffle"
        dataset_name = "file_dataset"

        [http]
        base_url = "https://shop.example.test"
        max_attempts = 5

        [workers]
        extract = 3

        [[resources]]
        name = "orders"
        primary_key = "id"
        concurrency = "sequential"

        [[resources]]
        name = "events"
        primary_key = "event_id"
        merge_strategy = "append"
        "#,
    );
    env::set_var("RESTLOAD_DATASET_NAME", "env_dataset");

    let (config, resources) = PipelineConfig::load(Some(file.path())).unwrap();
    clear_env();

    assert_eq!(config.pipeline_name, "jaffle");
    assert_eq!(config.dataset_name, "env_dataset");
    assert_eq!(config.http.base_url, "https://shop.example.test");
    assert_eq!(config.http.max_attempts, 5);
    assert_eq!(config.workers.extract, 3);

    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0].concurrency(), Concurrency::Sequential);
    assert_eq!(resources[1].merge_strategy(), MergeStrategy::Append);
    assert_eq!(resources[1].primary_key(), "event_id");
}

#[test]
#[serial]
fn test_file_without_resources_uses_defaults() {
    clear_env();
    let file = pipeline_file("dataset_name = \"shop\"\n");

    let (_, resources) = PipelineConfig::load(Some(file.path())).unwrap();
    let names: Vec<_> = resources.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["customers", "orders", "products"]);
}

#[test]
#[serial]
fn test_invalid_values_rejected() {
    clear_env();
    env::set_var("RESTLOAD_BASE_URL", "ftp://shop.example.test");
    let result = PipelineConfig::load(None);
    clear_env();
    assert!(result.is_err());

    let file = pipeline_file("[workers]\nload = 0\n");
    assert!(PipelineConfig::load(Some(file.path())).is_err());

    let file = pipeline_file("dataset_name = \"../escape\"\n");
    assert!(PipelineConfig::load(Some(file.path())).is_err());
}
