//! Patch catalog discovery from a module directory

mod common;

use common::*;
use std::fs;
use weft_weaver::{CatalogError, PatchCatalog, PatchId, Selector, WeaverConfig};

#[test]
fn test_load_dir_sorted_with_rejections() {
    let dir = tempfile::tempdir().unwrap();

    let jetty = module(
        "jetty-9",
        vec![tracing_definition(
            Selector::ExactClass("org/eclipse/jetty/server/Server".to_string()),
            "weft/jetty/ServerPatch",
        )],
    );
    let grpc = module(
        "grpc-1",
        vec![tracing_definition(
            Selector::Interface("io/grpc/ServerCall".to_string()),
            "weft/grpc/CallPatch",
        )],
    );
    fs::write(dir.path().join("20-jetty.wpatch"), jetty.encode().unwrap()).unwrap();
    fs::write(dir.path().join("10-grpc.wpatch"), grpc.encode().unwrap()).unwrap();
    fs::write(dir.path().join("30-broken.wpatch"), b"WFTP not really").unwrap();
    fs::write(dir.path().join("README.txt"), b"ignored").unwrap();

    let load = PatchCatalog::load_dir(dir.path(), &WeaverConfig::default()).unwrap();
    let names: Vec<_> = load.catalog.modules().iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["grpc-1", "jetty-9"]);
    assert_eq!(load.rejected.len(), 1);
    assert!(matches!(
        &load.rejected[0],
        CatalogError::Format { source_label, .. } if source_label == "30-broken.wpatch"
    ));

    // Catalog order follows file order
    assert_eq!(load.catalog.position(&PatchId::new("grpc-1", 0)), Some(0));
    assert_eq!(load.catalog.position(&PatchId::new("jetty-9", 0)), Some(1));
}

#[test]
fn test_load_dir_honours_disabled_modules() {
    let dir = tempfile::tempdir().unwrap();
    let jetty = module(
        "jetty-9",
        vec![tracing_definition(
            Selector::ExactClass("org/eclipse/jetty/server/Server".to_string()),
            "weft/jetty/ServerPatch",
        )],
    );
    fs::write(dir.path().join("jetty.wpatch"), jetty.encode().unwrap()).unwrap();

    let config = WeaverConfig::from_str("disabled_modules = [\"jetty-9\"]").unwrap();
    let load = PatchCatalog::load_dir(dir.path(), &config).unwrap();
    assert!(load.catalog.is_empty());
    assert!(load.rejected.is_empty());
    assert!(!load.catalog.may_apply("org/eclipse/jetty/server/Server"));
}

#[test]
fn test_load_dir_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");
    let err = PatchCatalog::load_dir(&missing, &WeaverConfig::default()).unwrap_err();
    assert!(matches!(err, CatalogError::Io { .. }));
}
