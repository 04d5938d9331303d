//! The shipped data/ directory loads, and the catalog refuses open-set edits.

use insights_core::{
    catalog::{CatalogEntryConfig, QueryCatalog, QueryKind},
    config::EngineConfig,
};

fn data_dir() -> String {
    format!("{}/../data", env!("CARGO_MANIFEST_DIR"))
}

fn entry(name: &str, epsilon_cost: f64) -> CatalogEntryConfig {
    CatalogEntryConfig {
        name: name.to_string(),
        label: format!("{name} label"),
        epsilon_cost,
        delta_cost: 1e-6,
    }
}

fn full_catalog() -> Vec<CatalogEntryConfig> {
    QueryKind::ALL
        .iter()
        .map(|k| entry(k.name(), k.default_epsilon_cost()))
        .collect()
}

#[test]
fn shipped_config_loads() {
    let config = EngineConfig::load(&data_dir()).unwrap();
    assert_eq!(config.budget.epsilon_total, 1.0);
    assert_eq!(config.catalog.entries().len(), 6);
    assert_eq!(
        config.catalog.lookup("case_distribution").unwrap().epsilon_cost,
        0.05
    );
    assert!(config.executor.allowed_roles.contains(&"admin".to_string()));
    assert_eq!(config.reports.trending_topic_limit, 5);
}

#[test]
fn catalog_rejects_unknown_queries() {
    let mut configs = full_catalog();
    configs.push(entry("raw_export", 0.05));
    let err = QueryCatalog::from_config(&configs).unwrap_err();
    assert!(err.to_string().contains("raw_export"), "{err}");
}

#[test]
fn catalog_rejects_non_positive_epsilon() {
    let mut configs = full_catalog();
    configs[2].epsilon_cost = 0.0;
    assert!(QueryCatalog::from_config(&configs).is_err());
}
