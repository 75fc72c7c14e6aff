use govlead_adapters::{FixtureSearchProvider, SearchProvider};
use govlead_core::SearchFilters;

fn fixture_root() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

#[tokio::test]
async fn sample_award_fixture_loads_and_sums() {
    let provider = FixtureSearchProvider::from_path(fixture_root().join("awards/sample.json"))
        .expect("sample awards fixture");
    let awards = provider.search(&SearchFilters::default()).await.unwrap();

    assert_eq!(awards.len(), 9);
    let total: f64 = awards.iter().map(|a| a.award_amount).sum();
    assert!((total - 59_250_000.0).abs() < 0.01);
    assert!(awards.iter().any(|a| a.recipient_uei.is_none()));
}

#[tokio::test]
async fn sample_filter_fixture_matches_it_awards() {
    let raw = std::fs::read_to_string(fixture_root().join("filters/sample.json")).unwrap();
    let filters: SearchFilters = serde_json::from_str(&raw).unwrap();
    filters.validate().unwrap();

    let provider =
        FixtureSearchProvider::from_path(fixture_root().join("awards/sample.json")).unwrap();
    let awards = provider.search(&filters).await.unwrap();
    assert_eq!(awards.len(), 4);
    assert!(awards
        .iter()
        .all(|a| a.naics.code.as_deref().is_some_and(|c| c.starts_with("5415"))));
}
