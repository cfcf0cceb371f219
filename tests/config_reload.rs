//! File-driven hot reload: config file → watcher → controller → router.

use std::sync::Arc;
use std::time::Duration;

use variant_router::config::loader::load_from_file;
use variant_router::config::watcher::ConfigWatcher;
use variant_router::routing::spawn_reload_task;
use variant_router::{EchoInvoker, RequestContext, VariantRouter};

const INITIAL: &str = r#"
[routing]
name = "churn-rollout"
strategy = "hash"

[[routing.variants]]
name = "production"
weight = 90
stage = "champion"
model = "models:/churn/1"
version = "1.0.0"

[[routing.variants]]
name = "staging"
weight = 10
stage = "challenger"
model = "models:/churn/2"
version = "1.1.0"
"#;

async fn wait_for_generation(router: &VariantRouter<EchoInvoker>, generation: u64) -> bool {
    for _ in 0..60 {
        if router.controller().generation() >= generation {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_file_edit_is_published_and_bad_edit_is_ignored() {
    let dir = tempfile::tempdir().expect("test: tempdir");
    let path = dir.path().join("router.toml");
    std::fs::write(&path, INITIAL).expect("test: write");

    let config = load_from_file(&path).expect("test: load");
    let router = VariantRouter::from_config(&config, EchoInvoker::new()).expect("test: router");

    let (_watcher, rx) = ConfigWatcher::new(path.clone()).expect("test: watcher");
    let _reload = spawn_reload_task(Arc::clone(router.controller()), rx);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Send everyone to staging.
    let all_staging = INITIAL
        .replace("weight = 90", "weight = 0")
        .replace("weight = 10", "weight = 100");
    std::fs::write(&path, all_staging).expect("test: write");
    assert!(
        wait_for_generation(&router, 2).await,
        "edited config should be published"
    );

    let routed = router
        .route_and_invoke("x".into(), &RequestContext::for_user("CUST_000123"))
        .await
        .expect("test: routed");
    assert_eq!(routed.variant_name, "staging");
    assert_eq!(routed.prediction, "models:/churn/2: x");

    // Wait out the debounce window, then break the weights.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let broken = INITIAL.replace("weight = 10", "weight = 5");
    std::fs::write(&path, broken).expect("test: write");
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    let status = router.status().expect("test: status");
    assert_eq!(status.generation, 2, "invalid edit must not be published");
    assert_eq!(status.variants[1].weight, 100);
}
