use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use eval_promoter::http::{router, AppState};
use eval_promoter::{BatchRunner, PromotionEngine, PromotionSettings, Runner};
use forecast_core::model_registry::PROMOTED_TAG;
use forecast_core::store::{get_json, put_json};
use forecast_core::{ArtifactPointer, ArtifactStore, ClaimCheck, ConfigHash, ForecastError, LocalRegistry, MemoryStore, Metrics, ModelArtifact, ModelRegistry, PointerScope, PromotionRecord, RunRecord, ScoreWeights, StoreError};
use forecast_resilience::RetryConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const CONTAINER: &str = "model-promotion";
const T: Duration = Duration::from_secs(1);

fn settings() -> PromotionSettings {
    PromotionSettings {
        container: CONTAINER.into(),
        expected_variants: vec!["GRU".into(), "LSTM".into(), "PROPHET".into()],
        retry: RetryConfig { max_retries: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), jitter: 0.0 },
        write_timeout: T,
    }
}

fn candidate(hash: &str, run: &str, variant: &str, m: (f64, f64, f64), minute: u32) -> ModelArtifact {
    ModelArtifact {
        registry_handle: format!("runs:/{run}/{variant}"), model_variant: variant.into(), run_id: run.into(), config_hash: ConfigHash::new(hash),
        metrics: Metrics { rmse: m.0, mae: m.1, mse: m.2 }, created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
    }
}

fn reference_set(hash: &str) -> Vec<ModelArtifact> {
    vec![
        candidate(hash, &format!("{hash}-gru"), "GRU", (0.12, 0.09, 0.015), 0),
        candidate(hash, &format!("{hash}-lstm"), "LSTM", (0.13, 0.10, 0.017), 1),
        candidate(hash, &format!("{hash}-prophet"), "PROPHET", (0.15, 0.11, 0.022), 2),
    ]
}

async fn registry_with(runs: &[ModelArtifact]) -> Arc<LocalRegistry> {
    let reg = LocalRegistry::temporary().unwrap();
    for a in runs {
        reg.record_run(RunRecord {
            run_id: a.run_id.clone(), model_variant: a.model_variant.clone(), config_hash: a.config_hash.clone(), params: BTreeMap::new(),
            metrics: Some(a.metrics), tags: BTreeMap::new(), created_at: a.created_at, finished_at: Some(a.created_at), artifacts: BTreeMap::new(),
        }).await.unwrap();
    }
    Arc::new(reg)
}

async fn pointer(store: &MemoryStore, scope: PointerScope) -> PromotionRecord {
    get_json(store, CONTAINER, &scope.key(), T).await.unwrap()
}

#[tokio::test]
async fn incomplete_candidate_sets_write_nothing() {
    let store = Arc::new(MemoryStore::new());
    let full = reference_set("h1");
    let engine = PromotionEngine::new(store.clone(), registry_with(&full).await, settings());
    for n in 1..3 {
        let err = engine.evaluate(&ConfigHash::new("h1"), "site-a", &full[..n], &ScoreWeights::default()).await.unwrap_err();
        assert!(matches!(err, ForecastError::InsufficientCandidates { .. }), "{err}");
        assert_eq!(err.exit_code(), 2);
    }
    let err = engine.evaluate(&ConfigHash::new("h1"), "site-a", &[], &ScoreWeights::default()).await.unwrap_err();
    assert!(matches!(err, ForecastError::InsufficientCandidates { .. }));
    assert!(store.keys(CONTAINER).is_empty());
    assert_eq!(store.put_count(), 0);
}

#[tokio::test]
async fn mismatched_or_duplicate_candidates_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    let engine = PromotionEngine::new(store.clone(), registry_with(&[]).await, settings());
    let mut dup = reference_set("h1");
    dup[2].model_variant = "GRU".into();
    dup.push(candidate("h1", "extra", "PROPHET", (0.2, 0.2, 0.2), 3));
    assert!(matches!(engine.evaluate(&ConfigHash::new("h1"), "", &dup, &ScoreWeights::default()).await, Err(ForecastError::InvalidCandidates(_))));
    let mut foreign = reference_set("h1");
    foreign[1].config_hash = ConfigHash::new("h2");
    assert!(matches!(engine.evaluate(&ConfigHash::new("h1"), "", &foreign, &ScoreWeights::default()).await, Err(ForecastError::InvalidCandidates(_))));
    assert!(store.keys(CONTAINER).is_empty());
}

#[tokio::test]
async fn promotion_writes_history_pointers_and_tag() {
    let store = Arc::new(MemoryStore::new());
    let set = reference_set("h1");
    let registry = registry_with(&set).await;
    let engine = PromotionEngine::new(store.clone(), registry.clone(), settings());
    let record = engine.evaluate(&ConfigHash::new("h1"), "site-a", &set, &ScoreWeights::default()).await.unwrap();
    assert_eq!(record.run_id, "h1-gru");
    assert_eq!(record.model_variant, "GRU");
    assert!((record.composite_score - 0.09).abs() < 1e-9);

    let ts = record.timestamp_key();
    let keys = store.keys(CONTAINER);
    assert!(keys.contains(&format!("global/h1/promotion-{ts}.json")));
    assert!(keys.contains(&format!("site-a/h1/promotion-{ts}.json")));
    let scopes = [
        PointerScope::Root,
        PointerScope::Global,
        PointerScope::Identifier("site-a".into()),
        PointerScope::Lineage { identifier: "site-a".into(), config_hash: ConfigHash::new("h1") },
    ];
    for scope in scopes {
        let current = pointer(&store, scope).await;
        assert_eq!(current, record);
        let history: PromotionRecord = get_json(store.as_ref(), CONTAINER, &format!("global/h1/promotion-{ts}.json"), T).await.unwrap();
        assert_eq!(history.run_id, current.run_id);
    }
    assert!(registry.get_run("h1-gru").await.unwrap().is_promoted());
    assert!(!registry.get_run("h1-lstm").await.unwrap().tags.contains_key(PROMOTED_TAG));
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let set = reference_set("h1");
    let engine = PromotionEngine::new(store.clone(), registry_with(&set).await, settings());
    store.fail_next_puts(2);
    let record = engine.evaluate(&ConfigHash::new("h1"), "", &set, &ScoreWeights::default()).await.unwrap();
    assert_eq!(pointer(&store, PointerScope::Root).await.run_id, record.run_id);
}

#[tokio::test]
async fn exhausted_history_write_leaves_pointers_untouched() {
    let store = Arc::new(MemoryStore::new());
    let set = reference_set("h1");
    let engine = PromotionEngine::new(store.clone(), registry_with(&set).await, settings());
    store.fail_next_puts(100);
    let err = engine.evaluate(&ConfigHash::new("h1"), "site-a", &set, &ScoreWeights::default()).await.unwrap_err();
    assert!(matches!(err, ForecastError::ArtifactStore(StoreError::Io { .. })));
    assert!(store.keys(CONTAINER).iter().all(|k| !k.ends_with("current.json")));
}

#[tokio::test]
async fn registry_tag_failure_is_not_fatal() {
    let store = Arc::new(MemoryStore::new());
    let engine = PromotionEngine::new(store.clone(), registry_with(&[]).await, settings());
    let record = engine.evaluate(&ConfigHash::new("h1"), "site-a", &reference_set("h1"), &ScoreWeights::default()).await.unwrap();
    assert_eq!(pointer(&store, PointerScope::Identifier("site-a".into())).await.run_id, record.run_id);
}

#[tokio::test]
async fn concurrent_promotions_for_different_hashes_stay_isolated() {
    let store = Arc::new(MemoryStore::new());
    let (a, b) = (reference_set("ha"), reference_set("hb"));
    let mut all = a.clone();
    all.extend(b.clone());
    let engine = Arc::new(PromotionEngine::new(store.clone(), registry_with(&all).await, settings()));
    let w = ScoreWeights::default();
    let ha = ConfigHash::new("ha");
    let hb = ConfigHash::new("hb");
    let (ra, rb) = tokio::join!(
        engine.evaluate(&ha, "site-a", &a, &w),
        engine.evaluate(&hb, "site-a", &b, &w),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(pointer(&store, PointerScope::Lineage { identifier: "site-a".into(), config_hash: ConfigHash::new("ha") }).await.run_id, ra.run_id);
    assert_eq!(pointer(&store, PointerScope::Lineage { identifier: "site-a".into(), config_hash: ConfigHash::new("hb") }).await.run_id, rb.run_id);
}

#[tokio::test]
async fn http_evaluate_maps_errors() {
    let store = Arc::new(MemoryStore::new());
    let set = reference_set("h1");
    let engine = Arc::new(PromotionEngine::new(store.clone(), registry_with(&set).await, settings()));
    let app = router(AppState { engine, default_weights: ScoreWeights::default() });

    let short = serde_json::json!({"config_hash": "h1", "identifier": "site-a", "candidates": &set[..2]});
    let resp = app.clone().oneshot(Request::post("/evaluate").header("content-type", "application/json").body(Body::from(short.to_string())).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let full = serde_json::json!({"config_hash": "h1", "identifier": "site-a", "candidates": &set});
    let resp = app.oneshot(Request::post("/evaluate").header("content-type", "application/json").body(Body::from(full.to_string())).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["run_id"], "h1-gru");
    assert!(v.get("score").is_some());
}

#[tokio::test]
async fn batch_runner_reads_claim_checks_and_writes_output() {
    let store = Arc::new(MemoryStore::new());
    let set = reference_set("h1");
    let mut pointers = Vec::new();
    for a in &set {
        let key = format!("h1/{}.json", a.model_variant.to_lowercase());
        let doc = ClaimCheck { pointer: ArtifactPointer::new("models", format!("h1/{}/weights.bin", a.run_id)), metadata: a.clone() };
        put_json(store.as_ref(), "models", &key, &doc, T).await.unwrap();
        pointers.push(ArtifactPointer::new("models", key));
    }
    let engine = Arc::new(PromotionEngine::new(store.clone(), registry_with(&set).await, settings()));
    let out = std::env::temp_dir().join(format!("promotion-{}.json", uuid::Uuid::new_v4().simple()));
    let runner = BatchRunner {
        engine: engine.clone(), store: store.clone(), config_hash: ConfigHash::new("h1"), identifier: "site-a".into(), candidates: pointers.clone(),
        weights: ScoreWeights::default(), output_path: Some(out.clone()), retry: settings().retry, read_timeout: T,
    };
    Box::new(runner).run().await.unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(doc["pointer"], "model-promotion/current.json");
    assert_eq!(doc["metadata"]["run_id"], "h1-gru");
    let _ = std::fs::remove_file(out);

    let mut missing = pointers;
    missing.push(ArtifactPointer::new("models", "h1/absent.json"));
    let runner = BatchRunner {
        engine, store: store.clone(), config_hash: ConfigHash::new("h1"), identifier: String::new(), candidates: missing,
        weights: ScoreWeights::default(), output_path: None, retry: settings().retry, read_timeout: T,
    };
    let err = Box::new(runner).run().await.unwrap_err();
    assert_eq!(err.downcast_ref::<ForecastError>().map(ForecastError::exit_code), Some(3));
}
