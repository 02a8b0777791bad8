//! Engine lifecycle: lazy loading, leases and the low-resource policy

mod common;

use common::Mocks;
use parley::engine::EngineKind;
use parley::ParleyError;
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_acquire_loads_once() {
    let mocks = Mocks::new();
    *mocks.llm.lifecycle.load_delay.lock() = Duration::from_millis(50);
    let engines = mocks.manager(false);

    let acquires = (0..8).map(|_| {
        let slot = engines.llm().clone();
        tokio::spawn(async move { slot.acquire().await })
    });
    let leases: Vec<_> = futures::future::join_all(acquires)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(mocks.llm.lifecycle.loads(), 1);
    assert_eq!(engines.status(EngineKind::Llm).active_leases, 8);

    for lease in leases {
        lease.release().await;
    }
    let status = engines.status(EngineKind::Llm);
    assert_eq!(status.active_leases, 0);
    assert!(status.loaded);
    assert!(status.last_used.is_some());
}

#[tokio::test]
async fn test_low_resource_unloads_image_engines_only() {
    let mocks = Mocks::new();
    let engines = mocks.manager(true);

    let lease = engines.image_generator().acquire().await.unwrap();
    assert!(engines.status(EngineKind::ImageGenerator).loaded);
    lease.release().await;
    assert!(!engines.status(EngineKind::ImageGenerator).loaded);
    assert_eq!(mocks.image_generator.lifecycle.unloads(), 1);

    let lease = engines.stt().acquire().await.unwrap();
    lease.release().await;
    assert!(engines.status(EngineKind::Stt).loaded);
    assert_eq!(mocks.stt.lifecycle.unloads(), 0);
}

#[tokio::test]
async fn test_image_engine_stays_loaded_while_leased() {
    let mocks = Mocks::new();
    let engines = mocks.manager(true);

    let first = engines.image_generator().acquire().await.unwrap();
    let second = engines.image_generator().acquire().await.unwrap();
    first.release().await;
    assert!(engines.status(EngineKind::ImageGenerator).loaded);

    second.release().await;
    assert!(!engines.status(EngineKind::ImageGenerator).loaded);
    assert_eq!(mocks.image_generator.lifecycle.loads(), 1);
}

#[tokio::test]
async fn test_default_policy_keeps_engines_loaded() {
    let mocks = Mocks::new();
    let engines = mocks.manager(false);

    let lease = engines.image_generator().acquire().await.unwrap();
    lease.release().await;
    assert!(engines.status(EngineKind::ImageGenerator).loaded);

    // Switching the policy applies from the next release
    engines.policy().set_low_resource(true);
    let lease = engines.image_generator().acquire().await.unwrap();
    lease.release().await;
    assert!(!engines.status(EngineKind::ImageGenerator).loaded);
}

#[tokio::test]
async fn test_load_failure_is_reported() {
    let mocks = Mocks::new();
    mocks
        .llm
        .lifecycle
        .fail_load
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let engines = mocks.manager(false);

    let err = engines.llm().acquire().await.err().unwrap();
    assert!(matches!(err, ParleyError::EngineLoadError(_)));

    let status = engines.status(EngineKind::Llm);
    assert!(!status.loaded);
    assert!(!status.loading);
    assert_eq!(status.active_leases, 0);
    assert!(status.last_error.unwrap().contains("connection refused"));

    // A later attempt retries the load and clears the error
    mocks
        .llm
        .lifecycle
        .fail_load
        .store(false, std::sync::atomic::Ordering::SeqCst);
    let lease = engines.llm().acquire().await.unwrap();
    lease.release().await;
    assert!(engines.status(EngineKind::Llm).last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_load_timeout() {
    let mocks = Mocks::new();
    *mocks.stt.lifecycle.load_delay.lock() = Duration::from_secs(600);
    let engines = mocks.manager_with(false, true, Duration::from_secs(30));

    let err = engines.stt().acquire().await.err().unwrap();
    match err {
        ParleyError::EngineLoadError(message) => assert!(message.contains("timed out")),
        other => panic!("unexpected error: {}", other),
    }
    let status = engines.status(EngineKind::Stt);
    assert!(!status.loaded);
    assert!(!status.loading);
}

#[tokio::test]
async fn test_loading_is_visible_mid_load() {
    let mocks = Mocks::new();
    *mocks.tts.lifecycle.load_delay.lock() = Duration::from_millis(200);
    let engines = mocks.manager(false);

    let slot = engines.tts().clone();
    let pending = tokio::spawn(async move { slot.preload().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = engines.status(EngineKind::Tts);
    assert!(status.loading);
    assert!(!status.loaded);

    pending.await.unwrap().unwrap();
    let status = engines.status(EngineKind::Tts);
    assert!(!status.loading);
    assert!(status.loaded);
    assert_eq!(status.memory_estimate_mb, 512);
}

#[tokio::test]
async fn test_disabled_kind_is_unavailable() {
    let mocks = Mocks::new();
    let engines = mocks.manager_with(false, false, Duration::from_secs(5));

    assert!(!engines.image_generation_available());
    let err = engines.image_generator().acquire().await.err().unwrap();
    assert!(matches!(err, ParleyError::EngineUnavailable(_)));

    let status = engines.status(EngineKind::ImageExplainer);
    assert!(!status.enabled);
    assert!(status.name.is_none());

    // Shutdown skips slots with nothing configured
    engines.shutdown().await;
}

#[tokio::test]
async fn test_unload_failure_keeps_engine_loaded() {
    use std::sync::atomic::Ordering;

    let mocks = Mocks::new();
    mocks
        .image_generator
        .lifecycle
        .fail_unload
        .store(true, Ordering::SeqCst);
    let engines = mocks.manager(true);

    let lease = engines.image_generator().acquire().await.unwrap();
    lease.release().await;
    let status = engines.status(EngineKind::ImageGenerator);
    assert!(status.loaded);
    assert!(status.last_error.unwrap().contains("device busy"));

    mocks
        .image_generator
        .lifecycle
        .fail_unload
        .store(false, Ordering::SeqCst);
    let lease = engines.image_generator().acquire().await.unwrap();
    lease.release().await;
    assert!(!engines.status(EngineKind::ImageGenerator).loaded);
    assert_eq!(mocks.image_generator.lifecycle.loads(), 1);
}

#[tokio::test]
async fn test_explicit_unload_respects_leases() {
    let mocks = Mocks::new();
    let engines = mocks.manager(false);

    let lease = engines.llm().acquire().await.unwrap();
    assert!(!engines.unload(EngineKind::Llm).await.unwrap());
    assert!(engines.status(EngineKind::Llm).loaded);

    lease.release().await;
    assert!(engines.unload(EngineKind::Llm).await.unwrap());
    assert!(!engines.status(EngineKind::Llm).loaded);
    assert_eq!(mocks.llm.lifecycle.unloads(), 1);
}

#[tokio::test]
async fn test_switch_tts() {
    let mocks = Mocks::new();
    let engines = mocks.manager(false);
    engines.preload(EngineKind::Tts).await.unwrap();
    assert_eq!(engines.active_tts_engine(), "piper");

    assert_eq!(engines.switch_tts("Kokoro").await.unwrap(), "kokoro");
    assert_eq!(engines.active_tts_engine(), "kokoro");
    assert_eq!(mocks.tts.lifecycle.unloads(), 1);

    let status = engines.status(EngineKind::Tts);
    assert_eq!(status.name.as_deref(), Some("kokoro"));
    assert!(!status.loaded);

    let lease = engines.tts().acquire().await.unwrap();
    lease.release().await;
    assert_eq!(mocks.alt_tts.lifecycle.loads(), 1);

    let err = engines.switch_tts("espeak").await.err().unwrap();
    assert!(matches!(err, ParleyError::ConfigError(_)));
    assert_eq!(engines.active_tts_engine(), "kokoro");

    let mut names = engines.tts_engine_names();
    names.sort();
    assert_eq!(names, ["kokoro", "piper"]);
}

#[tokio::test]
async fn test_snapshot_lists_every_kind() {
    let mocks = Mocks::new();
    let engines = mocks.manager(true);
    let kinds: Vec<_> = engines.snapshot().into_iter().map(|s| s.kind).collect();
    assert_eq!(kinds, EngineKind::ALL);

    assert_eq!("imagegen".parse::<EngineKind>().unwrap(), EngineKind::ImageGenerator);
    assert!("gpu".parse::<EngineKind>().is_err());
}

#[tokio::test]
async fn test_dropped_lease_is_released_in_background() {
    let mocks = Mocks::new();
    let engines = mocks.manager(true);

    let lease = engines.image_explainer().acquire().await.unwrap();
    drop(lease);
    for _ in 0..50 {
        if !engines.status(EngineKind::ImageExplainer).loaded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = engines.status(EngineKind::ImageExplainer);
    assert_eq!(status.active_leases, 0);
    assert!(!status.loaded);
    assert_eq!(mocks.explainer.lifecycle.unloads(), 1);
}
