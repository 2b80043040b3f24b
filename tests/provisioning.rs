//! End-to-end provisioning behavior against the in-memory remote: exactly-once
//! creation under concurrency, idempotent fast paths, recovery after
//! out-of-band deletion, and anomaly handling.

use std::sync::Arc;

use futures::future::join_all;
use lifecycle_core::testing::{FixedClock, MockRemote};
use lifecycle_core::{
    AnomalyConfig, BackoffConfig, BatchDeduplicator, ProvisionError, ProvisionerConfig,
    ProvisioningCache, RecoveryAdvice, ResourceKey, WriteErrorKind,
};

fn fast_config() -> ProvisionerConfig {
    ProvisionerConfig {
        backoff: BackoffConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            backoff_multiplier: 1.0,
            max_delay_ms: 2,
            jitter_enabled: false,
            jitter_max_percentage: 0.0,
        },
        ..Default::default()
    }
}

fn cache_at(remote: Arc<MockRemote>, date: &str) -> Arc<ProvisioningCache> {
    Arc::new(
        ProvisioningCache::with_clock(remote, fast_config(), Arc::new(FixedClock::at(date)))
            .unwrap(),
    )
}

#[tokio::test]
async fn concurrent_callers_create_each_resource_exactly_once() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.ensure_ready("nginx").await })
        })
        .collect();

    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    let counts = remote.counts();
    assert_eq!(counts.create_policy, 1);
    assert_eq!(counts.create_template, 1);
    assert_eq!(counts.create_target, 1);
}

#[tokio::test]
async fn ready_keys_issue_zero_remote_calls() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");

    cache.ensure_ready("nginx").await.unwrap();
    let counts = remote.counts();

    for _ in 0..100 {
        cache.ensure_ready("nginx").await.unwrap();
    }
    assert_eq!(remote.counts(), counts);
}

#[tokio::test]
async fn distinct_keys_provision_independently() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");

    let tasks: Vec<_> = ["nginx", "redis", "postgres"]
        .into_iter()
        .flat_map(|raw| {
            let cache = Arc::clone(&cache);
            (0..8).map(move |_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.ensure_ready(raw).await })
            })
        })
        .collect();
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(remote.counts().create_policy, 3);
    assert_eq!(remote.counts().create_template, 3);
    assert_eq!(remote.counts().create_target, 3);
}

#[tokio::test]
async fn scenario_derives_documented_names() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");

    cache.ensure_ready("nginx").await.unwrap();

    assert!(remote.has_policy("nginx-ilm-policy"));
    assert!(remote.has_template("logstash-nginx"));
    assert_eq!(
        remote.write_target_of("nginx"),
        Some("nginx-2025.11.20-000001".to_string())
    );
    assert_eq!(remote.write_targets_of("nginx").len(), 1);
}

#[tokio::test]
async fn raw_keys_normalize_before_provisioning() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");

    let key = cache.ensure_ready("My Container/1").await.unwrap();
    assert_eq!(key.as_str(), "my-container-1");
    assert!(remote.has_policy("my-container-1-ilm-policy"));

    // The normalized form is the same cached key.
    let counts = remote.counts();
    cache.ensure_ready("my-container-1").await.unwrap();
    assert_eq!(remote.counts(), counts);
}

#[tokio::test]
async fn keys_normalizing_to_empty_are_rejected() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");

    let err = cache.ensure_ready(" /// ").await.unwrap_err();
    assert!(matches!(err, ProvisionError::ValidationError(_)));
    assert_eq!(remote.counts(), Default::default());
}

#[tokio::test]
async fn ready_implies_a_write_target_even_after_external_demotion() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");
    remote.seed_target("nginx-2025.11.20-000001", "nginx", false, "nginx-ilm-policy");

    cache.ensure_ready("nginx").await.unwrap();
    assert_eq!(
        remote.write_target_of("nginx"),
        Some("nginx-2025.11.20-000001".to_string())
    );
}

#[tokio::test]
async fn recovery_recreates_only_the_missing_target() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");

    cache.ensure_ready("nginx").await.unwrap();
    assert_eq!(remote.counts().create_policy, 1);

    // The write target vanishes out-of-band.
    remote.delete_target("nginx-2025.11.20-000001");

    let advice = cache
        .on_write_error("nginx", WriteErrorKind::TargetMissing)
        .unwrap();
    assert_eq!(advice, RecoveryAdvice::Retry);

    cache.ensure_ready("nginx").await.unwrap();

    // Policy and template still exist remotely: fresh existence checks found
    // them, so creation counts are unchanged; only the target was recreated.
    let counts = remote.counts();
    assert_eq!(counts.create_policy, 1);
    assert_eq!(counts.create_template, 1);
    assert_eq!(counts.create_target, 2);
    assert_eq!(
        remote.write_target_of("nginx"),
        Some("nginx-2025.11.20-000001".to_string())
    );
}

#[tokio::test]
async fn recovery_budget_is_bounded_without_a_successful_reprovision() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");

    cache.ensure_ready("nginx").await.unwrap();
    remote.delete_target("nginx-2025.11.20-000001");

    // Repeated write errors with no successful re-provision in between spend
    // the budget.
    for attempt in 1..=2 {
        let advice = cache
            .on_write_error("nginx", WriteErrorKind::TargetMissing)
            .unwrap();
        assert_eq!(advice, RecoveryAdvice::Retry, "attempt {attempt}");
    }
    let err = cache
        .on_write_error("nginx", WriteErrorKind::TargetMissing)
        .unwrap_err();
    assert!(matches!(err, ProvisionError::RecoveryExhausted { .. }));
}

#[tokio::test]
async fn successful_recoveries_replenish_the_budget() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");

    // Each cycle fully recovers before the next out-of-band deletion, so the
    // budget never accumulates across cycles.
    for cycle in 1..=3 {
        cache.ensure_ready("nginx").await.unwrap();
        assert_eq!(
            remote.write_target_of("nginx"),
            Some("nginx-2025.11.20-000001".to_string()),
            "cycle {cycle}"
        );
        remote.delete_target("nginx-2025.11.20-000001");
        let advice = cache
            .on_write_error("nginx", WriteErrorKind::TargetMissing)
            .unwrap();
        assert_eq!(advice, RecoveryAdvice::Retry, "cycle {cycle}");
    }
    cache.ensure_ready("nginx").await.unwrap();
}

#[tokio::test]
async fn eleven_failures_force_one_reset_and_the_next_attempt_may_succeed() {
    let remote = Arc::new(MockRemote::new());
    let config = ProvisionerConfig {
        anomaly: AnomalyConfig {
            failure_threshold: 10,
            window_seconds: 300,
        },
        ..fast_config()
    };
    let cache = Arc::new(
        ProvisioningCache::with_clock(
            remote.clone(),
            config,
            Arc::new(FixedClock::at("2025-11-20")),
        )
        .unwrap(),
    );

    remote.set_unavailable(true);
    for attempt in 1..=11 {
        let err = cache.ensure_ready("nginx").await.unwrap_err();
        assert!(
            matches!(err, ProvisionError::ProvisioningFailed { .. }),
            "attempt {attempt}"
        );
    }
    // The 11th failure crossed the threshold and cleared the key's state.
    assert!(cache.key_status("nginx").is_none());

    // Attempt 12 is the single allowed post-reset attempt; the remote healed,
    // so it succeeds instead of looping.
    remote.set_unavailable(false);
    cache.ensure_ready("nginx").await.unwrap();
}

#[tokio::test]
async fn batch_deduplication_skips_repeated_keys_within_a_batch() {
    let remote = Arc::new(MockRemote::new());
    let cache = cache_at(remote.clone(), "2025-11-20");
    let naming = lifecycle_core::NamingConfig::default();

    let batch = ["nginx", "nginx", "redis", "My Container/1", "my-container-1"];
    let mut dedup = BatchDeduplicator::new();
    let mut calls = 0;
    for raw in batch {
        let key = ResourceKey::normalize(raw, &naming).unwrap();
        if dedup.first_seen(&key) {
            cache.ensure_ready(raw).await.unwrap();
            calls += 1;
        }
    }
    assert_eq!(calls, 3);
    assert_eq!(remote.counts().create_policy, 3);

    // A new batch re-checks, but Ready keys cost nothing remotely.
    dedup.clear();
    let counts = remote.counts();
    for raw in ["nginx", "redis"] {
        let key = ResourceKey::normalize(raw, &naming).unwrap();
        if dedup.first_seen(&key) {
            cache.ensure_ready(raw).await.unwrap();
        }
    }
    assert_eq!(remote.counts(), counts);
}
