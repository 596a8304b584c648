//! End-to-end executor behavior: admission, isolation, limits, idempotency

use futures::future::join_all;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use std::time::Duration;

use void_wasm_exec::module::ledger::RunState;
use void_wasm_exec::module::security::canary::Variant;
use void_wasm_exec::module::security::permissions::CapabilityKind;
use void_wasm_exec::module::security::signature::sign_module;
use void_wasm_exec::module::traits::{ResourceUsage, TypedValue};
use void_wasm_exec::ExecConfig;

mod common;
use common::*;

#[tokio::test(flavor = "multi_thread")]
async fn test_add_with_rejected_fetch_finishes() {
    let mut harness = Harness::new(permissive_config()).await;
    let sha = harness.register(&add_with_fetch()).await;
    let request = run_request(
        &sha,
        "add(i32,i32)->i32",
        vec![TypedValue::I32(2), TypedValue::I32(3)],
        "example",
        &[CapabilityKind::Emit],
    );

    let outcome = harness.manager.submit(request).await.unwrap();
    assert!(outcome.accepted);
    let view = harness.manager.wait(&outcome.run_id).await.unwrap();

    assert_eq!(view.status, RunState::Finished);
    assert_eq!(view.result, Some(vec![TypedValue::I32(5)]));
    let http = view.usage.counts(CapabilityKind::Http);
    assert_eq!((http.allowed, http.rejected), (0, 1));
    let emit = view.usage.counts(CapabilityKind::Emit);
    assert_eq!((emit.allowed, emit.rejected), (0, 0));
    assert_eq!(harness.fetcher.calls(), 0);

    let kinds: Vec<String> = harness.drain_events().await.into_iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec!["run.started", "run.finished"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capability_outside_allowlist_is_denied_without_execution() {
    let mut harness = Harness::new(ExecConfig::default()).await;
    let sha = harness.register(ADD).await;
    let request = run_request(
        &sha,
        "add(i32,i32)->i32",
        vec![TypedValue::I32(1), TypedValue::I32(1)],
        "p1",
        &[CapabilityKind::Emit, CapabilityKind::Kv],
    );

    let outcome = harness.manager.submit(request).await.unwrap();
    assert!(!outcome.accepted);
    let view = harness.manager.get(&outcome.run_id).await.unwrap();
    assert_eq!(view.status, RunState::Denied);
    assert_eq!(view.reason.as_deref(), Some("capability_not_allowed:kv"));
    assert_eq!(view.error.unwrap().kind, "policy_denied");
    assert!(view.usage.is_zero());
    assert!(view.started_at.is_none());

    let kinds: Vec<String> = harness.drain_events().await.into_iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec!["run.error"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_duplicates_execute_once() {
    let mut harness = Harness::new(permissive_config()).await;
    let sha = harness
        .register(&syscall_module(r#"{"op":"emit","event":{"type":"ci.done"}}"#))
        .await;

    let submissions = (0..8).map(|_| {
        let mut request = run_request(&sha, "run()->i32", vec![], "p2", &[CapabilityKind::Emit]);
        request.idempotency_key = Some("build-42".to_string());
        let manager = harness.manager.clone();
        async move { manager.submit(request).await.unwrap() }
    });
    let outcomes = join_all(submissions).await;
    let run_id = outcomes[0].run_id.clone();
    assert!(outcomes.iter().all(|o| o.run_id == run_id && o.accepted));

    let views = join_all((0..8).map(|_| harness.manager.wait(&run_id))).await;
    let first = views[0].clone().unwrap();
    assert_eq!(first.status, RunState::Finished);
    assert!(views.iter().all(|v| v.as_ref() == Some(&first)));
    assert_eq!(harness.manager.ledger().len().await, 1);

    let events = harness.drain_events().await;
    let module_events = events.iter().filter(|e| e.event_type == "module.event").count();
    let started = events.iter().filter(|e| e.event_type == "run.started").count();
    assert_eq!((module_events, started), (1, 1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_beyond_rate_limit_rejected_run_finishes() {
    let harness = Harness::new(permissive_config()).await;
    let batch: Vec<String> = (0..8)
        .map(|i| format!(r#"{{"op":"http.fetch","id":"f{}","req":{{"url":"http://relay/{}"}}}}"#, i, i))
        .collect();
    let sha = harness.register(&syscall_module(&batch.join("\n"))).await;

    let request = run_request(&sha, "run()->i32", vec![], "p3", &[CapabilityKind::Http]);
    let outcome = harness.manager.submit(request).await.unwrap();
    let view = harness.manager.wait(&outcome.run_id).await.unwrap();

    assert_eq!(view.status, RunState::Finished);
    let http = view.usage.counts(CapabilityKind::Http);
    assert_eq!(http.allowed, 5);
    assert_eq!(http.rejected, 3);
    assert_eq!(harness.fetcher.calls(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_returning_module_times_out_with_monotonic_usage() {
    let mut config = permissive_config();
    config.limits.max_wall_ms = 300;
    config.limits.max_cpu_ms = 10_000;
    config.limits.checkpoint_interval_ms = 10;
    let harness = Harness::new(config).await;
    let sha = harness.register(SPIN).await;

    let outcome = harness
        .manager
        .submit(run_request(&sha, "run()", vec![], "p4", &[]))
        .await
        .unwrap();

    let mut samples: Vec<ResourceUsage> = Vec::new();
    let view = loop {
        let view = harness.manager.get(&outcome.run_id).await.unwrap();
        samples.push(view.usage.clone());
        if view.status.is_terminal() {
            break view;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(view.status, RunState::Timeout);
    assert_eq!(view.error.as_ref().unwrap().kind, "timeout");
    let ran_for = view.finished_at.unwrap() - view.started_at.unwrap();
    assert!(ran_for >= 300, "ran for {}ms", ran_for);
    assert!(ran_for <= 300 + 10 + 250, "ran for {}ms", ran_for);
    assert!(samples.windows(2).all(|w| w[1].dominates(&w[0])));
    assert!(view.usage.cpu_ms > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsigned_module_denied_when_signature_required() {
    let mut config = permissive_config();
    config.signature.required = true;
    let harness = Harness::new(config).await;
    let sha = harness.register(ADD).await;

    let outcome = harness
        .manager
        .submit(run_request(
            &sha,
            "add(i32,i32)->i32",
            vec![TypedValue::I32(1), TypedValue::I32(2)],
            "p5",
            &[],
        ))
        .await
        .unwrap();
    assert!(!outcome.accepted);

    let view = harness.manager.get(&outcome.run_id).await.unwrap();
    assert_eq!(view.status, RunState::Denied);
    let error = view.error.unwrap();
    assert_eq!(error.kind, "verify_failed");
    assert!(!error.retryable);
    assert_eq!(view.reason.as_deref(), Some("signature_missing"));
    assert!(view.usage.is_zero());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signed_module_records_signer() {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
    let public = hex::encode(PublicKey::from_secret_key(&secp, &secret).serialize());

    let mut config = permissive_config();
    config.signature.required = true;
    config
        .signature
        .trusted_signers
        .insert("ci-builder".to_string(), public.clone());
    let harness = Harness::new(config).await;

    let bytes = wat::parse_str(ADD).unwrap();
    let signature = sign_module(&bytes, &secret).unwrap();
    let sha = harness.store.insert(bytes).await;

    let mut request = run_request(
        &sha,
        "add(i32,i32)->i32",
        vec![TypedValue::I32(20), TypedValue::I32(22)],
        "p5b",
        &[],
    );
    request.module.signature = Some(signature);
    request.module.public_key = Some(public);

    let outcome = harness.manager.submit(request).await.unwrap();
    let view = harness.manager.wait(&outcome.run_id).await.unwrap();
    assert_eq!(view.status, RunState::Finished);
    assert_eq!(view.signer.as_deref(), Some("ci-builder"));
    assert_eq!(view.result, Some(vec![TypedValue::I32(42)]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kv_writes_beyond_key_ceiling_rejected() {
    let mut config = permissive_config();
    config.capabilities.kv.max_keys = 3;
    let harness = Harness::new(config).await;

    let mut batch: Vec<String> = (0..5)
        .map(|i| format!(r#"{{"op":"kv.set","key":"k{}","value":"v{}"}}"#, i, i))
        .collect();
    batch.push(r#"{"op":"kv.get","key":"k0"}"#.to_string());
    let sha = harness.register(&syscall_module(&batch.join("\n"))).await;

    let outcome = harness
        .manager
        .submit(run_request(&sha, "run()->i32", vec![], "p6", &[CapabilityKind::Kv]))
        .await
        .unwrap();
    let view = harness.manager.wait(&outcome.run_id).await.unwrap();

    assert_eq!(view.status, RunState::Finished);
    let kv = view.usage.counts(CapabilityKind::Kv);
    assert_eq!((kv.allowed, kv.rejected), (4, 2));

    let store = harness.manager.gateway().kv();
    assert_eq!(store.get("p6", "k0").await.as_deref(), Some("v0"));
    assert_eq!(store.get("p6", "k2").await.as_deref(), Some("v2"));
    assert_eq!(store.get("p6", "k4").await, None);
    assert_eq!(store.key_count("p6").await, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_memory_ceiling_ends_run_with_error() {
    let mut config = permissive_config();
    config.limits.max_memory_pages = 4;
    let harness = Harness::new(config).await;
    let sha = harness
        .register(
            r#"(module
              (memory (export "memory") 1)
              (func (export "run") (result i32)
                (memory.grow (i32.const 16))))"#,
        )
        .await;

    let outcome = harness
        .manager
        .submit(run_request(&sha, "run()->i32", vec![], "p7", &[]))
        .await
        .unwrap();
    let view = harness.manager.wait(&outcome.run_id).await.unwrap();
    assert_eq!(view.status, RunState::Error);
    assert_eq!(view.error.unwrap().kind, "resource_exceeded");
    assert!(view.usage.memory_pages <= 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kill_switch_and_dry_run() {
    let mut config = permissive_config();
    config.policy.enabled = false;
    let harness = Harness::new(config).await;
    let sha = harness.register(ADD).await;
    let args = vec![TypedValue::I32(1), TypedValue::I32(1)];

    let outcome = harness
        .manager
        .submit(run_request(&sha, "add(i32,i32)->i32", args.clone(), "p8", &[]))
        .await
        .unwrap();
    assert!(!outcome.accepted);
    let view = harness.manager.get(&outcome.run_id).await.unwrap();
    assert_eq!(view.reason.as_deref(), Some("service_disabled"));

    let mut config = permissive_config();
    config.dry_run = true;
    let mut harness = Harness::new(config).await;
    let sha = harness.register(ADD).await;
    let outcome = harness
        .manager
        .submit(run_request(&sha, "add(i32,i32)->i32", args, "p8", &[]))
        .await
        .unwrap();
    assert!(outcome.accepted);
    let view = harness.manager.wait(&outcome.run_id).await.unwrap();
    assert_eq!(view.status, RunState::Finished);
    assert_eq!(view.result, Some(vec![]));
    assert!(view.started_at.is_none());
    let kinds: Vec<String> = harness.drain_events().await.into_iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec!["run.finished"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_canary_and_freeze_modes() {
    let mut config = permissive_config();
    config.policy.canary.fraction = 1.0;
    let harness = Harness::new(config).await;
    let sha = harness.register(ADD).await;
    let args = vec![TypedValue::I32(1), TypedValue::I32(1)];
    let outcome = harness
        .manager
        .submit(run_request(&sha, "add(i32,i32)->i32", args.clone(), "p9", &[]))
        .await
        .unwrap();
    assert_eq!(outcome.mode, Variant::Canary);

    // freeze admits with the frozen capability set only
    let mut config = permissive_config();
    config.policy.freeze = true;
    let harness = Harness::new(config).await;
    let sha = harness.register(&add_with_fetch()).await;
    let outcome = harness
        .manager
        .submit(run_request(
            &sha,
            "add(i32,i32)->i32",
            args,
            "p9",
            &[CapabilityKind::Emit, CapabilityKind::Http],
        ))
        .await
        .unwrap();
    assert!(outcome.accepted);
    assert_eq!(outcome.mode, Variant::Stable);
    let view = harness.manager.wait(&outcome.run_id).await.unwrap();
    assert_eq!(view.reason.as_deref(), Some("freeze_fail_open"));
    assert_eq!(view.usage.counts(CapabilityKind::Http).rejected, 1);
    assert_eq!(view.result, Some(vec![TypedValue::I32(2)]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_module_is_verification_failure() {
    let harness = Harness::new(permissive_config()).await;
    let outcome = harness
        .manager
        .submit(run_request(&"0".repeat(64), "run()", vec![], "p10", &[]))
        .await
        .unwrap();
    assert!(!outcome.accepted);
    let view = harness.manager.get(&outcome.run_id).await.unwrap();
    assert_eq!(view.status, RunState::Denied);
    assert_eq!(view.error.unwrap().kind, "verify_failed");
}
