//! Module resolution from file sources, sidecar signatures and the cache

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use tempfile::TempDir;

use void_wasm_exec::module::ledger::RunState;
use void_wasm_exec::module::registry::store::ModuleOrigin;
use void_wasm_exec::module::security::signature::{module_digest, sign_module};
use void_wasm_exec::module::traits::{ModuleReference, TypedValue};

mod common;
use common::*;

struct SignedFile {
    dir: TempDir,
    sha256: String,
    public_key: String,
}

fn write_signed_module(wat_src: &str) -> SignedFile {
    let dir = TempDir::new().unwrap();
    let bytes = wat::parse_str(wat_src).unwrap();
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[11u8; 32]).unwrap();
    let public_key = hex::encode(PublicKey::from_secret_key(&secp, &secret).serialize());

    let path = dir.path().join("add.wasm");
    std::fs::write(&path, &bytes).unwrap();
    std::fs::write(dir.path().join("add.wasm.sig"), sign_module(&bytes, &secret).unwrap()).unwrap();
    std::fs::write(dir.path().join("add.wasm.pub"), &public_key).unwrap();

    SignedFile {
        sha256: module_digest(&bytes),
        dir,
        public_key,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_source_with_sidecar_signature() {
    let file = write_signed_module(ADD);
    let mut config = permissive_config();
    config.signature.required = true;
    config
        .signature
        .trusted_signers
        .insert("release".to_string(), file.public_key.clone());
    let harness = Harness::new(config).await;

    let mut request = run_request(
        &file.sha256,
        "add(i32,i32)->i32",
        vec![TypedValue::I32(40), TypedValue::I32(2)],
        "src-1",
        &[],
    );
    request.module.source = Some(format!("file://{}", file.dir.path().join("add.wasm").display()));

    let outcome = harness.manager.submit(request.clone()).await.unwrap();
    let view = harness.manager.wait(&outcome.run_id).await.unwrap();
    assert_eq!(view.status, RunState::Finished);
    assert_eq!(view.signer.as_deref(), Some("release"));
    assert_eq!(view.result, Some(vec![TypedValue::I32(42)]));

    // second resolution comes from the cache, sidecars included
    let artifact = harness.store.fetch(&request.module).await.unwrap();
    assert_eq!(artifact.origin, ModuleOrigin::Cache);
    assert!(artifact.sidecar.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tampered_file_is_rejected() {
    let file = write_signed_module(ADD);
    // the digest names different content than the file holds
    let other = module_digest(b"something else");
    let harness = Harness::new(permissive_config()).await;

    let mut request = run_request(&other, "run()", vec![], "src-2", &[]);
    request.module.source = Some(format!("file://{}", file.dir.path().join("add.wasm").display()));
    let outcome = harness.manager.submit(request).await.unwrap();
    assert!(!outcome.accepted);

    let view = harness.manager.get(&outcome.run_id).await.unwrap();
    assert_eq!(view.status, RunState::Denied);
    assert_eq!(view.reason.as_deref(), Some("digest_mismatch"));

    // nothing was cached under the claimed digest
    let mut reference = ModuleReference::new(other, "run()".parse().unwrap());
    reference.source = Some(format!("file://{}", file.dir.path().join("add.wasm").display()));
    let artifact = harness.store.fetch(&reference).await.unwrap();
    assert_eq!(artifact.origin, ModuleOrigin::File);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_source_scheme() {
    let harness = Harness::new(permissive_config()).await;
    let mut request = run_request(&module_digest(b"x"), "run()", vec![], "src-3", &[]);
    request.module.source = Some("ftp://example/mod.wasm".to_string());
    let outcome = harness.manager.submit(request).await.unwrap();
    let view = harness.manager.get(&outcome.run_id).await.unwrap();
    assert_eq!(view.status, RunState::Denied);
    let error = view.error.unwrap();
    assert_eq!(error.kind, "verify_failed");
    assert!(error.detail.contains("unsupported module source"));
}
