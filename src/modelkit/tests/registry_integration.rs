//! Integration tests: push, pull and unpack against an in-process registry.
//!
//! ```bash
//! cargo test -p kitops-modelkit --test registry_integration
//! ```

mod common;

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{MockOptions, MockRegistry};
use kitops_core::config::ingest_path;
use kitops_modelkit::oci::{get_manifest, Reference, Target};
use kitops_modelkit::{
    pack, pull, push, remove_remote, unpack, KitConfig, KitContext, KitError, NetworkOptions,
    PackOptions, UnpackOptions,
};

fn network() -> NetworkOptions {
    NetworkOptions {
        plain_http: true,
        ..Default::default()
    }
}

fn context(home: &TempDir, network: NetworkOptions) -> KitContext {
    KitContext::new(&KitConfig::with_home(home.path())).with_network(network)
}

fn write_files(dir: &Path, files: &[(&str, &[u8])]) {
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

/// Pack a model plus docs source tree under `reference`.
async fn pack_sample(ctx: &KitContext, reference: &Reference, weights: &[u8]) -> TempDir {
    let src = TempDir::new().unwrap();
    write_files(
        src.path(),
        &[
            (
                "Kitfile",
                b"manifestVersion: 1.0.0\npackage:\n  name: sample\nmodel:\n  path: model.bin\ndocs:\n  - path: README.md\n",
            ),
            ("model.bin", weights),
            ("README.md", b"# sample"),
        ],
    );
    pack(ctx, &PackOptions::new(src.path(), reference.clone()))
        .await
        .unwrap();
    src
}

#[tokio::test]
async fn test_push_pull_unpack_round_trip() {
    let registry = MockRegistry::start(MockOptions::default()).await;
    let reference = Reference::parse_single(&format!("{}/org/model:v1", registry.host())).unwrap();

    let home_a = TempDir::new().unwrap();
    let ctx_a = context(&home_a, network());
    let _src = pack_sample(&ctx_a, &reference, b"0123456789").await;

    let pushed = push(&ctx_a, &reference, &reference).await.unwrap();
    assert!(registry.has_manifest("org/model", "v1"));
    assert!(registry.has_manifest("org/model", &pushed.digest));
    // config + model + docs
    assert_eq!(registry.state.lock().blobs.len(), 3);

    let uploads = registry.count("POST");
    push(&ctx_a, &reference, &reference).await.unwrap();
    assert_eq!(registry.count("POST"), uploads, "existing blobs are not uploaded again");

    let home_b = TempDir::new().unwrap();
    let ctx_b = context(&home_b, network());
    let pulled = pull(&ctx_b, &reference).await.unwrap();
    assert_eq!(pulled.digest, pushed.digest);

    let local = ctx_b.local_repository(&reference).unwrap();
    assert_eq!(local.resolve("v1").await.unwrap().digest, pushed.digest);

    let out = TempDir::new().unwrap();
    let summary = unpack(&ctx_b, &UnpackOptions::new(reference.clone(), out.path()))
        .await
        .unwrap();
    assert_eq!(summary.digest, pushed.digest);
    assert_eq!(std::fs::read(out.path().join("model.bin")).unwrap(), b"0123456789");
    assert_eq!(std::fs::read(out.path().join("README.md")).unwrap(), b"# sample");
    assert!(out.path().join("Kitfile").exists());
}

#[tokio::test]
async fn test_chunked_upload() {
    let registry = MockRegistry::start(MockOptions::default()).await;
    let reference = Reference::parse_single(&format!("{}/org/chunked:v1", registry.host())).unwrap();

    let home = TempDir::new().unwrap();
    let chunk_size = 512;
    let ctx = context(
        &home,
        NetworkOptions {
            chunk_size,
            ..network()
        },
    );
    let src = TempDir::new().unwrap();
    write_files(
        src.path(),
        &[
            ("Kitfile", b"manifestVersion: 1.0.0\nmodel:\n  path: model.bin\n"),
            ("model.bin", &[7u8; 3000]),
        ],
    );
    let desc = pack(&ctx, &PackOptions::new(src.path(), reference.clone()))
        .await
        .unwrap();
    let local = ctx.local_repository(&reference).unwrap();
    let manifest = get_manifest(&local, &desc).await.unwrap();
    let layer = &manifest.layers[0];
    assert!(layer.size >= chunk_size);

    push(&ctx, &reference, &reference).await.unwrap();

    let expected_chunks = layer.size.div_ceil(chunk_size) as usize;
    assert_eq!(registry.count("PATCH"), expected_chunks);
    // The registry verified the digest when the upload was closed.
    assert!(registry.state.lock().blobs.contains_key(&layer.digest));
    assert!(registry.state.lock().blobs.contains_key(&manifest.config.digest));
}

#[tokio::test]
async fn test_bearer_token_authentication() {
    let registry = MockRegistry::start(MockOptions {
        bearer_token: Some("s3cr3t".to_string()),
        ..Default::default()
    })
    .await;
    let reference = Reference::parse_single(&format!("{}/org/private:v1", registry.host())).unwrap();

    let home_a = TempDir::new().unwrap();
    let ctx_a = context(&home_a, network());
    let _src = pack_sample(&ctx_a, &reference, b"weights").await;
    push(&ctx_a, &reference, &reference).await.unwrap();
    assert!(registry.has_manifest("org/private", "v1"));

    let home_b = TempDir::new().unwrap();
    let ctx_b = context(&home_b, network());
    pull(&ctx_b, &reference).await.unwrap();

    let token_requests = registry
        .requests()
        .iter()
        .filter(|r| r.path == "/token")
        .count();
    assert!(token_requests >= 1);
}

#[tokio::test]
async fn test_pull_resumes_partial_download() {
    let registry = MockRegistry::start(MockOptions {
        ranges: true,
        ..Default::default()
    })
    .await;
    let reference = Reference::parse_single(&format!("{}/org/resume:v1", registry.host())).unwrap();

    let home_a = TempDir::new().unwrap();
    let ctx_a = context(&home_a, network());
    let _src = pack_sample(&ctx_a, &reference, &[3u8; 4096]).await;
    let desc = push(&ctx_a, &reference, &reference).await.unwrap();
    let local_a = ctx_a.local_repository(&reference).unwrap();
    let manifest = get_manifest(&local_a, &desc).await.unwrap();
    let layer = manifest.layers[0].clone();
    let layer_bytes = std::fs::read(local_a.blob_path(&layer).unwrap()).unwrap();

    // Leave half of the model layer behind as an interrupted download.
    let home_b = TempDir::new().unwrap();
    let ctx_b = context(&home_b, network());
    let ingest = ingest_path(&ctx_b.storage);
    std::fs::create_dir_all(&ingest).unwrap();
    let half = layer_bytes.len() / 2;
    std::fs::write(ingest.join(layer.encoded().unwrap()), &layer_bytes[..half]).unwrap();

    pull(&ctx_b, &reference).await.unwrap();

    let expected_range = format!("bytes={}-", half);
    let resumed = registry.requests().into_iter().any(|r| {
        r.method == "GET" && r.path.ends_with(&layer.digest) && r.range.as_deref() == Some(&expected_range)
    });
    assert!(resumed, "layer download should resume at byte {}", half);

    let local_b = ctx_b.local_repository(&reference).unwrap();
    assert_eq!(std::fs::read(local_b.blob_path(&layer).unwrap()).unwrap(), layer_bytes);
    assert!(!ingest.join(layer.encoded().unwrap()).exists());
}

#[tokio::test]
async fn test_pull_follows_parent_reference() {
    let registry = MockRegistry::start(MockOptions::default()).await;
    let base = Reference::parse_single(&format!("{}/org/base:v1", registry.host())).unwrap();
    let child = Reference::parse_single(&format!("{}/org/tuned:v1", registry.host())).unwrap();

    let home_a = TempDir::new().unwrap();
    let ctx_a = context(&home_a, network());
    let _base_src = pack_sample(&ctx_a, &base, b"base weights").await;
    push(&ctx_a, &base, &base).await.unwrap();

    let child_src = TempDir::new().unwrap();
    let kitfile = format!(
        "manifestVersion: 1.0.0\nmodel:\n  path: {}\ndocs:\n  - path: NOTES.md\n",
        base
    );
    write_files(
        child_src.path(),
        &[("Kitfile", kitfile.as_bytes()), ("NOTES.md", b"tuned")],
    );
    pack(&ctx_a, &PackOptions::new(child_src.path(), child.clone()))
        .await
        .unwrap();
    push(&ctx_a, &child, &child).await.unwrap();

    let home_b = TempDir::new().unwrap();
    let ctx_b = context(&home_b, network());
    pull(&ctx_b, &child).await.unwrap();
    let base_repo = ctx_b.local_repository(&base).unwrap();
    assert!(base_repo.resolve("v1").await.is_ok());

    let out = TempDir::new().unwrap();
    unpack(
        &ctx_b,
        &UnpackOptions::new(child.clone(), out.path()).with_parents(true),
    )
    .await
    .unwrap();
    assert_eq!(std::fs::read(out.path().join("model.bin")).unwrap(), b"base weights");
    assert_eq!(std::fs::read(out.path().join("NOTES.md")).unwrap(), b"tuned");
}

#[tokio::test]
async fn test_pull_missing_tag_is_not_found() {
    let registry = MockRegistry::start(MockOptions::default()).await;
    let reference = Reference::parse_single(&format!("{}/org/missing:v1", registry.host())).unwrap();
    let home = TempDir::new().unwrap();
    let ctx = context(&home, network());
    let err = pull(&ctx, &reference).await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_remove_remote() {
    let home = TempDir::new().unwrap();
    let ctx = context(&home, network());

    let locked = MockRegistry::start(MockOptions::default()).await;
    let reference = Reference::parse_single(&format!("{}/org/model:v1", locked.host())).unwrap();
    let _src = pack_sample(&ctx, &reference, b"weights").await;
    push(&ctx, &reference, &reference).await.unwrap();
    assert!(matches!(
        remove_remote(&ctx, &reference).await,
        Err(KitError::Unsupported(_))
    ));

    let open = MockRegistry::start(MockOptions {
        allow_delete: true,
        ..Default::default()
    })
    .await;
    let target = Reference::parse_single(&format!("{}/org/model:v1", open.host())).unwrap();
    push(&ctx, &reference, &target).await.unwrap();
    let removed = remove_remote(&ctx, &target).await.unwrap();
    assert!(!open.has_manifest("org/model", "v1"));
    assert!(!open.has_manifest("org/model", &removed.digest));
}

#[tokio::test]
async fn test_chunk_range_mismatch_aborts_push() {
    let registry = MockRegistry::start(MockOptions {
        short_ranges: true,
        ..Default::default()
    })
    .await;
    let reference = Reference::parse_single(&format!("{}/org/short:v1", registry.host())).unwrap();

    let home = TempDir::new().unwrap();
    let ctx = context(
        &home,
        NetworkOptions {
            chunk_size: 512,
            ..network()
        },
    );
    let _src = pack_sample(&ctx, &reference, &[9u8; 3000]).await;

    let err = push(&ctx, &reference, &reference).await.unwrap_err();
    assert!(
        matches!(err, KitError::UploadRangeMismatch { .. }),
        "unexpected error: {}",
        err
    );
    // Model and docs layers are both chunked; each stops at its first PATCH.
    assert!(registry.count("PATCH") <= 2);
    assert!(!registry.has_manifest("org/short", "v1"));
}

#[tokio::test]
async fn test_slow_registry_times_out() {
    let registry = MockRegistry::start(MockOptions {
        manifest_delay: Some(Duration::from_secs(3)),
        ..Default::default()
    })
    .await;
    let reference = Reference::parse_single(&format!("{}/org/slow:v1", registry.host())).unwrap();

    let home = TempDir::new().unwrap();
    let ctx = context(
        &home,
        NetworkOptions {
            metadata_timeout_secs: 1,
            ..network()
        },
    );
    let err = pull(&ctx, &reference).await.unwrap_err();
    assert!(matches!(err, KitError::Timeout(_)), "unexpected error: {}", err);
    assert!(!err.is_canceled());
}

#[tokio::test]
async fn test_canceled_pull_is_not_a_timeout() {
    let registry = MockRegistry::start(MockOptions {
        blob_delay: Some(Duration::from_secs(5)),
        ..Default::default()
    })
    .await;
    let reference = Reference::parse_single(&format!("{}/org/canceled:v1", registry.host())).unwrap();

    let home_a = TempDir::new().unwrap();
    let ctx_a = context(&home_a, network());
    let _src = pack_sample(&ctx_a, &reference, b"weights").await;
    push(&ctx_a, &reference, &reference).await.unwrap();

    let cancel = CancellationToken::new();
    let home_b = TempDir::new().unwrap();
    let ctx_b = context(&home_b, network()).with_cancel(cancel.clone());
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(4), pull(&ctx_b, &reference))
        .await
        .expect("pull should stop as soon as it is canceled")
        .unwrap_err();
    assert!(err.is_canceled(), "unexpected error: {}", err);
    let local = ctx_b.local_repository(&reference).unwrap();
    assert!(local.resolve("v1").await.is_err());
}
