mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use affresco::{
    CODE_DECODE, CODE_UNEXPECTED, CacheConfig, CacheService, EntryParams, EntryState,
    GridAtlasBuilder, ImageFormat, LoadOptions, Owner,
};
use support::{ScriptedTransport, TextDecoder, anim_body, still_body};

const URL: &str = "https://cdn.example.com/images/photo.png";

fn service(transport: Arc<ScriptedTransport>, dir: &Path) -> CacheService {
    CacheService::with_parts(
        CacheConfig::default(),
        dir,
        transport,
        Arc::new(TextDecoder),
        Arc::new(GridAtlasBuilder),
    )
}

fn payload_path(dir: &Path, entry: &affresco::CacheEntry, extension: &str) -> std::path::PathBuf {
    let key = entry.key();
    dir.join("webimages")
        .join(key.provider_key.to_string())
        .join(format!("{}.{extension}", key.file_key))
}

#[tokio::test]
async fn still_image_load_reaches_loaded_and_persists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_ok(URL, 200, Some("\"v1\""), &still_body(64, 32));
    let svc = service(Arc::clone(&transport), dir.path());

    let owner = Owner::new();
    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    entry.request(Some(&owner), &LoadOptions::default()).await;

    assert_eq!(entry.state(), EntryState::Loaded);
    assert_eq!(entry.format(), ImageFormat::Bin);
    assert_eq!((entry.width(), entry.height()), (64, 32));
    assert_eq!(entry.weight_bytes(), 64 * 32 * 4);
    assert_eq!(svc.total_cache_size(), 64 * 32 * 4);
    assert_eq!(entry.use_count(), 1);

    assert!(payload_path(dir.path(), &entry, "bin").exists());
    assert!(payload_path(dir.path(), &entry, "meta").exists());
    assert!(svc.exists(URL, "").await);
}

#[tokio::test]
async fn revalidation_sends_etag_and_reloads_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_ok(URL, 200, Some("\"v1\""), &still_body(64, 32));
    {
        let svc = service(Arc::clone(&transport), dir.path());
        let entry = svc
            .lookup_or_create(URL, EntryParams::default())
            .expect("entry for url");
        entry.request(None, &LoadOptions::default()).await;
        assert_eq!(entry.state(), EntryState::Loaded);
    }

    // Fresh registry, warm disk: the stored etag turns the fetch conditional
    // and 304 resolves the payload locally.
    transport.script(
        URL,
        support::Scripted::Ok {
            status: 304,
            etag: None,
            body: Vec::new(),
        },
    );
    let svc = service(Arc::clone(&transport), dir.path());
    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    entry.request(None, &LoadOptions::default()).await;

    assert_eq!(entry.state(), EntryState::Loaded);
    assert_eq!((entry.width(), entry.height()), (64, 32));
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, None);
    assert_eq!(calls[1].1.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn legacy_etag_sidecar_enables_conditional_fetch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_ok(URL, 200, Some("\"v1\""), &still_body(16, 16));
    {
        let svc = service(Arc::clone(&transport), dir.path());
        let entry = svc
            .lookup_or_create(URL, EntryParams::default())
            .expect("entry for url");
        entry.request(None, &LoadOptions::default()).await;
        assert_eq!(entry.state(), EntryState::Loaded);

        // Degrade to the legacy layout: no metadata, plain-text sidecar.
        std::fs::remove_file(payload_path(dir.path(), &entry, "meta")).expect("drop meta");
        std::fs::write(payload_path(dir.path(), &entry, "etag"), "\"v1\"").expect("write sidecar");
    }

    transport.script(
        URL,
        support::Scripted::Ok {
            status: 304,
            etag: None,
            body: Vec::new(),
        },
    );
    let svc = service(Arc::clone(&transport), dir.path());
    let entry = svc
        .lookup_or_create(
            URL,
            EntryParams {
                format: ImageFormat::Bin,
                ..EntryParams::default()
            },
        )
        .expect("entry for url");
    entry.request(None, &LoadOptions::default()).await;

    assert_eq!(entry.state(), EntryState::Loaded);
    assert_eq!(transport.calls().last().unwrap().1.as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn http_failure_sets_error_state_and_unbinds_owner() {
    let dir = tempfile::tempdir().expect("tempdir");
    // No scripted reply: the transport answers 404.
    let transport = Arc::new(ScriptedTransport::new());
    let svc = service(Arc::clone(&transport), dir.path());

    let owner = Owner::new();
    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    entry.request(Some(&owner), &LoadOptions::default()).await;

    assert_eq!(entry.state(), EntryState::Error);
    let err = entry.error().expect("load error");
    assert_eq!(err.code, 404);
    assert_eq!(entry.use_count(), 0);
    assert_eq!(svc.total_cache_size(), 0);
}

#[tokio::test]
async fn errored_entry_is_retryable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    let svc = service(Arc::clone(&transport), dir.path());
    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");

    entry.request(None, &LoadOptions::default()).await;
    assert_eq!(entry.state(), EntryState::Error);

    transport.script_ok(URL, 200, None, &still_body(8, 8));
    entry.request(None, &LoadOptions::default()).await;
    assert_eq!(entry.state(), EntryState::Loaded);
    assert!(entry.error().is_none());
    assert_eq!(svc.total_cache_size(), 8 * 8 * 4);
}

#[tokio::test]
async fn undecodable_body_maps_to_decode_error_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_ok(URL, 200, None, b"BROKEN PAYLOAD");
    let svc = service(Arc::clone(&transport), dir.path());

    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    entry.request(None, &LoadOptions::default()).await;

    assert_eq!(entry.state(), EntryState::Error);
    assert_eq!(entry.error().expect("load error").code, CODE_DECODE);
}

#[tokio::test]
async fn not_modified_without_precondition_is_unexpected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.script(
        URL,
        support::Scripted::Ok {
            status: 304,
            etag: None,
            body: Vec::new(),
        },
    );
    let svc = service(Arc::clone(&transport), dir.path());

    let entry = svc
        .lookup_or_create(
            URL,
            EntryParams {
                format: ImageFormat::Bin,
                ..EntryParams::default()
            },
        )
        .expect("entry for url");
    entry.request(None, &LoadOptions::default()).await;

    assert_eq!(entry.state(), EntryState::Error);
    assert_eq!(entry.error().expect("load error").code, CODE_UNEXPECTED);
}

#[tokio::test]
async fn animated_load_builds_atlas_with_frame_cap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    let delays = [100u32; 10];
    transport.script_ok(URL, 200, None, &anim_body(10, 10, &delays));
    let svc = service(Arc::clone(&transport), dir.path());

    let entry = svc
        .lookup_or_create(
            URL,
            EntryParams {
                format: ImageFormat::Unknown,
                max_frames: 4,
            },
        )
        .expect("entry for url");
    entry.request(None, &LoadOptions::default()).await;

    assert_eq!(entry.state(), EntryState::Loaded);
    assert_eq!(entry.format(), ImageFormat::Gif);
    assert_eq!(entry.frame_rects().len(), 4 * 4);
    let frame_delays = entry.delays();
    assert_eq!(frame_delays.len(), 4);
    assert!(frame_delays.iter().all(|d| *d > 0.0));
    // Four 10x10 frames pack into one 40x10 row under the default width.
    assert_eq!(entry.weight_bytes(), 40 * 10 * 4);

    assert!(payload_path(dir.path(), &entry, "gif").exists());
    assert!(payload_path(dir.path(), &entry, "meta").exists());
}

#[tokio::test]
async fn animated_payload_reloads_from_persisted_metadata() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_ok(URL, 200, Some("\"a1\""), &anim_body(10, 10, &[40, 60, 80]));
    {
        let svc = service(Arc::clone(&transport), dir.path());
        let entry = svc
            .lookup_or_create(URL, EntryParams::default())
            .expect("entry for url");
        entry.request(None, &LoadOptions::default()).await;
        assert_eq!(entry.state(), EntryState::Loaded);
    }

    transport.script(
        URL,
        support::Scripted::Ok {
            status: 304,
            etag: None,
            body: Vec::new(),
        },
    );
    let svc = service(Arc::clone(&transport), dir.path());
    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    entry.request(None, &LoadOptions::default()).await;

    assert_eq!(entry.state(), EntryState::Loaded);
    assert_eq!(entry.frame_rects().len(), 3 * 4);
    assert_eq!(entry.delays(), vec![0.04, 0.06, 0.08]);
}

#[tokio::test]
async fn release_with_dispose_frees_entry_and_next_lookup_is_fresh() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_ok(URL, 200, None, &still_body(32, 32));
    let svc = service(Arc::clone(&transport), dir.path());

    let owner = Owner::new();
    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    entry.request(Some(&owner), &LoadOptions::default()).await;
    assert_eq!(svc.total_cache_size(), 32 * 32 * 4);

    entry.release(Some(&owner), true);
    assert_eq!(entry.state(), EntryState::Disposed);
    assert_eq!(svc.total_cache_size(), 0);
    assert_eq!(svc.entry_count(), 0);

    let fresh = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    assert!(!Arc::ptr_eq(&entry, &fresh));
    assert_eq!(fresh.state(), EntryState::Unloaded);
}

#[tokio::test]
async fn dropped_owner_tokens_are_pruned_on_sweep() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_ok(URL, 200, None, &still_body(4, 4));
    let svc = service(Arc::clone(&transport), dir.path());

    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    {
        let owner = Owner::new();
        entry.request(Some(&owner), &LoadOptions::default()).await;
        assert_eq!(entry.use_count(), 1);
        // Token dropped without a release.
    }

    svc.clear_invalid_owners(true);
    assert_eq!(entry.state(), EntryState::Disposed);
    assert_eq!(svc.total_cache_size(), 0);
}

#[tokio::test]
async fn concurrent_requests_share_one_fetch() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::with_delay(Duration::from_millis(20)));
    transport.script_ok(URL, 200, None, &still_body(12, 12));
    let svc = service(Arc::clone(&transport), dir.path());

    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    let (a, b) = (Arc::clone(&entry), Arc::clone(&entry));
    let opts = LoadOptions::default();
    tokio::join!(a.request(None, &opts), b.request(None, &opts));

    assert_eq!(transport.call_count(), 1);
    assert_eq!(entry.state(), EntryState::Loaded);
    assert_eq!(svc.total_cache_size(), 12 * 12 * 4);
}

#[tokio::test]
async fn concurrent_requests_share_one_failed_fetch() {
    let dir = tempfile::tempdir().expect("tempdir");
    // No scripted reply: the single fetch answers 404 after the delay.
    let transport = Arc::new(ScriptedTransport::with_delay(Duration::from_millis(20)));
    let svc = service(Arc::clone(&transport), dir.path());

    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    let (a, b) = (Arc::clone(&entry), Arc::clone(&entry));
    let opts = LoadOptions::default();
    tokio::join!(a.request(None, &opts), b.request(None, &opts));

    // The queued caller observes the shared failure instead of fetching.
    assert_eq!(transport.call_count(), 1);
    assert_eq!(entry.state(), EntryState::Error);
    assert_eq!(entry.error().expect("load error").code, 404);

    // A request made after the failure settled is still a fresh retry.
    transport.script_ok(URL, 200, None, &still_body(8, 8));
    entry.request(None, &LoadOptions::default()).await;
    assert_eq!(entry.state(), EntryState::Loaded);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn progress_reaches_one_after_completion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = Arc::new(ScriptedTransport::new());
    transport.script_ok(URL, 200, None, &still_body(6, 6));
    let svc = service(Arc::clone(&transport), dir.path());

    let entry = svc
        .lookup_or_create(URL, EntryParams::default())
        .expect("entry for url");
    let progress = entry.progress();
    entry.request(None, &LoadOptions::default()).await;
    assert_eq!(*progress.borrow(), 1.0);
}
