//! Cache graphs built by the factory

use artcache::{ArtifactCaches, CacheEnvironment};
use artcache_core::{
    ArtifactCache, ArtifactCacheConfig, ArtifactInfo, ArtifactSource, CacheResultType, RuleKey,
};
use artcache_events::{ConnectEvent, EventCategory, RecordingEventSink};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn key(hex: &str) -> RuleKey {
    RuleKey::from_hex(hex).unwrap()
}

fn environment(sink: &Arc<RecordingEventSink>) -> CacheEnvironment {
    CacheEnvironment {
        event_sink: sink.clone(),
        wifi_ssid: None,
        user: "builder".into(),
        host: "ci-01".into(),
        invocation_id: "test-invocation".into(),
    }
}

fn factory(toml: &str, sink: &Arc<RecordingEventSink>) -> ArtifactCaches {
    let config = ArtifactCacheConfig::from_toml_str(toml).unwrap();
    ArtifactCaches::new(config, environment(sink)).unwrap()
}

fn dir_and_sqlite(root: &Path) -> String {
    format!(
        r#"
[cache]
mode = ["dir", "sqlite"]

[[cache.dir]]
path = "{dir}"

[[cache.sqlite]]
path = "{db}"
"#,
        dir = root.join("dir").display(),
        db = root.join("cache.db").display(),
    )
}

fn dir_only(root: &Path) -> String {
    format!(
        "[cache]\nmode = [\"dir\"]\n[[cache.dir]]\npath = \"{}\"\n",
        root.join("dir").display()
    )
}

fn write(root: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = root.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

#[tokio::test]
async fn test_no_modes_builds_noop() {
    let sink = Arc::new(RecordingEventSink::new());
    let caches = factory("[cache]\nmode = []\n", &sink);
    let cache = caches.new_instance().unwrap();
    assert_eq!(cache.name(), "noop");

    let tmp = TempDir::new().unwrap();
    let result = cache.fetch(None, &key("aa"), &tmp.path().join("out")).await;
    assert_eq!(result.kind(), CacheResultType::Miss);
}

#[tokio::test]
async fn test_single_dir_cache_is_not_wrapped_in_multi() {
    let tmp = TempDir::new().unwrap();
    let sink = Arc::new(RecordingEventSink::new());
    let caches = factory(&dir_only(tmp.path()), &sink);
    let cache = caches.new_instance().unwrap();
    assert_eq!(cache.name(), "dir");

    let source = write(tmp.path(), "src", b"artifact");
    cache
        .store(&ArtifactInfo::for_key(key("01")), &ArtifactSource::copy_from(&source))
        .await
        .unwrap();
    let out = tmp.path().join("out");
    let result = cache.fetch(Some("//a:b"), &key("01"), &out).await;
    assert_eq!(result.kind(), CacheResultType::Hit);
    assert_eq!(std::fs::read(&out).unwrap(), b"artifact");

    let events = sink.events();
    assert!(matches!(
        events.first().map(|e| &e.category),
        Some(EventCategory::Connect(ConnectEvent::Started))
    ));
    assert!(events.iter().any(|e| matches!(
        e.category,
        EventCategory::Connect(ConnectEvent::Finished { .. })
    )));
    assert!(events.iter().any(|e| matches!(e.category, EventCategory::Store(ref s) if s.success)));
    assert!(events.iter().any(|e| matches!(
        e.category,
        EventCategory::Fetch(ref f) if f.outcome == "hit" && f.target.as_deref() == Some("//a:b")
    )));
}

#[tokio::test]
async fn test_instance_variants_filter_by_locality() {
    let tmp = TempDir::new().unwrap();
    let sink = Arc::new(RecordingEventSink::new());
    let caches = factory(&dir_and_sqlite(tmp.path()), &sink);

    assert_eq!(caches.new_instance().unwrap().name(), "multi");
    assert_eq!(caches.local_only_instance().unwrap().name(), "multi");

    let remote = caches.remote_only_instance().unwrap();
    let source = write(tmp.path(), "src", b"x");
    remote
        .store(&ArtifactInfo::for_key(key("02")), &ArtifactSource::copy_from(&source))
        .await
        .unwrap();
    let local = caches.local_only_instance().unwrap();
    let result = local.fetch(None, &key("02"), &tmp.path().join("out")).await;
    assert_eq!(result.kind(), CacheResultType::Miss);
    assert_eq!(caches.instance_count(), 4);
}

#[tokio::test]
async fn test_local_only_excludes_http() {
    let tmp = TempDir::new().unwrap();
    let sink = Arc::new(RecordingEventSink::new());
    let caches = factory(
        &format!(
            r#"
[cache]
mode = ["dir", "http"]

[[cache.dir]]
path = "{}"

[[cache.http]]
url = "http://127.0.0.1:9"
"#,
            tmp.path().join("dir").display()
        ),
        &sink,
    );

    assert_eq!(caches.new_instance().unwrap().name(), "multi");
    let local = caches.local_only_instance().unwrap();
    assert_eq!(local.name(), "dir");
    let result = local.fetch(None, &key("03"), &tmp.path().join("out")).await;
    assert_eq!(result.kind(), CacheResultType::Miss);
}

#[tokio::test]
async fn test_blacklisted_wifi_skips_http_with_one_warning() {
    let tmp = TempDir::new().unwrap();
    let sink = Arc::new(RecordingEventSink::new());
    let config = ArtifactCacheConfig::from_toml_str(&format!(
        r#"
[cache]
mode = ["dir", "http"]

[[cache.dir]]
path = "{}"

[[cache.http]]
url = "http://cache-a:8080"
blacklisted_wifi_ssids = ["coffee-shop"]

[[cache.http]]
url = "http://cache-b:8080"
blacklisted_wifi_ssids = ["coffee-shop", "airport"]
"#,
        tmp.path().join("dir").display()
    ))
    .unwrap();
    let caches =
        ArtifactCaches::new(config, environment(&sink).with_wifi_ssid("coffee-shop")).unwrap();

    let cache = caches.new_instance().unwrap();
    assert_eq!(cache.name(), "dir");

    let warnings: Vec<String> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e.category {
            EventCategory::Warning { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(
        warnings,
        vec!["Remote cache is disabled because the WiFi (coffee-shop) is not usable.".to_string()]
    );
}

#[tokio::test]
async fn test_two_level_round_trip_through_factory() {
    let tmp = TempDir::new().unwrap();
    let sink = Arc::new(RecordingEventSink::new());
    let caches = factory(
        &format!(
            r#"
[cache]
mode = ["dir"]
two_level_enabled = true
two_level_min_size = "1KB"

[[cache.dir]]
path = "{}"
"#,
            tmp.path().join("dir").display()
        ),
        &sink,
    );
    let cache = caches.new_instance().unwrap();

    let payload = vec![42u8; 4096];
    let source = write(tmp.path(), "big", &payload);
    cache
        .store(&ArtifactInfo::for_key(key("04")), &ArtifactSource::copy_from(&source))
        .await
        .unwrap();

    let out = tmp.path().join("out");
    let result = cache.fetch(None, &key("04"), &out).await;
    assert_eq!(result.kind(), CacheResultType::Hit);
    assert_eq!(result.artifact_size(), Some(4096));
    assert!(result.two_level_content_key().is_some_and(|k| k.starts_with("cache/")));
    assert_eq!(std::fs::read(&out).unwrap(), payload);
}

#[tokio::test]
async fn test_close_closes_instances_and_announces_shutdown() {
    let tmp = TempDir::new().unwrap();
    let sink = Arc::new(RecordingEventSink::new());
    let caches = factory(&dir_only(tmp.path()), &sink);
    let cache = caches.new_instance().unwrap();
    caches.close().await;

    assert_eq!(caches.instance_count(), 0);
    assert!(matches!(
        sink.events().last().map(|e| &e.category),
        Some(EventCategory::Shutdown)
    ));

    let source = write(tmp.path(), "src", b"late");
    assert!(
        cache
            .store(&ArtifactInfo::for_key(key("05")), &ArtifactSource::copy_from(&source))
            .await
            .is_err()
    );
}

#[test]
fn test_invalid_config_fails_fast() {
    let mut config = ArtifactCacheConfig::default();
    config.cache.max_fetch_retries = 0;
    let sink = Arc::new(RecordingEventSink::new());
    assert!(ArtifactCaches::new(config, environment(&sink)).is_err());
}
