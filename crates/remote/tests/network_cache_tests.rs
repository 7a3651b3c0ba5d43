//! Network cache behaviour over the batch protocol and retrying transports

use artcache_core::{
    ArtifactCache, ArtifactCacheMode, ArtifactInfo, ArtifactSource, CacheResultType, RuleKey,
};
use artcache_remote::protocol::{BatchResponse, BatchResult};
use artcache_remote::test_utils::{FakeHttpService, InMemoryCacheServer};
use artcache_remote::{
    HttpMethod, NetworkCache, NetworkCacheOptions, RemoteError, RetryConfig, RetryingHttpService,
    SharedHttpService,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn key(hex: &str) -> RuleKey {
    RuleKey::from_hex(hex).unwrap()
}

fn thrift_options(limit: usize) -> NetworkCacheOptions {
    let mut options = NetworkCacheOptions::new("thrift_over_http", "cache.example.com");
    options.cache_mode = ArtifactCacheMode::ThriftOverHttp;
    options.batch_endpoint = Some("/hybrid_thrift".into());
    options.multi_fetch_limit = limit;
    options.multi_check = true;
    options
}

fn outputs(tmp: &TempDir, keys: &[RuleKey]) -> Vec<(RuleKey, PathBuf)> {
    keys.iter()
        .map(|k| (k.clone(), tmp.path().join(k.to_hex())))
        .collect()
}

#[tokio::test]
async fn test_batch_fetch_is_chunked_and_ordered() {
    let server = InMemoryCacheServer::new();
    server.insert(key("01"), b"one");
    server.insert(key("03"), b"three");
    let service = Arc::new(server.service());
    let shared: SharedHttpService = service.clone();
    let cache = NetworkCache::new(thrift_options(2), shared.clone(), shared).unwrap();

    let tmp = TempDir::new().unwrap();
    let requests = outputs(&tmp, &[key("01"), key("02"), key("03")]);
    let results = cache.fetch_many(Some("//app:bin"), &requests).await;

    let kinds: Vec<_> = results.iter().map(|r| r.kind()).collect();
    assert_eq!(
        kinds,
        vec![CacheResultType::Hit, CacheResultType::Miss, CacheResultType::Hit]
    );
    assert_eq!(std::fs::read(&requests[2].1).unwrap(), b"three");
    assert!(!requests[1].1.exists());

    let posts: Vec<_> = service
        .requests()
        .into_iter()
        .filter(|r| r.method == HttpMethod::Post)
        .map(|r| r.path)
        .collect();
    assert_eq!(posts, vec!["hybrid_thrift/fetch", "hybrid_thrift/fetch"]);
}

#[tokio::test]
async fn test_malformed_batch_response_errors_every_key() {
    let server = InMemoryCacheServer::new();
    server.insert(key("01"), b"one");
    server.break_batches();
    let shared: SharedHttpService = Arc::new(server.service());
    let cache = NetworkCache::new(thrift_options(10), shared.clone(), shared).unwrap();

    let tmp = TempDir::new().unwrap();
    let requests = outputs(&tmp, &[key("01"), key("02")]);
    let results = cache.fetch_many(None, &requests).await;

    assert!(results.iter().all(|r| r.kind() == CacheResultType::Error));
    assert!(
        results[0]
            .cache_error()
            .unwrap()
            .contains("Malformed batch fetch response")
    );
    assert!(requests.iter().all(|(_, out)| !out.exists()));
}

#[tokio::test]
async fn test_key_missing_from_batch_response_is_error() {
    let fake: SharedHttpService = Arc::new(FakeHttpService::new(|_| {
        let body = BatchResponse {
            results: vec![BatchResult::miss(RuleKey::from_hex("01").unwrap())],
        };
        Ok((200, serde_json::to_vec(&body).unwrap()))
    }));
    let cache = NetworkCache::new(thrift_options(10), fake.clone(), fake).unwrap();

    let tmp = TempDir::new().unwrap();
    let results = cache
        .fetch_many(None, &outputs(&tmp, &[key("01"), key("02")]))
        .await;
    assert_eq!(results[0].kind(), CacheResultType::Miss);
    assert_eq!(results[1].kind(), CacheResultType::Error);
}

#[tokio::test]
async fn test_batch_contains_and_delete() {
    let server = InMemoryCacheServer::new();
    server.insert(key("01"), b"one");
    server.insert(key("02"), b"two");
    let shared: SharedHttpService = Arc::new(server.service());
    let cache = NetworkCache::new(thrift_options(10), shared.clone(), shared).unwrap();

    let contains = cache.contains_many(&[key("01"), key("09")]).await;
    assert_eq!(contains[&key("01")].kind(), CacheResultType::Contains);
    assert_eq!(contains[&key("09")].kind(), CacheResultType::Miss);

    let deleted = cache.delete(&[key("02"), key("09")]).await.unwrap();
    assert_eq!(deleted.deleted, BTreeSet::from([key("02")]));
    assert_eq!(server.len(), 1);
}

#[tokio::test]
async fn test_store_retries_through_transport() {
    let server = InMemoryCacheServer::new();
    let failures = Arc::new(AtomicUsize::new(0));
    let flaky = {
        let server = server.clone();
        let failures = failures.clone();
        FakeHttpService::new(move |request| {
            if request.method == HttpMethod::Put && failures.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(RemoteError::connection_failed("http://cache", "reset by peer"));
            }
            Ok(server.handle(request))
        })
    };
    let flaky: SharedHttpService = Arc::new(flaky);
    let store_service: SharedHttpService = Arc::new(RetryingHttpService::new(
        flaky.clone(),
        RetryConfig::fixed(2, 1),
        "store",
    ));
    let cache = NetworkCache::new(
        NetworkCacheOptions::new("http", "cache"),
        flaky,
        store_service,
    )
    .unwrap();

    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("artifact");
    std::fs::write(&source, b"payload").unwrap();
    cache
        .store(
            &ArtifactInfo::for_key(key("ab")),
            &ArtifactSource::copy_from(&source),
        )
        .await
        .unwrap();

    assert_eq!(failures.load(Ordering::SeqCst), 2);
    assert_eq!(server.payload(&key("ab")).unwrap(), b"payload");
}

#[tokio::test]
async fn test_store_failure_is_reported() {
    let fake: SharedHttpService = Arc::new(FakeHttpService::new(|_| Ok((500, Vec::new()))));
    let cache =
        NetworkCache::new(NetworkCacheOptions::new("http", "cache"), fake.clone(), fake).unwrap();

    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("artifact");
    std::fs::write(&source, b"payload").unwrap();
    let err = cache
        .store(
            &ArtifactInfo::for_key(key("ab")),
            &ArtifactSource::copy_from(&source),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("HTTP 500"));
}

#[tokio::test]
async fn test_write_headers_only_on_writes() {
    let server = InMemoryCacheServer::new();
    let service = Arc::new(server.service());
    let shared: SharedHttpService = service.clone();
    let mut options = NetworkCacheOptions::new("http", "cache");
    options.read_headers.insert("X-Read".into(), "r".into());
    options.write_headers.insert("X-Write".into(), "w".into());
    let cache = NetworkCache::new(options, shared.clone(), shared).unwrap();

    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("artifact");
    std::fs::write(&source, b"payload").unwrap();
    cache
        .store(
            &ArtifactInfo::for_key(key("ab")),
            &ArtifactSource::copy_from(&source),
        )
        .await
        .unwrap();
    cache.fetch(None, &key("ab"), &tmp.path().join("out")).await;

    let requests = service.requests();
    let put = requests.iter().find(|r| r.method == HttpMethod::Put).unwrap();
    let get = requests.iter().find(|r| r.method == HttpMethod::Get).unwrap();
    assert_eq!(put.headers.get("X-Write").map(String::as_str), Some("w"));
    assert!(!put.headers.contains_key("X-Read"));
    assert_eq!(get.headers.get("X-Read").map(String::as_str), Some("r"));
    assert!(!get.headers.contains_key("X-Write"));
}
