//! Property tests for the directory cache.
//!
//! A reader racing a writer on the same key must see either a miss or one
//! complete payload, never a torn file.

use artcache_core::{
    ArtifactCache, ArtifactInfo, ArtifactSource, CacheReadMode, CacheResultType,
    DirArtifactCache, RuleKey,
};
use proptest::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

fn payloads_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..8192), 1..5)
}

fn race(payloads: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let tmp = TempDir::new().unwrap();
        let cache = Arc::new(
            DirArtifactCache::new("dir", tmp.path().join("cache"), CacheReadMode::ReadWrite, None, 4)
                .unwrap(),
        );
        let key = RuleKey::from_hex("a1b2c3d4").unwrap();

        let mut stores = Vec::new();
        for (i, payload) in payloads.iter().enumerate() {
            let src = tmp.path().join(format!("src-{i}"));
            std::fs::write(&src, payload).unwrap();
            let cache = cache.clone();
            let key = key.clone();
            stores.push(tokio::spawn(async move {
                cache
                    .store(&ArtifactInfo::for_key(key), &ArtifactSource::move_from(src))
                    .await
            }));
        }

        let mut fetches = Vec::new();
        for i in 0..16 {
            let out = tmp.path().join(format!("out-{i}"));
            let cache = cache.clone();
            let key = key.clone();
            fetches.push(tokio::spawn(async move {
                let result = cache.fetch(None, &key, &out).await;
                match result.kind() {
                    CacheResultType::Hit => Some(std::fs::read(&out).unwrap()),
                    CacheResultType::Miss => None,
                    other => panic!("unexpected fetch result {other}"),
                }
            }));
        }

        for store in stores {
            store.await.unwrap().unwrap();
        }
        let mut seen = Vec::new();
        for fetch in fetches {
            if let Some(bytes) = fetch.await.unwrap() {
                seen.push(bytes);
            }
        }
        cache.close().await.unwrap();
        seen
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Every hit observed during concurrent stores is a complete payload
    #[test]
    fn prop_concurrent_fetch_sees_whole_payloads(payloads in payloads_strategy()) {
        for bytes in race(&payloads) {
            prop_assert!(payloads.contains(&bytes), "torn read of {} bytes", bytes.len());
        }
    }
}
