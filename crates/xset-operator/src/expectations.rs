//! The cache-expectation gate
//!
//! Controllers read the cluster through an informer cache that lags their
//! own writes. After every create/update/delete the engine records a
//! write fingerprint here, keyed by the parent; the reconciler checks
//! [`CacheExpectations::satisfied`] before mutating anything and requeues
//! when the cache has not caught up yet. The gate never blocks: an
//! unsatisfied check simply short-circuits the reconcile.
//!
//! Fingerprints expire after a TTL so a lost watch event cannot wedge a
//! parent forever.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::{debug, warn};

use xset_api::{error, Result};

/// How long a recorded write is trusted before it is assumed lost
pub const EXPECTATION_TTL: Duration = Duration::from_secs(30);

/// The per-parent key under which expectations are recorded
pub fn object_key<K: kube::ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Requeue delay while expectations are unsatisfied
pub const EXPECTATION_REQUEUE: Duration = Duration::from_secs(30);

/// Read access to the informer-backed object cache
///
/// The gate only needs resource versions; `None` means the object is not
/// in the cache.
#[async_trait]
pub trait CacheReader: Send + Sync {
    /// Look up the cached resource version of an object
    async fn resource_version(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ExpectedWrite {
    Creation,
    Update { resource_version: String },
    Deletion,
}

#[derive(Clone, Debug)]
struct PendingWrite {
    gvk: GroupVersionKind,
    namespace: String,
    name: String,
    write: ExpectedWrite,
    recorded_at: Instant,
}

impl PendingWrite {
    async fn is_satisfied(&self, reader: &dyn CacheReader) -> Result<bool> {
        let observed = reader
            .resource_version(&self.gvk, &self.namespace, &self.name)
            .await?;
        Ok(match &self.write {
            ExpectedWrite::Creation => observed.is_some(),
            ExpectedWrite::Deletion => observed.is_none(),
            ExpectedWrite::Update { resource_version } => observed
                .as_deref()
                .is_some_and(|seen| rv_at_least(seen, resource_version)),
        })
    }
}

/// `true` when the observed resource version is at least the expected one
///
/// Resource versions are opaque strings, but in practice they are etcd
/// revisions; compare numerically when both sides parse and fall back to
/// equality otherwise.
fn rv_at_least(observed: &str, expected: &str) -> bool {
    match (observed.parse::<u64>(), expected.parse::<u64>()) {
        (Ok(seen), Ok(want)) => seen >= want,
        _ => observed == expected,
    }
}

/// Per-parent table of pending write fingerprints
#[derive(Default)]
pub struct CacheExpectations {
    pending: DashMap<String, Vec<PendingWrite>>,
}

impl CacheExpectations {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the parent expects to observe a created object
    pub fn expect_creation(
        &self,
        parent_key: &str,
        gvk: GroupVersionKind,
        namespace: &str,
        name: &str,
    ) {
        self.record(parent_key, gvk, namespace, name, ExpectedWrite::Creation);
    }

    /// Record that the parent expects to observe an updated object
    ///
    /// `resource_version` is the version returned by the write.
    pub fn expect_update(
        &self,
        parent_key: &str,
        gvk: GroupVersionKind,
        namespace: &str,
        name: &str,
        resource_version: &str,
    ) {
        self.record(
            parent_key,
            gvk,
            namespace,
            name,
            ExpectedWrite::Update {
                resource_version: resource_version.to_string(),
            },
        );
    }

    /// Record that the parent expects to observe a deleted object
    pub fn expect_deletion(
        &self,
        parent_key: &str,
        gvk: GroupVersionKind,
        namespace: &str,
        name: &str,
    ) {
        self.record(parent_key, gvk, namespace, name, ExpectedWrite::Deletion);
    }

    /// Drop every expectation for a parent (used when the parent is gone)
    pub fn delete_expectations(&self, parent_key: &str) {
        self.pending.remove(parent_key);
    }

    /// Check whether the cache reflects every recorded write for a parent
    ///
    /// Satisfied fingerprints are dropped as they are observed; expired
    /// ones are dropped with a warning. Returns `true` once nothing
    /// pending remains.
    pub async fn satisfied(&self, parent_key: &str, reader: &dyn CacheReader) -> Result<bool> {
        let Some((_, writes)) = self.pending.remove(parent_key) else {
            return Ok(true);
        };

        let mut remaining = Vec::new();
        for write in writes {
            if write.recorded_at.elapsed() >= EXPECTATION_TTL {
                warn!(
                    parent = parent_key,
                    kind = %write.gvk.kind,
                    name = %write.name,
                    "expectation expired before the cache caught up"
                );
                continue;
            }
            if !write.is_satisfied(reader).await? {
                remaining.push(write);
            }
        }

        if remaining.is_empty() {
            return Ok(true);
        }
        debug!(
            parent = parent_key,
            pending = remaining.len(),
            "cache has not caught up with prior writes"
        );
        self.pending.insert(parent_key.to_string(), remaining);
        Ok(false)
    }

    fn record(
        &self,
        parent_key: &str,
        gvk: GroupVersionKind,
        namespace: &str,
        name: &str,
        write: ExpectedWrite,
    ) {
        self.pending
            .entry(parent_key.to_string())
            .or_default()
            .push(PendingWrite {
                gvk,
                namespace: namespace.to_string(),
                name: name.to_string(),
                write,
                recorded_at: Instant::now(),
            });
    }
}

/// Production [`CacheReader`] over the Kubernetes API
///
/// Reads go through the same client the controller watches with, so a
/// deployment backed by a caching client observes informer state. The
/// reads are resource-version-only and cheap either way.
pub struct KubeCacheReader {
    client: Client,
}

impl KubeCacheReader {
    /// Create a reader over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CacheReader for KubeCacheReader {
    async fn resource_version(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>> {
        let resource = api_resource(gvk);
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource);
        match api.get_metadata(name).await {
            Ok(meta) => Ok(meta.metadata.resource_version),
            Err(err) if error::is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn api_resource(gvk: &GroupVersionKind) -> ApiResource {
    let api_version = if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    };
    ApiResource {
        group: gvk.group.clone(),
        version: gvk.version.clone(),
        kind: gvk.kind.clone(),
        api_version,
        plural: pluralize(&gvk.kind),
    }
}

/// Simple pluralization for Kubernetes resource kinds
fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{lower}es")
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{lower}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory cache: (kind, namespace, name) -> resource version
    #[derive(Default)]
    struct FakeCache {
        objects: Mutex<HashMap<(String, String, String), String>>,
    }

    impl FakeCache {
        fn put(&self, kind: &str, namespace: &str, name: &str, rv: &str) {
            self.objects.lock().unwrap().insert(
                (kind.to_string(), namespace.to_string(), name.to_string()),
                rv.to_string(),
            );
        }

        fn delete(&self, kind: &str, namespace: &str, name: &str) {
            self.objects.lock().unwrap().remove(&(
                kind.to_string(),
                namespace.to_string(),
                name.to_string(),
            ));
        }
    }

    #[async_trait]
    impl CacheReader for FakeCache {
        async fn resource_version(
            &self,
            gvk: &GroupVersionKind,
            namespace: &str,
            name: &str,
        ) -> Result<Option<String>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .get(&(gvk.kind.clone(), namespace.to_string(), name.to_string()))
                .cloned())
        }
    }

    fn rc_gvk() -> GroupVersionKind {
        GroupVersionKind::gvk("demo.xset.dev", "v1alpha1", "ResourceContext")
    }

    #[tokio::test]
    async fn test_no_expectations_is_satisfied() {
        let gate = CacheExpectations::new();
        let cache = FakeCache::default();
        assert!(gate.satisfied("default/foo", &cache).await.unwrap());
    }

    #[tokio::test]
    async fn test_creation_satisfied_once_object_appears() {
        let gate = CacheExpectations::new();
        let cache = FakeCache::default();
        gate.expect_creation("default/foo", rc_gvk(), "default", "foo");

        assert!(!gate.satisfied("default/foo", &cache).await.unwrap());

        cache.put("ResourceContext", "default", "foo", "1");
        assert!(gate.satisfied("default/foo", &cache).await.unwrap());
        // observed fingerprints are dropped, not re-checked
        cache.delete("ResourceContext", "default", "foo");
        assert!(gate.satisfied("default/foo", &cache).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_requires_at_least_written_version() {
        let gate = CacheExpectations::new();
        let cache = FakeCache::default();
        cache.put("ResourceContext", "default", "foo", "41");
        gate.expect_update("default/foo", rc_gvk(), "default", "foo", "42");

        assert!(!gate.satisfied("default/foo", &cache).await.unwrap());

        cache.put("ResourceContext", "default", "foo", "43");
        assert!(gate.satisfied("default/foo", &cache).await.unwrap());
    }

    #[tokio::test]
    async fn test_deletion_satisfied_once_object_vanishes() {
        let gate = CacheExpectations::new();
        let cache = FakeCache::default();
        cache.put("ResourceContext", "default", "foo", "7");
        gate.expect_deletion("default/foo", rc_gvk(), "default", "foo");

        assert!(!gate.satisfied("default/foo", &cache).await.unwrap());

        cache.delete("ResourceContext", "default", "foo");
        assert!(gate.satisfied("default/foo", &cache).await.unwrap());
    }

    #[tokio::test]
    async fn test_parents_are_isolated() {
        let gate = CacheExpectations::new();
        let cache = FakeCache::default();
        gate.expect_creation("default/foo", rc_gvk(), "default", "foo");

        assert!(gate.satisfied("default/bar", &cache).await.unwrap());
        assert!(!gate.satisfied("default/foo", &cache).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_expectations_clears_parent() {
        let gate = CacheExpectations::new();
        let cache = FakeCache::default();
        gate.expect_creation("default/foo", rc_gvk(), "default", "foo");
        gate.delete_expectations("default/foo");

        assert!(gate.satisfied("default/foo", &cache).await.unwrap());
    }

    #[test]
    fn test_rv_comparison_is_numeric_with_opaque_fallback() {
        assert!(rv_at_least("43", "42"));
        assert!(rv_at_least("42", "42"));
        assert!(!rv_at_least("41", "42"));
        assert!(rv_at_least("abc", "abc"));
        assert!(!rv_at_least("abc", "def"));
    }

    #[test]
    fn test_pluralize_covers_common_kinds() {
        assert_eq!(pluralize("ResourceContext"), "resourcecontexts");
        assert_eq!(pluralize("GameServerSet"), "gameserversets");
        assert_eq!(pluralize("NetworkPolicy"), "networkpolicies");
        assert_eq!(pluralize("Ingress"), "ingresses");
    }
}
