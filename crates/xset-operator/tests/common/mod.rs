//! Shared fixtures: a toy set controller ("GameServerSet" managing
//! "GameServer" targets) plus in-memory collaborators, so engine flows can
//! be exercised end-to-end without a cluster.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use kube::api::GroupVersionKind;
use kube::runtime::events::EventType;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use xset_api::adapter::{ResourceContextAdapter, XSetController};
use xset_api::context::ResourceContextSpec;
use xset_api::events::EventPublisher;
use xset_api::types::{ByLabel, ByPartition, RollingUpdate, UpdateStrategy, XSetSpec, XSetStatus};
use xset_api::Result;

use xset_operator::expectations::CacheReader;
use xset_operator::reconciler::XSetClient;
use xset_operator::resource_context::ResourceContextClient;
use xset_operator::revision::{ConstructedRevisions, RevisionManager};
use xset_operator::sync::{SyncContext, SyncControl, SyncStepResult};
use xset_operator::targets::TargetControl;

// ============================================================================
// Toy custom resources
// ============================================================================

/// The parent resource the toy controller manages
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "demo.xset.dev",
    version = "v1alpha1",
    kind = "GameServerSet",
    namespaced,
    status = "GameServerSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    pub replicas: Option<i32>,
    pub pool: Option<String>,
    pub partition: Option<i32>,
    #[serde(default)]
    pub by_label: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct GameServerSetStatus {
    #[serde(flatten)]
    pub set: XSetStatus,
}

/// The child resource
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "demo.xset.dev",
    version = "v1alpha1",
    kind = "GameServer",
    namespaced
)]
pub struct GameServerSpec {}

/// The ID-table sidecar
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "demo.xset.dev",
    version = "v1alpha1",
    kind = "GameResourceContext",
    namespaced
)]
pub struct GameResourceContextSpec {
    #[serde(flatten)]
    pub table: ResourceContextSpec,
}

// ============================================================================
// Adapters
// ============================================================================

pub struct GameSetController;

impl XSetController for GameSetController {
    type XSet = GameServerSet;
    type Target = GameServer;

    fn controller_name(&self) -> &str {
        "game-server-set"
    }

    fn finalizer_name(&self) -> &str {
        "demo.xset.dev/game-server-set"
    }

    fn spec(&self, xset: &GameServerSet) -> XSetSpec {
        let rolling_update = if xset.spec.by_label {
            Some(RollingUpdate {
                by_label: Some(ByLabel {}),
                by_partition: None,
            })
        } else {
            xset.spec.partition.map(|partition| RollingUpdate {
                by_partition: Some(ByPartition {
                    partition: Some(partition),
                }),
                by_label: None,
            })
        };
        XSetSpec {
            replicas: xset.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    xset.name_any(),
                )])),
                match_expressions: None,
            },
            scale_strategy: xset_api::types::ScaleStrategy {
                context: xset.spec.pool.clone(),
            },
            update_strategy: UpdateStrategy { rolling_update },
        }
    }

    fn status(&self, xset: &GameServerSet) -> XSetStatus {
        xset.status.clone().unwrap_or_default().set
    }

    fn set_status(&self, xset: &mut GameServerSet, status: XSetStatus) {
        xset.status = Some(GameServerSetStatus { set: status });
    }
}

pub struct GameContextAdapter;

impl ResourceContextAdapter for GameContextAdapter {
    type ResourceContext = GameResourceContext;

    fn new_resource_context(&self) -> GameResourceContext {
        GameResourceContext::new("", GameResourceContextSpec::default())
    }

    fn spec(&self, obj: &GameResourceContext) -> ResourceContextSpec {
        obj.spec.table.clone()
    }

    fn set_spec(&self, obj: &mut GameResourceContext, spec: ResourceContextSpec) {
        obj.spec.table = spec;
    }
}

// ============================================================================
// Object fixtures
// ============================================================================

pub fn game_set(name: &str, replicas: i32) -> GameServerSet {
    let mut set = GameServerSet::new(
        name,
        GameServerSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        },
    );
    set.metadata.namespace = Some("default".to_string());
    set.metadata.uid = Some(format!("uid-{name}"));
    set
}

pub fn pooled_game_set(name: &str, replicas: i32, pool: &str) -> GameServerSet {
    let mut set = game_set(name, replicas);
    set.spec.pool = Some(pool.to_string());
    set
}

pub fn deleting_game_set(name: &str, replicas: i32) -> GameServerSet {
    let mut set = game_set(name, replicas);
    set.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    set.metadata.finalizers = Some(vec!["demo.xset.dev/game-server-set".to_string()]);
    set
}

pub fn game_server(name: &str, instance_id: i32) -> GameServer {
    let mut server = GameServer::new(name, GameServerSpec {});
    server.metadata.namespace = Some("default".to_string());
    server.metadata.labels = Some(BTreeMap::from([
        ("xset.dev/instance-id".to_string(), instance_id.to_string()),
        ("xset.dev/control".to_string(), "true".to_string()),
    ]));
    server
}

pub fn revision(name: &str) -> ControllerRevision {
    ControllerRevision {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        data: None,
        revision: 1,
    }
}

// ============================================================================
// In-memory stores
// ============================================================================

fn bump_rv(meta: &mut ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

fn store_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Shared in-memory GameServerSet store
#[derive(Clone, Default)]
pub struct XSetStore(pub Arc<Mutex<HashMap<String, GameServerSet>>>);

impl XSetStore {
    pub fn insert(&self, set: GameServerSet) {
        let key = store_key(&set.namespace().unwrap_or_default(), &set.name_any());
        self.0.lock().unwrap().insert(key, set);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<GameServerSet> {
        self.0.lock().unwrap().get(&store_key(namespace, name)).cloned()
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.0.lock().unwrap().remove(&store_key(namespace, name));
    }
}

/// Shared in-memory GameResourceContext store
#[derive(Clone, Default)]
pub struct ContextStore(pub Arc<Mutex<HashMap<String, GameResourceContext>>>);

impl ContextStore {
    pub fn get(&self, namespace: &str, name: &str) -> Option<GameResourceContext> {
        self.0.lock().unwrap().get(&store_key(namespace, name)).cloned()
    }

    pub fn contexts_of(&self, namespace: &str, name: &str) -> Vec<xset_api::ContextDetail> {
        self.get(namespace, name)
            .map(|obj| obj.spec.table.contexts)
            .unwrap_or_default()
    }
}

// ============================================================================
// Fake collaborators
// ============================================================================

/// Parent client over [`XSetStore`], counting mutations
pub struct FakeXSetClient {
    pub store: XSetStore,
    pub status_updates: AtomicUsize,
    pub finalizer_adds: AtomicUsize,
    pub finalizer_removes: AtomicUsize,
}

impl FakeXSetClient {
    pub fn new(store: XSetStore) -> Self {
        Self {
            store,
            status_updates: AtomicUsize::new(0),
            finalizer_adds: AtomicUsize::new(0),
            finalizer_removes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl XSetClient<GameSetController> for FakeXSetClient {
    async fn get_xset(&self, namespace: &str, name: &str) -> Result<Option<GameServerSet>> {
        Ok(self.store.get(namespace, name))
    }

    async fn update_status(&self, xset: &GameServerSet) -> Result<GameServerSet> {
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.store.0.lock().unwrap();
        let key = store_key(&xset.namespace().unwrap_or_default(), &xset.name_any());
        let stored = guard.entry(key).or_insert_with(|| xset.clone());
        stored.status = xset.status.clone();
        bump_rv(&mut stored.metadata);
        Ok(stored.clone())
    }

    async fn add_finalizer(&self, xset: &GameServerSet, finalizer: &str) -> Result<()> {
        let mut guard = self.store.0.lock().unwrap();
        let key = store_key(&xset.namespace().unwrap_or_default(), &xset.name_any());
        if let Some(stored) = guard.get_mut(&key) {
            let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
                bump_rv(&mut stored.metadata);
                self.finalizer_adds.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn remove_finalizer(&self, xset: &GameServerSet, finalizer: &str) -> Result<()> {
        let mut guard = self.store.0.lock().unwrap();
        let key = store_key(&xset.namespace().unwrap_or_default(), &xset.name_any());
        if let Some(stored) = guard.get_mut(&key) {
            if let Some(finalizers) = &mut stored.metadata.finalizers {
                let before = finalizers.len();
                finalizers.retain(|f| f != finalizer);
                if finalizers.len() != before {
                    bump_rv(&mut stored.metadata);
                    self.finalizer_removes.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }
}

/// Sidecar client over [`ContextStore`]
pub struct InMemoryContextClient {
    pub store: ContextStore,
}

impl InMemoryContextClient {
    pub fn new(store: ContextStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ResourceContextClient<GameResourceContext> for InMemoryContextClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<GameResourceContext>> {
        Ok(self.store.get(namespace, name))
    }

    async fn create(&self, obj: &GameResourceContext) -> Result<GameResourceContext> {
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some("1".to_string());
        let key = store_key(&obj.namespace().unwrap_or_default(), &obj.name_any());
        self.store.0.lock().unwrap().insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &GameResourceContext) -> Result<GameResourceContext> {
        let mut stored = obj.clone();
        bump_rv(&mut stored.metadata);
        let key = store_key(&obj.namespace().unwrap_or_default(), &obj.name_any());
        self.store.0.lock().unwrap().insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, obj: &GameResourceContext) -> Result<()> {
        let key = store_key(&obj.namespace().unwrap_or_default(), &obj.name_any());
        self.store.0.lock().unwrap().remove(&key);
        Ok(())
    }
}

/// Cache reader answering from the in-memory stores (cache never lags)
pub struct MirrorCacheReader {
    pub xsets: XSetStore,
    pub contexts: ContextStore,
}

#[async_trait]
impl CacheReader for MirrorCacheReader {
    async fn resource_version(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>> {
        Ok(match gvk.kind.as_str() {
            "GameServerSet" => self
                .xsets
                .get(namespace, name)
                .and_then(|obj| obj.resource_version()),
            "GameResourceContext" => self
                .contexts
                .get(namespace, name)
                .and_then(|obj| obj.resource_version()),
            _ => None,
        })
    }
}

/// Cache reader that never observes anything (cache always lags)
pub struct EmptyCacheReader;

#[async_trait]
impl CacheReader for EmptyCacheReader {
    async fn resource_version(
        &self,
        _gvk: &GroupVersionKind,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Target client over a shared target list
pub struct FakeTargetControl {
    pub targets: Arc<Mutex<Vec<GameServer>>>,
}

impl FakeTargetControl {
    pub fn new(targets: Arc<Mutex<Vec<GameServer>>>) -> Self {
        Self { targets }
    }
}

#[async_trait]
impl TargetControl<GameSetController> for FakeTargetControl {
    async fn filtered_targets(
        &self,
        _selector: &LabelSelector,
        _owner: &GameServerSet,
    ) -> Result<Vec<GameServer>> {
        Ok(self.targets.lock().unwrap().clone())
    }

    async fn update_target(&self, target: &GameServer) -> Result<GameServer> {
        let mut guard = self.targets.lock().unwrap();
        if let Some(stored) = guard.iter_mut().find(|t| t.name_any() == target.name_any()) {
            *stored = target.clone();
        }
        Ok(target.clone())
    }

    async fn delete_target(&self, target: &GameServer) -> Result<()> {
        self.targets
            .lock()
            .unwrap()
            .retain(|t| t.name_any() != target.name_any());
        Ok(())
    }
}

/// Revision manager returning a fixed pair
pub struct StubRevisionManager;

#[async_trait]
impl RevisionManager<GameSetController> for StubRevisionManager {
    async fn construct_revisions(&self, _xset: &GameServerSet) -> Result<ConstructedRevisions> {
        Ok(ConstructedRevisions {
            current: revision("rev-current"),
            updated: revision("rev-updated"),
            revisions: vec![revision("rev-current"), revision("rev-updated")],
            collision_count: 0,
        })
    }
}

/// Sync control recording call order and returning configured requeues
pub struct StubSyncControl {
    pub calls: Arc<Mutex<Vec<&'static str>>>,
    pub synced_early: bool,
    pub scale_requeue: Option<Duration>,
    pub update_requeue: Option<Duration>,
    pub batch_deleted: Arc<Mutex<Vec<String>>>,
}

impl StubSyncControl {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            synced_early: false,
            scale_requeue: None,
            update_requeue: None,
            batch_deleted: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl SyncControl<GameSetController> for StubSyncControl {
    async fn sync_targets(
        &self,
        _xset: &GameServerSet,
        _sync_ctx: &mut SyncContext,
    ) -> Result<bool> {
        self.record("sync_targets");
        Ok(self.synced_early)
    }

    async fn replace(&self, _xset: &GameServerSet, _sync_ctx: &mut SyncContext) -> Result<()> {
        self.record("replace");
        Ok(())
    }

    async fn scale(&self, _xset: &GameServerSet, _sync_ctx: &mut SyncContext) -> SyncStepResult {
        self.record("scale");
        Ok((true, self.scale_requeue))
    }

    async fn update(&self, _xset: &GameServerSet, _sync_ctx: &mut SyncContext) -> SyncStepResult {
        self.record("update");
        Ok((true, self.update_requeue))
    }

    async fn apply_template_patcher(
        &self,
        _xset: &GameServerSet,
        _sync_ctx: &mut SyncContext,
    ) -> Result<()> {
        self.record("apply_template_patcher");
        Ok(())
    }

    async fn calculate_status(&self, _xset: &GameServerSet, sync_ctx: &SyncContext) -> XSetStatus {
        sync_ctx.new_status.clone()
    }

    async fn batch_delete_targets_by_label(&self, targets: &[GameServer]) -> Result<()> {
        let mut deleted = self.batch_deleted.lock().unwrap();
        for target in targets {
            deleted.push(target.name_any());
        }
        Ok(())
    }
}

/// Event sink capturing published events
#[derive(Default)]
pub struct RecordingEventPublisher {
    pub events: Mutex<Vec<(String, String, Option<String>)>>,
}

impl RecordingEventPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        let type_label = match type_ {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        };
        self.events
            .lock()
            .unwrap()
            .push((type_label.to_string(), reason.to_string(), note));
    }
}
