//! Stable instance-ID allocation and birth-revision decision
//!
//! Every target managed by an XSet carries a stable integer instance ID,
//! allocated here and persisted in the ResourceContext sidecar. IDs are
//! handed out deterministically (smallest free non-negative integers),
//! survive scale/replace/upgrade events, and may be drawn from a pool
//! shared across several parents.
//!
//! The allocator also stamps each newly allocated ID with the revision its
//! target will be born at, according to the declared rollout strategy, and
//! re-decides that revision after a failed create so a rollout can skip
//! past a revision an admission policy rejects.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::core::NamespaceResourceScope;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use xset_api::adapter::{ResourceContextAdapter, XSetController};
use xset_api::context::{
    default_context_keys, ContextDetail, ContextKey, ContextKeys, ResourceContextSpec,
};
use xset_api::events::{actions, reasons, EventPublisher};
use xset_api::labels::LabelAnnotationManager;
use xset_api::types::XSetSpec;
use xset_api::{error, Error, Result};

use crate::expectations::{object_key, CacheExpectations};
use crate::targets;

/// Client seam for the ResourceContext sidecar object
#[async_trait]
pub trait ResourceContextClient<R>: Send + Sync {
    /// Get a sidecar by namespace/name; `None` on 404
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<R>>;
    /// Create a sidecar
    async fn create(&self, obj: &R) -> Result<R>;
    /// Replace a sidecar (optimistic, via its resourceVersion)
    async fn update(&self, obj: &R) -> Result<R>;
    /// Delete a sidecar
    async fn delete(&self, obj: &R) -> Result<()>;
}

/// Production [`ResourceContextClient`] over a typed `Api`
pub struct KubeResourceContextClient<R> {
    client: Client,
    _resource: PhantomData<R>,
}

impl<R> KubeResourceContextClient<R> {
    /// Create a sidecar client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _resource: PhantomData,
        }
    }
}

#[async_trait]
impl<R> ResourceContextClient<R> for KubeResourceContextClient<R>
where
    R: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<R>> {
        let api: Api<R> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if error::is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn create(&self, obj: &R) -> Result<R> {
        let api: Api<R> = Api::namespaced(
            self.client.clone(),
            &obj.namespace().unwrap_or_default(),
        );
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &R) -> Result<R> {
        let api: Api<R> = Api::namespaced(
            self.client.clone(),
            &obj.namespace().unwrap_or_default(),
        );
        Ok(api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn delete(&self, obj: &R) -> Result<()> {
        let api: Api<R> = Api::namespaced(
            self.client.clone(),
            &obj.namespace().unwrap_or_default(),
        );
        match api.delete(&obj.name_any(), &Default::default()).await {
            Ok(_) => Ok(()),
            Err(err) if error::is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// A creation error only an updated revision can get past
///
/// Recoverable errors (conflict, throttling, timeouts) are healed by
/// retrying the create; 403 Forbidden and 422 Invalid mean the revision
/// itself is rejected.
pub fn is_unrecoverable_create_error(err: Option<&Error>) -> bool {
    matches!(
        err,
        Some(Error::Kube {
            source: kube::Error::Api(ae)
        }) if ae.code == 403 || ae.code == 422
    )
}

/// The instance-ID allocator for one concrete controller
pub struct ResourceContextControl<C: XSetController, RA: ResourceContextAdapter> {
    controller: Arc<C>,
    adapter: Arc<RA>,
    client: Arc<dyn ResourceContextClient<RA::ResourceContext>>,
    events: Arc<dyn EventPublisher>,
    expectations: Arc<CacheExpectations>,
    labels: Arc<dyn LabelAnnotationManager>,
    keys: ContextKeys,
}

impl<C: XSetController, RA: ResourceContextAdapter> ResourceContextControl<C, RA> {
    /// Create the allocator, resolving the context-key table
    pub fn new(
        controller: Arc<C>,
        adapter: Arc<RA>,
        client: Arc<dyn ResourceContextClient<RA::ResourceContext>>,
        events: Arc<dyn EventPublisher>,
        expectations: Arc<CacheExpectations>,
    ) -> Self {
        let keys = adapter.context_keys().unwrap_or_else(default_context_keys);
        let labels = controller.label_manager();
        Self {
            controller,
            adapter,
            client,
            events,
            expectations,
            labels,
            keys,
        }
    }

    /// Read a bag value through the key table
    pub fn get<'a>(&self, detail: &'a ContextDetail, key: ContextKey) -> Option<&'a str> {
        detail.get(resolve(&self.keys, key))
    }

    /// Check a bag entry through the key table
    pub fn contains(&self, detail: &ContextDetail, key: ContextKey, value: &str) -> bool {
        detail.contains(resolve(&self.keys, key), value)
    }

    /// Write a bag value through the key table
    pub fn put(&self, detail: &mut ContextDetail, key: ContextKey, value: impl Into<String>) {
        detail.put(resolve(&self.keys, key), value);
    }

    /// Drop a bag entry through the key table
    pub fn remove(&self, detail: &mut ContextDetail, key: ContextKey) {
        detail.remove(resolve(&self.keys, key));
    }

    /// Name of the sidecar object for a parent: the shared pool when pool
    /// mode is enabled, the parent's own name otherwise
    pub fn context_name(&self, xset: &C::XSet) -> String {
        let spec = self.controller.spec(xset);
        match spec.pool_name() {
            Some(pool) => pool.to_string(),
            None => xset.name_any(),
        }
    }

    /// Ensure the parent owns enough IDs to cover the desired replicas
    ///
    /// Adopts IDs observed on live targets but missing from the table,
    /// allocates the smallest free IDs for the remainder, stamps birth
    /// revisions, and persists the result. Returns the parent's owned IDs.
    pub async fn allocate_id(
        &self,
        xset: &C::XSet,
        current_revision: &str,
        updated_revision: &str,
        replicas: i32,
        targets: &[C::Target],
    ) -> Result<BTreeMap<i32, ContextDetail>> {
        let namespace = xset.namespace().unwrap_or_default();
        let owner = xset.name_any();
        let context_name = self.context_name(xset);

        let target_context = self.client.get(&namespace, &context_name).await?;

        let spec = self.controller.spec(xset);
        let pool_enabled = spec.pool_name().is_some();
        let owner_key = resolve(&self.keys, ContextKey::Owner);

        let mut owned_ids: BTreeMap<i32, ContextDetail> = BTreeMap::new();
        let mut existing_ids: BTreeMap<i32, ContextDetail> = BTreeMap::new();
        if let Some(obj) = &target_context {
            for detail in self.adapter.spec(obj).contexts {
                if detail.contains(owner_key, &owner) {
                    owned_ids.insert(detail.id, detail.clone());
                    existing_ids.insert(detail.id, detail);
                } else if pool_enabled {
                    // foreign owners block IDs only when the pool is shared
                    existing_ids.insert(detail.id, detail);
                }
            }
        }

        let unrecorded_ids = self.unrecorded_target_ids(&existing_ids, targets, current_revision);

        // the parent already owns enough and nothing is unaccounted for
        if owned_ids.len() >= replicas.max(0) as usize && unrecorded_ids.is_empty() {
            return Ok(owned_ids);
        }

        let owned_ids = fulfill_owned_ids(
            &self.keys,
            owned_ids,
            &existing_ids,
            unrecorded_ids,
            replicas,
            &owner,
            &spec,
            current_revision,
            updated_revision,
        );

        match target_context {
            None => {
                self.create_target_context(xset, &context_name, &owned_ids)
                    .await?
            }
            Some(mut live) => {
                self.update_target_context(xset, &owned_ids, &mut live)
                    .await?
            }
        }
        Ok(owned_ids)
    }

    /// Prune owned IDs that exceed the larger of replicas and live targets
    ///
    /// Only IDs with no live target are candidates. Emits a Warning event
    /// naming the pruned entries.
    pub async fn clean_unused_ids(&self, xset: &C::XSet, targets: &[C::Target]) -> Result<()> {
        let namespace = xset.namespace().unwrap_or_default();
        let context_name = self.context_name(xset);
        let Some(mut live) = self.client.get(&namespace, &context_name).await? else {
            return Ok(());
        };

        let spec = self.controller.spec(xset);
        let owner = xset.name_any();
        let owner_key = resolve(&self.keys, ContextKey::Owner);

        let mut owned_ids: BTreeMap<i32, ContextDetail> = BTreeMap::new();
        for detail in self.adapter.spec(&live).contexts {
            if detail.contains(owner_key, &owner) {
                owned_ids.insert(detail.id, detail);
            }
        }

        let keep = spec.replicas().max(targets.len() as i32);
        let need_clean = owned_ids.len() as i64 - i64::from(keep);
        if need_clean <= 0 {
            return Ok(());
        }

        let mut current_ids: BTreeSet<i32> = BTreeSet::new();
        for target in targets {
            if let Ok(id) = targets::instance_id(self.labels.as_ref(), target) {
                current_ids.insert(id);
            }
        }

        let removable: Vec<i32> = owned_ids
            .keys()
            .filter(|id| !current_ids.contains(id))
            .copied()
            .collect();
        if removable.is_empty() {
            return Ok(());
        }

        // capture details before removal so the event names real entries
        let mut deleted: BTreeMap<i32, ContextDetail> = BTreeMap::new();
        for id in removable.into_iter().take(need_clean as usize) {
            if let Some(detail) = owned_ids.remove(&id) {
                deleted.insert(id, detail);
            }
        }

        let pruned: Vec<String> = deleted.keys().map(ToString::to_string).collect();
        self.events
            .publish(
                &xset.object_ref(&()),
                EventType::Warning,
                reasons::RESOURCE_CONTEXT_CLEAN,
                actions::ALLOCATE,
                Some(format!(
                    "cleaned {} unused IDs [{}] from ResourceContext {}/{}",
                    deleted.len(),
                    pruned.join(","),
                    namespace,
                    context_name
                )),
            )
            .await;

        self.update_target_context(xset, &owned_ids, &mut live).await
    }

    /// Unconditional write-through of the owned ID set
    ///
    /// Teardown passes an empty map to release the parent's share of the
    /// pool. Recreates the sidecar when it is missing but IDs remain.
    pub async fn update_to_target_context(
        &self,
        xset: &C::XSet,
        owned_ids: &BTreeMap<i32, ContextDetail>,
    ) -> Result<()> {
        let namespace = xset.namespace().unwrap_or_default();
        let context_name = self.context_name(xset);
        match self.client.get(&namespace, &context_name).await? {
            Some(mut live) => self.update_target_context(xset, owned_ids, &mut live).await,
            None if owned_ids.is_empty() => Ok(()),
            None => self.create_target_context(xset, &context_name, owned_ids).await,
        }
    }

    /// Hand out up to `diff` owned details whose ID is not in use
    ///
    /// Iteration is ascending by ID and stable.
    pub fn extract_available_contexts<'a>(
        &self,
        diff: i32,
        owned_ids: &'a BTreeMap<i32, ContextDetail>,
        in_use: &BTreeSet<i32>,
    ) -> Vec<&'a ContextDetail> {
        let mut available = Vec::new();
        if diff <= 0 {
            return available;
        }
        for (id, detail) in owned_ids {
            if in_use.contains(id) {
                continue;
            }
            available.push(detail);
            if available.len() == diff as usize {
                break;
            }
        }
        available
    }

    /// Stamp birth revisions on newly allocated details
    ///
    /// See [`decide_contexts_revision_before_create`] for the strategy
    /// table.
    pub fn decide_contexts_revision_before_create(
        &self,
        owned_ids: &BTreeMap<i32, ContextDetail>,
        new_ids: &mut BTreeMap<i32, ContextDetail>,
        spec: &XSetSpec,
        current_revision: &str,
        updated_revision: &str,
    ) {
        decide_contexts_revision_before_create(
            &self.keys,
            owned_ids,
            new_ids,
            spec,
            current_revision,
            updated_revision,
        )
    }

    /// Re-decide a detail's revision after its target's create call
    ///
    /// Returns whether the detail changed and must be persisted.
    pub fn decide_context_revision_after_create(
        &self,
        detail: &mut ContextDetail,
        updated_revision_name: &str,
        create_err: Option<&Error>,
    ) -> bool {
        decide_context_revision_after_create(&self.keys, detail, updated_revision_name, create_err)
    }

    fn unrecorded_target_ids(
        &self,
        existing_ids: &BTreeMap<i32, ContextDetail>,
        targets: &[C::Target],
        default_revision: &str,
    ) -> BTreeMap<i32, String> {
        let mut unrecorded = BTreeMap::new();
        for target in targets {
            if target.meta().deletion_timestamp.is_some() {
                continue;
            }
            // replace successors reuse their origin's ID later; never adopt
            if targets::is_replace_successor(self.labels.as_ref(), target) {
                continue;
            }
            let Ok(id) = targets::instance_id(self.labels.as_ref(), target) else {
                continue;
            };
            if !existing_ids.contains_key(&id) {
                unrecorded.insert(
                    id,
                    targets::target_revision(self.labels.as_ref(), target, default_revision),
                );
            }
        }
        unrecorded
    }

    async fn create_target_context(
        &self,
        xset: &C::XSet,
        context_name: &str,
        owned_ids: &BTreeMap<i32, ContextDetail>,
    ) -> Result<()> {
        let namespace = xset.namespace().unwrap_or_default();
        let mut obj = self.adapter.new_resource_context();
        obj.meta_mut().namespace = Some(namespace.clone());
        obj.meta_mut().name = Some(context_name.to_string());
        self.adapter
            .set_spec(&mut obj, ResourceContextSpec::from_details(owned_ids.values()));

        self.client.create(&obj).await?;
        self.expectations.expect_creation(
            &object_key(xset),
            self.adapter.resource_context_gvk(),
            &namespace,
            context_name,
        );
        debug!(
            namespace = %namespace,
            name = %context_name,
            ids = owned_ids.len(),
            "created resource context"
        );
        Ok(())
    }

    async fn update_target_context(
        &self,
        xset: &C::XSet,
        owned_ids: &BTreeMap<i32, ContextDetail>,
        live: &mut RA::ResourceContext,
    ) -> Result<()> {
        let spec = self.controller.spec(xset);
        let owner = xset.name_any();
        let owner_key = resolve(&self.keys, ContextKey::Owner);

        // in pool mode, re-read and carry every foreign owner's details
        let mut merged: BTreeMap<i32, ContextDetail> = BTreeMap::new();
        if spec.pool_name().is_some() {
            for detail in self.adapter.spec(live).contexts {
                if detail.contains(owner_key, &owner) {
                    continue;
                }
                merged.insert(detail.id, detail);
            }
        }
        for (id, detail) in owned_ids {
            merged.insert(*id, detail.clone());
        }

        let namespace = live.namespace().unwrap_or_default();
        let name = live.name_any();
        let parent_key = object_key(xset);
        let gvk = self.adapter.resource_context_gvk();

        if merged.is_empty() {
            self.client.delete(live).await?;
            self.expectations
                .expect_deletion(&parent_key, gvk, &namespace, &name);
            return Ok(());
        }

        self.adapter
            .set_spec(live, ResourceContextSpec::from_details(merged.values()));
        let updated = self.client.update(live).await?;
        self.expectations.expect_update(
            &parent_key,
            gvk,
            &namespace,
            &name,
            &updated.resource_version().unwrap_or_default(),
        );
        Ok(())
    }
}

fn resolve(keys: &ContextKeys, key: ContextKey) -> &str {
    keys.get(&key).map(String::as_str).unwrap_or(key.default_key())
}

/// Adopt unrecorded IDs and allocate fresh ones until replicas are covered
///
/// Fresh IDs are the smallest non-negative integers absent from both the
/// existing table and the (possibly just-adopted) owned set. Newly
/// allocated details are stamped with a birth revision before merging.
#[allow(clippy::too_many_arguments)]
fn fulfill_owned_ids(
    keys: &ContextKeys,
    mut owned_ids: BTreeMap<i32, ContextDetail>,
    existing_ids: &BTreeMap<i32, ContextDetail>,
    unrecorded_ids: BTreeMap<i32, String>,
    replicas: i32,
    owner: &str,
    spec: &XSetSpec,
    current_revision: &str,
    updated_revision: &str,
) -> BTreeMap<i32, ContextDetail> {
    for (id, revision) in unrecorded_ids {
        let mut detail = ContextDetail::new(id);
        detail.put(resolve(keys, ContextKey::Owner), owner);
        detail.put(resolve(keys, ContextKey::Revision), revision);
        detail.put(resolve(keys, ContextKey::JustCreate), "true");
        owned_ids.insert(id, detail);
    }

    let mut new_ids = allocate_new_ids(keys, &owned_ids, existing_ids, replicas, owner);
    decide_contexts_revision_before_create(
        keys,
        &owned_ids,
        &mut new_ids,
        spec,
        current_revision,
        updated_revision,
    );
    owned_ids.extend(new_ids);
    owned_ids
}

fn allocate_new_ids(
    keys: &ContextKeys,
    owned_ids: &BTreeMap<i32, ContextDetail>,
    existing_ids: &BTreeMap<i32, ContextDetail>,
    replicas: i32,
    owner: &str,
) -> BTreeMap<i32, ContextDetail> {
    let needed = (replicas.max(0) as usize).saturating_sub(owned_ids.len());
    let mut new_ids = BTreeMap::new();
    let mut candidate = 0i32;
    while new_ids.len() < needed {
        // adopted IDs are not in the existing table yet; skip both sets
        if !existing_ids.contains_key(&candidate) && !owned_ids.contains_key(&candidate) {
            let mut detail = ContextDetail::new(candidate);
            detail.put(resolve(keys, ContextKey::Owner), owner);
            detail.put(resolve(keys, ContextKey::JustCreate), "true");
            new_ids.insert(candidate, detail);
        }
        candidate += 1;
    }
    new_ids
}

/// Stamp birth revisions on newly allocated details per rollout strategy
///
/// | strategy                  | new details born at                       |
/// |---------------------------|-------------------------------------------|
/// | no rolling update         | updated revision                          |
/// | byLabel                   | current revision (labels drive rollout)   |
/// | byPartition, partition=∅  | updated revision                          |
/// | byPartition{P}            | highest IDs up to the partition quota     |
///
/// The partition quota is `(replicas − P) − already_updated`, where
/// `already_updated` counts owned details at the updated revision,
/// excluding replace origins. Walking new IDs descending keeps the total
/// at the updated revision equal to `replicas − P`.
fn decide_contexts_revision_before_create(
    keys: &ContextKeys,
    owned_ids: &BTreeMap<i32, ContextDetail>,
    new_ids: &mut BTreeMap<i32, ContextDetail>,
    spec: &XSetSpec,
    current_revision: &str,
    updated_revision: &str,
) {
    let revision_key = resolve(keys, ContextKey::Revision);

    let Some(rolling) = &spec.update_strategy.rolling_update else {
        for detail in new_ids.values_mut() {
            detail.put(revision_key, updated_revision);
        }
        return;
    };

    if rolling.by_label.is_some() {
        for detail in new_ids.values_mut() {
            detail.put(revision_key, current_revision);
        }
        return;
    }

    let partition = match &rolling.by_partition {
        Some(by_partition) if by_partition.partition.is_some() => by_partition.partition(),
        _ => {
            for detail in new_ids.values_mut() {
                detail.put(revision_key, updated_revision);
            }
            return;
        }
    };

    let origin_key = resolve(keys, ContextKey::ReplaceOriginTargetId);
    let mut updated_replicas = 0i64;
    for detail in owned_ids.values() {
        if detail.get(origin_key).is_some() {
            continue;
        }
        if detail.contains(revision_key, updated_revision) {
            updated_replicas += 1;
        }
    }

    let quota = i64::from(spec.replicas() - partition) - updated_replicas;
    for (index, detail) in new_ids.values_mut().rev().enumerate() {
        if (index as i64) < quota {
            detail.put(revision_key, updated_revision);
        } else {
            detail.put(revision_key, current_revision);
        }
    }
}

/// Re-decide a detail's revision after its target's create call
///
/// On an unrecoverable create error, a just-created or recreate-updating
/// detail pivots to the updated revision and drops its decoration mark; a
/// delete-and-recreate detail keeps its revision. On success or a
/// recoverable error the birth markers are cleared.
fn decide_context_revision_after_create(
    keys: &ContextKeys,
    detail: &mut ContextDetail,
    updated_revision_name: &str,
    create_err: Option<&Error>,
) -> bool {
    let just_create = resolve(keys, ContextKey::JustCreate);
    let recreate_update = resolve(keys, ContextKey::RecreateUpdate);

    if is_unrecoverable_create_error(create_err) {
        if detail.contains(just_create, "true") || detail.contains(recreate_update, "true") {
            detail.put(resolve(keys, ContextKey::Revision), updated_revision_name);
            detail.remove(resolve(keys, ContextKey::TargetDecorationRevision));
            return true;
        }
        return false;
    }

    detail.remove(just_create);
    detail.remove(recreate_update);
    true
}
