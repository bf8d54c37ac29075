//! Target label helpers and the target client seam
//!
//! Targets carry their engine bookkeeping in labels: the stable instance
//! ID, the controlled-by marker, the replace-pair-origin back-pointer, and
//! the revision hash. This module reads them, and defines the
//! [`TargetControl`] trait the reconciler uses to list and mutate targets.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};

use xset_api::adapter::XSetController;
use xset_api::labels::{LabelAnnotationManager, LabelKey};
use xset_api::{error, Error, Result};

/// Read a target's instance ID from its labels
///
/// Fails when the label is missing or does not parse as a non-negative
/// 32-bit integer; callers treat a failure as "this target has no ID".
pub fn instance_id<T: ResourceExt>(labels: &dyn LabelAnnotationManager, target: &T) -> Result<i32> {
    let key = labels.value(LabelKey::InstanceId);
    let value = target
        .labels()
        .get(key)
        .ok_or_else(|| Error::internal_with_context("targets", format!("missing label {key}")))?;
    let id: i32 = value.parse().map_err(|_| {
        Error::internal_with_context("targets", format!("invalid instance ID {value:?}"))
    })?;
    if id < 0 {
        return Err(Error::internal_with_context(
            "targets",
            format!("negative instance ID {id}"),
        ));
    }
    Ok(id)
}

/// Read a target's revision label, falling back to a default
pub fn target_revision<T: ResourceExt>(
    labels: &dyn LabelAnnotationManager,
    target: &T,
    default_revision: &str,
) -> String {
    target
        .labels()
        .get(labels.value(LabelKey::RevisionHash))
        .cloned()
        .unwrap_or_else(|| default_revision.to_string())
}

/// Check whether a target carries the controlled-by marker
///
/// Watch predicates use this to drop events for objects that merely match
/// the selector but are not engine-managed.
pub fn is_controlled_by_xset<T: ResourceExt>(
    labels: &dyn LabelAnnotationManager,
    target: &T,
) -> bool {
    target
        .labels()
        .contains_key(labels.value(LabelKey::ControlledBy))
}

/// Check whether a target is a replace successor
pub fn is_replace_successor<T: ResourceExt>(
    labels: &dyn LabelAnnotationManager,
    target: &T,
) -> bool {
    target
        .labels()
        .contains_key(labels.value(LabelKey::ReplacePairOrigin))
}

/// Render a `LabelSelector` as a list-request selector string
pub fn selector_string(selector: &LabelSelector) -> Result<String> {
    let mut terms = Vec::new();
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            terms.push(format!("{key}={value}"));
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.clone().unwrap_or_default().join(",");
            match expr.operator.as_str() {
                "In" => terms.push(format!("{} in ({values})", expr.key)),
                "NotIn" => terms.push(format!("{} notin ({values})", expr.key)),
                "Exists" => terms.push(expr.key.clone()),
                "DoesNotExist" => terms.push(format!("!{}", expr.key)),
                other => {
                    return Err(Error::validation(format!(
                        "unsupported selector operator {other:?}"
                    )))
                }
            }
        }
    }
    Ok(terms.join(","))
}

/// Client seam for listing and mutating targets
#[async_trait]
pub trait TargetControl<C: XSetController>: Send + Sync {
    /// List the live targets selected by the parent and owned by it
    async fn filtered_targets(
        &self,
        selector: &LabelSelector,
        owner: &C::XSet,
    ) -> Result<Vec<C::Target>>;

    /// Replace a target object
    async fn update_target(&self, target: &C::Target) -> Result<C::Target>;

    /// Delete a target object
    async fn delete_target(&self, target: &C::Target) -> Result<()>;
}

/// Production [`TargetControl`] over a typed `Api`
pub struct KubeTargetControl<C> {
    client: Client,
    _controller: std::marker::PhantomData<C>,
}

impl<C> KubeTargetControl<C> {
    /// Create a target client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _controller: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<C: XSetController> TargetControl<C> for KubeTargetControl<C> {
    async fn filtered_targets(
        &self,
        selector: &LabelSelector,
        owner: &C::XSet,
    ) -> Result<Vec<C::Target>> {
        let namespace = owner.namespace().unwrap_or_default();
        let api: Api<C::Target> = Api::namespaced(self.client.clone(), &namespace);
        let params = ListParams::default().labels(&selector_string(selector)?);
        let listed = api.list(&params).await?;

        let owner_uid = owner.uid();
        Ok(listed
            .items
            .into_iter()
            .filter(|target| {
                target.owner_references().iter().any(|reference| {
                    reference.controller == Some(true)
                        && Some(&reference.uid) == owner_uid.as_ref()
                })
            })
            .collect())
    }

    async fn update_target(&self, target: &C::Target) -> Result<C::Target> {
        let namespace = target.namespace().unwrap_or_default();
        let api: Api<C::Target> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace(&target.name_any(), &PostParams::default(), target)
            .await?)
    }

    async fn delete_target(&self, target: &C::Target) -> Result<()> {
        let namespace = target.namespace().unwrap_or_default();
        let api: Api<C::Target> = Api::namespaced(self.client.clone(), &namespace);
        match api.delete(&target.name_any(), &Default::default()).await {
            Ok(_) => Ok(()),
            Err(err) if error::is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
