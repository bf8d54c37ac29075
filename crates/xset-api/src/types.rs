//! Engine views of the XSet spec and status
//!
//! These are not CRDs. Concrete controllers own their CRD types and project
//! them into these views through the [`crate::adapter::XSetController`]
//! adapter; the engine never deserializes a parent object directly. Field
//! names follow Kubernetes API conventions so the status view can be written
//! back verbatim.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time};
use serde::{Deserialize, Serialize};

/// Condition type set on the parent while it is being torn down
pub const XSET_TERMINATING: &str = "XSetTerminating";

/// The slice of a parent spec the engine consumes
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct XSetSpec {
    /// Desired number of targets. Absent means zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label selector identifying the child targets
    #[serde(default)]
    pub selector: LabelSelector,

    /// Scale behavior, including the optional shared ID pool
    #[serde(default)]
    pub scale_strategy: ScaleStrategy,

    /// Rollout behavior for revision changes
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
}

impl XSetSpec {
    /// Desired replicas with the absent-means-zero default applied
    ///
    /// The single point where `spec.replicas` is read; nothing else
    /// dereferences the optional.
    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(0)
    }

    /// Name of the shared ID pool, if pool mode is enabled
    ///
    /// An empty string counts as disabled, matching the wire convention.
    pub fn pool_name(&self) -> Option<&str> {
        self.scale_strategy
            .context
            .as_deref()
            .filter(|name| !name.is_empty())
    }
}

/// Scale strategy for an XSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ScaleStrategy {
    /// Name of a ResourceContext shared across several XSets.
    ///
    /// When set, instance IDs are allocated from a cross-owner pool and
    /// the sidecar object is named by this value instead of the parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Update strategy for an XSet
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    /// Rolling update progression. Absent means every new target is born
    /// at the updated revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

/// Discriminated union of rollout progressions
///
/// At most one member is set; `by_partition` wins if both appear.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// Partition-based progression: a fixed number of replicas stay on the
    /// current revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_partition: Option<ByPartition>,

    /// Label-based progression: rollout advances externally by labeling
    /// targets; the engine keeps new births on the current revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_label: Option<ByLabel>,
}

/// Partition rollout parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ByPartition {
    /// Number of replicas that must remain at the current revision.
    /// Absent means zero (everything rolls forward).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

impl ByPartition {
    /// Partition with the absent-means-zero default applied
    pub fn partition(&self) -> i32 {
        self.partition.unwrap_or(0)
    }
}

/// Label rollout marker. Carries no parameters.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct ByLabel {}

/// The slice of a parent status the engine owns
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct XSetStatus {
    /// The generation of the spec that was last processed by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the revision the set is rolling from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_revision: String,

    /// Name of the revision the set is rolling to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated_revision: String,

    /// Hash-collision counter consumed by the revision manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    /// Conditions representing the set state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Find a condition by type
pub fn find_condition<'a>(status: &'a XSetStatus, type_: &str) -> Option<&'a Condition> {
    status.conditions.iter().find(|c| c.type_ == type_)
}

/// Add or update a condition in place
///
/// `healthy` maps to condition status `True`. The transition timestamp is
/// bumped only when the status value actually flips, per Kubernetes
/// condition semantics.
pub fn add_or_update_condition(
    status: &mut XSetStatus,
    type_: &str,
    healthy: bool,
    reason: &str,
    message: &str,
) {
    let new_status = if healthy { "True" } else { "False" };
    match status.conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != new_status {
                existing.last_transition_time = Time(chrono::Utc::now());
            }
            existing.status = new_status.to_string();
            existing.reason = reason.to_string();
            existing.message = message.to_string();
        }
        None => status.conditions.push(Condition {
            type_: type_.to_string(),
            status: new_status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: Time(chrono::Utc::now()),
            observed_generation: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod spec_defaults {
        use super::*;

        #[test]
        fn test_replicas_default_to_zero() {
            let spec = XSetSpec::default();
            assert_eq!(spec.replicas(), 0);

            let spec = XSetSpec {
                replicas: Some(7),
                ..Default::default()
            };
            assert_eq!(spec.replicas(), 7);
        }

        #[test]
        fn test_partition_defaults_to_zero() {
            assert_eq!(ByPartition::default().partition(), 0);
            assert_eq!(
                ByPartition {
                    partition: Some(3)
                }
                .partition(),
                3
            );
        }

        #[test]
        fn test_pool_mode_requires_nonempty_context() {
            let mut spec = XSetSpec::default();
            assert_eq!(spec.pool_name(), None);

            spec.scale_strategy.context = Some(String::new());
            assert_eq!(spec.pool_name(), None, "empty string is not a pool");

            spec.scale_strategy.context = Some("shared-pool".to_string());
            assert_eq!(spec.pool_name(), Some("shared-pool"));
        }
    }

    mod wire_format {
        use super::*;

        #[test]
        fn test_spec_round_trips_camel_case() {
            let raw = r#"{
                "replicas": 3,
                "scaleStrategy": {"context": "shared"},
                "updateStrategy": {"rollingUpdate": {"byPartition": {"partition": 1}}}
            }"#;
            let spec: XSetSpec = serde_json::from_str(raw).unwrap();
            assert_eq!(spec.replicas(), 3);
            assert_eq!(spec.pool_name(), Some("shared"));
            let rolling = spec.update_strategy.rolling_update.as_ref().unwrap();
            assert_eq!(rolling.by_partition.as_ref().unwrap().partition(), 1);
            assert!(rolling.by_label.is_none());
        }

        #[test]
        fn test_empty_status_serializes_empty() {
            let status = XSetStatus::default();
            assert_eq!(serde_json::to_string(&status).unwrap(), "{}");
        }
    }

    mod conditions {
        use super::*;

        #[test]
        fn test_add_then_update_keeps_single_entry() {
            let mut status = XSetStatus::default();
            add_or_update_condition(&mut status, XSET_TERMINATING, false, "Deleting", "waiting");
            add_or_update_condition(&mut status, XSET_TERMINATING, true, "Deleted", "");

            assert_eq!(status.conditions.len(), 1);
            let cond = find_condition(&status, XSET_TERMINATING).unwrap();
            assert_eq!(cond.status, "True");
            assert_eq!(cond.reason, "Deleted");
        }

        #[test]
        fn test_transition_time_only_bumps_on_status_flip() {
            let mut status = XSetStatus::default();
            add_or_update_condition(&mut status, XSET_TERMINATING, false, "A", "first");
            let first = status.conditions[0].last_transition_time.clone();

            // same status, different reason: timestamp untouched
            add_or_update_condition(&mut status, XSET_TERMINATING, false, "B", "second");
            assert_eq!(status.conditions[0].last_transition_time, first);
            assert_eq!(status.conditions[0].reason, "B");
        }

        #[test]
        fn test_distinct_condition_types_coexist() {
            let mut status = XSetStatus::default();
            add_or_update_condition(&mut status, XSET_TERMINATING, false, "Deleting", "");
            add_or_update_condition(&mut status, "Synced", true, "AllInPlace", "");
            assert_eq!(status.conditions.len(), 2);
        }
    }
}
