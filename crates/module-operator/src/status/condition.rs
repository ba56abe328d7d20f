//! The condition vocabulary written onto lifecycle resources.
//!
//! The condition list is the only persisted record of how far a reconcile got, so the tags here are
//! stable wire values and must never be renamed.

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::Utc,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// The condition tags, one per state machine transition.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum ConditionType {
    PreInstall,
    InstallStarted,
    InstallComplete,
    AlreadyInstalled,
    PreUninstall,
    UninstallStarted,
    UninstallComplete,
    AlreadyUninstalled,
    PreUpgrade,
    UpgradeStarted,
    UpgradeComplete,
    AlreadyUpgraded,
    PreUpdate,
    UpdateStarted,
    UpdateComplete,
    AlreadyUpdated,
    /// The requested action is not one this operator knows.
    UnknownAction,
}

impl ConditionType {
    /// Position of the tag in the state machine ordering within its action.
    ///
    /// A higher rank always wins when two tags would collide.
    pub fn rank(self) -> u8 {
        match self {
            Self::PreInstall | Self::PreUninstall | Self::PreUpgrade | Self::PreUpdate => 1,
            Self::InstallStarted
            | Self::UninstallStarted
            | Self::UpgradeStarted
            | Self::UpdateStarted => 2,
            Self::InstallComplete
            | Self::AlreadyInstalled
            | Self::UninstallComplete
            | Self::AlreadyUninstalled
            | Self::UpgradeComplete
            | Self::AlreadyUpgraded
            | Self::UpdateComplete
            | Self::AlreadyUpdated
            | Self::UnknownAction => 3,
        }
    }

    /// The action this tag belongs to, if any.
    pub fn action_name(self) -> Option<&'static str> {
        match self {
            Self::PreInstall
            | Self::InstallStarted
            | Self::InstallComplete
            | Self::AlreadyInstalled => Some("install"),
            Self::PreUninstall
            | Self::UninstallStarted
            | Self::UninstallComplete
            | Self::AlreadyUninstalled => Some("uninstall"),
            Self::PreUpgrade
            | Self::UpgradeStarted
            | Self::UpgradeComplete
            | Self::AlreadyUpgraded => Some("upgrade"),
            Self::PreUpdate | Self::UpdateStarted | Self::UpdateComplete | Self::AlreadyUpdated => {
                Some("update")
            }
            Self::UnknownAction => None,
        }
    }

    /// The coarse state a resource is in right after this tag was written.
    pub fn lifecycle_state(self) -> LifecycleState {
        match self {
            Self::PreInstall => LifecycleState::PreInstall,
            Self::PreUninstall => LifecycleState::PreUninstall,
            Self::PreUpgrade => LifecycleState::PreUpgrade,
            Self::PreUpdate => LifecycleState::PreUpdate,
            Self::InstallStarted | Self::UpgradeStarted | Self::UpdateStarted => {
                LifecycleState::Reconciling
            }
            Self::UninstallStarted => LifecycleState::Uninstalling,
            Self::InstallComplete
            | Self::AlreadyInstalled
            | Self::UpgradeComplete
            | Self::AlreadyUpgraded
            | Self::UpdateComplete
            | Self::AlreadyUpdated => LifecycleState::Ready,
            Self::UninstallComplete | Self::AlreadyUninstalled => LifecycleState::Uninstalled,
            Self::UnknownAction => LifecycleState::Failed,
        }
    }
}

/// Coarse state stored in `status.state`.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum LifecycleState {
    PreInstall,
    PreUninstall,
    PreUpgrade,
    PreUpdate,
    Reconciling,
    Uninstalling,
    Ready,
    Uninstalled,
    Failed,
}

/// According to the Kubernetes schema the only allowed values for the `status` of a condition
/// are `True`, `False` and `Unknown`.
#[derive(
    AsRefStr,
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    EnumString,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    #[serde(default)]
    pub status: ConditionStatus,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    /// The object generation this condition was written for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Builds a condition for `generation`.
///
/// The `last_transition_time` of the most recent condition with the same type and status in
/// `current` is kept, otherwise it is set to now.
pub fn build_condition(
    current: &[LifecycleCondition],
    type_: ConditionType,
    status: ConditionStatus,
    message: impl Into<String>,
    generation: i64,
) -> LifecycleCondition {
    let last_transition_time = match current.iter().rev().find(|c| c.type_ == type_) {
        Some(previous) if previous.status == status => previous.last_transition_time.clone(),
        _ => None,
    }
    .unwrap_or_else(|| Time(Utc::now()));

    LifecycleCondition {
        type_,
        status,
        reason: type_.to_string(),
        message: message.into(),
        last_transition_time: Some(last_transition_time),
        observed_generation: Some(generation),
    }
}

/// Among the conditions written for `generation` whose tag is in `candidates`, the one furthest
/// along in the state machine ordering. Later entries win ties.
pub fn most_advanced(
    conditions: &[LifecycleCondition],
    generation: i64,
    candidates: &[ConditionType],
) -> Option<ConditionType> {
    conditions
        .iter()
        .filter(|c| c.observed_generation == Some(generation) && candidates.contains(&c.type_))
        .map(|c| c.type_)
        .fold(None, |best: Option<ConditionType>, type_| match best {
            Some(best) if best.rank() > type_.rank() => Some(best),
            _ => Some(type_),
        })
}
