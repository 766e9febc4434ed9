use std::{cmp::Ordering, collections::BTreeMap};

use kube_client::core::DynamicObject;
use odo_core::labels;
use serde::{Deserialize, Serialize};

use crate::PlatformError;

/// A platform object reduced to the fields ownership decisions need
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    pub kind: String,
    pub api_version: String,
    /// Plural resource name used to address the object through the API
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub resource: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_refs: Vec<OwnerRef>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub block_owner_deletion: bool,
}

pub const KIND_POD: &str = "Pod";
pub const KIND_CLAIM: &str = "PersistentVolumeClaim";
pub const KIND_ENGINE_VOLUME: &str = "Volume";

impl ResourceRecord {
    pub(crate) fn from_dynamic(object: &DynamicObject, resource: &str) -> ResourceRecord {
        let (kind, api_version) = match &object.types {
            Some(types) => (types.kind.clone(), types.api_version.clone()),
            None => (String::new(), String::new()),
        };
        ResourceRecord {
            kind,
            api_version,
            resource: resource.to_owned(),
            name: object.metadata.name.clone().unwrap_or_default(),
            namespace: object.metadata.namespace.clone(),
            labels: object.metadata.labels.clone().unwrap_or_default(),
            annotations: object.metadata.annotations.clone().unwrap_or_default(),
            owner_refs: object
                .metadata
                .owner_references
                .iter()
                .flatten()
                .map(|owner| OwnerRef {
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                    block_owner_deletion: owner.block_owner_deletion.unwrap_or(false),
                })
                .collect(),
        }
    }

    /// Volumes are deleted only after every workload using them is gone
    pub fn is_volume(&self) -> bool {
        self.kind == KIND_CLAIM || self.kind == KIND_ENGINE_VOLUME
    }

    pub fn display_order(&self, other: &ResourceRecord) -> Ordering {
        self.kind.cmp(&other.kind).then_with(|| self.name.cmp(&other.name))
    }
}

/// Refuses to touch an object that another manager, component or mode holds
pub(crate) fn check_ownership(
    kind: &str,
    name: &str,
    existing: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> Result<(), PlatformError> {
    let conflict = |holder: String| PlatformError::Conflict {
        kind: kind.to_owned(),
        name: name.to_owned(),
        holder,
    };
    match existing.get(labels::MANAGED_BY) {
        Some(manager) if manager == labels::TOOL_NAME => {}
        Some(manager) => return Err(conflict(format!("{:?}", manager))),
        None => return Err(conflict("an unknown manager".to_owned())),
    }
    for key in [labels::INSTANCE, labels::MODE] {
        if existing.get(key) != desired.get(key) {
            return Err(conflict(format!(
                "{}={}",
                key,
                existing.get(key).map(String::as_str).unwrap_or("<unset>")
            )));
        }
    }
    Ok(())
}

/// Drops records that are owned by another listed record, since deleting the owner collects them
pub fn without_dependents(records: Vec<ResourceRecord>) -> Vec<ResourceRecord> {
    let owners: Vec<(String, String)> = records
        .iter()
        .map(|record| (record.kind.clone(), record.name.clone()))
        .collect();
    records
        .into_iter()
        .filter(|record| {
            !record
                .owner_refs
                .iter()
                .any(|owner| owners.iter().any(|(kind, name)| *kind == owner.kind && *name == owner.name))
        })
        .collect()
}

pub fn sort_for_display(records: &mut Vec<ResourceRecord>) {
    records.sort_by(ResourceRecord::display_order);
    records.dedup_by(|a, b| a.kind == b.kind && a.name == b.name && a.namespace == b.namespace);
}
