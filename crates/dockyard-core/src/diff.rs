//! Structural comparison between a service's deployed and latest generation.
//!
//! Scalar configuration is compared field by field (nested settings are
//! flattened to dotted paths such as `restart.policy`). Child collections are
//! matched by stable identity, so storage order never produces a change.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::ResourceId;
use crate::generation::{ChildRecord, Domain, Generation, Port, Sysctl, Ulimit, Volume};

/// One changed configuration field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: String,
    /// `null` when the field did not exist before (first deploy).
    pub old: Value,
    pub new: Value,
}

/// A child record present on both sides with different values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildChange<T> {
    pub old: T,
    pub new: T,
}

/// Delta for one to-many child collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionDiff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
    pub changed: Vec<ChildChange<T>>,
}

impl<T> Default for CollectionDiff<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            changed: Vec::new(),
        }
    }
}

impl<T> CollectionDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Delta between a deployed generation and the latest one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GenerationDiff {
    pub fields: Vec<FieldChange>,
    pub domains: CollectionDiff<Domain>,
    pub ports: CollectionDiff<Port>,
    pub volumes: CollectionDiff<Volume>,
    pub sysctls: CollectionDiff<Sysctl>,
    pub ulimits: CollectionDiff<Ulimit>,
}

impl GenerationDiff {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
            && self.domains.is_empty()
            && self.ports.is_empty()
            && self.volumes.is_empty()
            && self.sysctls.is_empty()
            && self.ulimits.is_empty()
    }
}

/// Compare `latest` against `deployed`. With no deployed generation every
/// field and child record is reported as added.
pub fn diff_generations(deployed: Option<&Generation>, latest: &Generation) -> GenerationDiff {
    let old_config = deployed
        .map(|g| to_value(&g.config))
        .unwrap_or(Value::Object(Map::new()));
    let new_config = to_value(&latest.config);

    let mut fields = Vec::new();
    diff_values("", &old_config, &new_config, &mut fields);

    let empty = Generation::new(latest.service_id, Default::default());
    let old = deployed.unwrap_or(&empty);

    GenerationDiff {
        fields,
        domains: diff_collection(&old.domains, &latest.domains),
        ports: diff_collection(&old.ports, &latest.ports),
        volumes: diff_collection(&old.volumes, &latest.volumes),
        sysctls: diff_collection(&old.sysctls, &latest.sysctls),
        ulimits: diff_collection(&old.ulimits, &latest.ulimits),
    }
}

/// True iff deploying `latest` would change anything.
pub fn has_pending_changes(deployed: Option<&Generation>, latest: &Generation) -> bool {
    match deployed {
        None => true,
        Some(deployed) if deployed.id == latest.id => false,
        Some(deployed) => !diff_generations(Some(deployed), latest).is_empty(),
    }
}

/// Only the source decides whether a build is needed: a registry image is
/// deployed as-is no matter what else changed.
pub fn requires_image_build(latest: &Generation) -> bool {
    latest.config.source.is_buildable()
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn diff_values(path: &str, old: &Value, new: &Value, out: &mut Vec<FieldChange>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut keys: Vec<&String> = old_map.keys().chain(new_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                diff_values(
                    &child,
                    old_map.get(key).unwrap_or(&Value::Null),
                    new_map.get(key).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        (Value::Null, Value::Object(_)) => {
            diff_values(path, &Value::Object(Map::new()), new, out);
        }
        (Value::Object(_), Value::Null) => {
            diff_values(path, old, &Value::Object(Map::new()), out);
        }
        (old, new) if old != new => out.push(FieldChange {
            field: path.to_string(),
            old: old.clone(),
            new: new.clone(),
        }),
        _ => {}
    }
}

fn diff_collection<T: ChildRecord>(old: &[T], new: &[T]) -> CollectionDiff<T> {
    let mut result = CollectionDiff::default();

    let mut by_id: HashMap<ResourceId, &T> = old
        .iter()
        .filter_map(|record| record.identity().map(|id| (id, record)))
        .collect();
    let mut anonymous: Vec<&T> = old.iter().filter(|r| r.identity().is_none()).collect();

    for record in new {
        match record.identity() {
            Some(id) => match by_id.remove(&id) {
                Some(previous) if previous != record => result.changed.push(ChildChange {
                    old: previous.clone(),
                    new: record.clone(),
                }),
                Some(_) => {}
                None => result.added.push(record.clone()),
            },
            None => match anonymous.iter().position(|previous| *previous == record) {
                Some(pos) => {
                    anonymous.remove(pos);
                }
                None => result.added.push(record.clone()),
            },
        }
    }

    // Keep removals in their original storage order.
    for record in old {
        match record.identity() {
            Some(id) if by_id.contains_key(&id) => result.removed.push(record.clone()),
            _ => {}
        }
    }
    result.removed.extend(anonymous.into_iter().cloned());

    result
}
