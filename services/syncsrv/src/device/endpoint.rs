//! Name to instance index built from the device's object enumeration

use std::collections::{HashMap, HashSet};

use errors::{SyncError, SyncResult};
use serde_json::Value;
use tracing::{debug, warn};

use crate::point::ObjectType;

/// (object type, object name) -> instance number
#[derive(Debug, Clone, Default)]
pub struct EndpointIndex {
    entries: HashMap<(ObjectType, String), u32>,
    /// Names exposed more than once for the same type; never resolvable
    ambiguous: HashSet<(ObjectType, String)>,
}

impl EndpointIndex {
    /// Build the index from an enumeration reply
    ///
    /// The reply groups objects by collection, then by instance:
    /// `{"analog-inputs": {"3": {"object-name": .., "object-identifier":
    /// {"object-type": .., "object-instance": 3}}}}`. Object types outside the
    /// supported set are skipped.
    pub fn from_enumeration(reply: &Value) -> SyncResult<Self> {
        let groups = reply.as_object().ok_or_else(|| {
            SyncError::Serialization("object enumeration is not a JSON object".to_string())
        })?;

        let mut index = Self::default();
        for (group_name, group) in groups {
            let group_type = group_name.parse::<ObjectType>().ok();
            let objects = match group.as_object() {
                Some(objects) => objects,
                None => continue,
            };
            for (instance_key, object) in objects {
                let name = match object.get("object-name").and_then(Value::as_str) {
                    Some(name) => name,
                    None => continue,
                };
                let identifier = object.get("object-identifier");
                let object_type = identifier
                    .and_then(|id| id.get("object-type"))
                    .and_then(Value::as_str)
                    .and_then(|t| t.parse::<ObjectType>().ok())
                    .or(group_type);
                let instance = identifier
                    .and_then(|id| id.get("object-instance"))
                    .and_then(Value::as_u64)
                    .or_else(|| instance_key.parse::<u64>().ok())
                    .and_then(|i| u32::try_from(i).ok());

                match (object_type, instance) {
                    (Some(object_type), Some(instance)) => index.insert(object_type, name, instance),
                    _ => debug!("Skipping enumerated object {}/{}", group_name, instance_key),
                }
            }
        }
        Ok(index)
    }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (ObjectType, &'a str, u32)>) -> Self {
        let mut index = Self::default();
        for (object_type, name, instance) in entries {
            index.insert(object_type, name, instance);
        }
        index
    }

    fn insert(&mut self, object_type: ObjectType, name: &str, instance: u32) {
        let key = (object_type, name.to_string());
        if self.ambiguous.contains(&key) {
            return;
        }
        match self.entries.get(&key) {
            Some(existing) if *existing != instance => {
                warn!(
                    "{} '{}' exposed twice (instances {} and {}); leaving it unresolvable",
                    object_type, name, existing, instance
                );
                self.entries.remove(&key);
                self.ambiguous.insert(key);
            },
            _ => {
                self.entries.insert(key, instance);
            },
        }
    }

    pub fn lookup(&self, object_type: ObjectType, name: &str) -> Option<u32> {
        self.entries.get(&(object_type, name.to_string())).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
