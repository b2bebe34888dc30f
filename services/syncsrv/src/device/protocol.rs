//! Wire format of the device REST API
//!
//! Paths are relative to `/api/rest/v2`. Batch entries carry host-relative
//! URLs (including the `/api/rest/v2` prefix) because the device dispatches
//! them internally.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::point::{ObjectType, PointValue};

pub const API_ROOT: &str = "/api/rest/v2";
pub const OBJECTS_PATH: &str = "/services/bacnet/local/objects";
pub const BATCH_PATH: &str = "/batch";
pub const TIME_PATH: &str = "/services/platform/time";
pub const NTP_PATH: &str = "/services/platform/time/ntp";

/// Query selecting name and identifier of every supported object group
pub fn enumeration_query() -> String {
    let groups: Vec<String> = ObjectType::ALL
        .iter()
        .map(|t| {
            format!(
                "{}($select=*($select=object-name,object-identifier))",
                t.url_segment()
            )
        })
        .collect();
    format!("$select={}", groups.join(","))
}

/// One device object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectRef {
    /// Path relative to the API root
    pub fn path(&self) -> String {
        format!(
            "{}/{}/{}",
            OBJECTS_PATH,
            self.object_type.url_segment(),
            self.instance
        )
    }
}

/// Read of one object's present value
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOp {
    /// Device object name, unique per device
    pub key: String,
    pub object: ObjectRef,
}

/// Write of one object's present value
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub key: String,
    pub object: ObjectRef,
    pub value: PointValue,
    /// Commandable write through the priority array when set
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    pub requests: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub id: String,
    pub method: &'static str,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

fn read_id(key: &str) -> String {
    format!("read:{}", key)
}

fn write_id(key: &str) -> String {
    format!("write:{}", key)
}

impl BatchRequest {
    pub fn build(reads: &[ReadOp], writes: &[WriteOp]) -> Self {
        let mut requests = Vec::with_capacity(reads.len() + writes.len());

        for write in writes {
            let object_url = format!("{}{}", API_ROOT, write.object.path());
            let (url, body) = match write.priority {
                Some(priority) => (
                    format!("{}/set-value-at", object_url),
                    json!({ "priority": priority, "value": write.value.to_json() }),
                ),
                None => (object_url, json!({ "present-value": write.value.to_json() })),
            };
            requests.push(BatchEntry {
                id: write_id(&write.key),
                method: "POST",
                url,
                body: Some(body),
            });
        }

        for read in reads {
            requests.push(BatchEntry {
                id: read_id(&read.key),
                method: "GET",
                url: format!("{}{}/present-value", API_ROOT, read.object.path()),
                body: None,
            });
        }

        Self { requests }
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BatchReply {
    responses: Vec<BatchReplyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchReplyEntry {
    id: String,
    status: u16,
    #[serde(default)]
    body: Value,
}

/// Failure of a single operation inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpFailure {
    pub status: Option<u16>,
    pub message: String,
}

impl OpFailure {
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl std::fmt::Display for OpFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {}: {}", status, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Per-operation outcome of one batch
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub writes: BTreeMap<String, Result<(), OpFailure>>,
    pub reads: BTreeMap<String, Result<Value, OpFailure>>,
}

impl BatchResult {
    /// Match a batch reply against the operations that were sent
    ///
    /// Reply entries are matched by id; an operation without an entry counts
    /// as failed. A reply without a `responses` array means the device took
    /// the writes but answered no reads.
    pub fn from_reply(reads: &[ReadOp], writes: &[WriteOp], reply: &Value) -> Self {
        let mut result = Self::default();

        let entries: Option<BTreeMap<String, BatchReplyEntry>> =
            serde_json::from_value::<BatchReply>(reply.clone())
                .ok()
                .map(|r| r.responses.into_iter().map(|e| (e.id.clone(), e)).collect());

        for write in writes {
            let outcome = match &entries {
                None => Ok(()),
                Some(entries) => match entries.get(&write_id(&write.key)) {
                    Some(entry) if (200..300).contains(&entry.status) => Ok(()),
                    Some(entry) => Err(OpFailure {
                        status: Some(entry.status),
                        message: entry_message(&entry.body),
                    }),
                    None => Err(OpFailure {
                        status: None,
                        message: "no response entry".to_string(),
                    }),
                },
            };
            result.writes.insert(write.key.clone(), outcome);
        }

        for read in reads {
            let outcome = match entries.as_ref().and_then(|e| e.get(&read_id(&read.key))) {
                Some(entry) if (200..300).contains(&entry.status) => extract_value(&entry.body)
                    .ok_or_else(|| OpFailure {
                        status: Some(entry.status),
                        message: "response carries no value".to_string(),
                    }),
                Some(entry) => Err(OpFailure {
                    status: Some(entry.status),
                    message: entry_message(&entry.body),
                }),
                None => Err(OpFailure {
                    status: None,
                    message: "no response entry".to_string(),
                }),
            };
            result.reads.insert(read.key.clone(), outcome);
        }

        result
    }

    pub fn failure_count(&self) -> usize {
        self.writes.values().filter(|r| r.is_err()).count()
            + self.reads.values().filter(|r| r.is_err()).count()
    }
}

/// Property reads answer `{"$value": v}` or `{"value": v}`; some firmware
/// returns the bare scalar.
pub fn extract_value(body: &Value) -> Option<Value> {
    match body {
        Value::Object(map) => map.get("$value").or_else(|| map.get("value")).cloned(),
        Value::Null => None,
        scalar => Some(scalar.clone()),
    }
}

fn entry_message(body: &Value) -> String {
    match body {
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .map(|m| m.as_str().map(str::to_string).unwrap_or_else(|| m.to_string()))
            .unwrap_or_else(|| body.to_string()),
        Value::Null => "no details".to_string(),
        other => other.to_string(),
    }
}
