//! Data models for the sync core
//!
//! Records travel as JSON objects. Remotely they are `RemoteDocument`s
//! (id + data); in the local cache a collection is one JSON array whose
//! items carry their `id` inline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::session::UserSession;

/// A document as held by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    /// Document id within its collection
    pub id: String,
    /// Document fields
    pub data: Map<String, Value>,
}

/// Full listing of a remote collection at one point in time
pub type Snapshot = Vec<RemoteDocument>;

impl RemoteDocument {
    /// Create a document from an id and a field map
    pub fn new(id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Build a document from a cached record
    ///
    /// The record must be an object with a string `id`; the id is lifted
    /// out of the field map.
    pub fn from_record(record: Value) -> Option<Self> {
        let Value::Object(mut data) = record else {
            return None;
        };
        let id = match data.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return None,
        };
        Some(Self { id, data })
    }

    /// Flatten into the cached record shape (`{"id": .., ...fields}`)
    pub fn to_record(&self) -> Value {
        let mut record = self.data.clone();
        record.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(record)
    }

    /// Overlay `other`'s fields onto this document (document-level merge)
    pub fn merge_from(&mut self, other: &Map<String, Value>) {
        for (k, v) in other {
            self.data.insert(k.clone(), v.clone());
        }
    }
}

/// An institution (school, club, association) a user manages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Institution {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

impl Institution {
    /// Create a new institution with a fresh id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            address: None,
            is_default: false,
            created_at: Utc::now(),
        }
    }

    /// The record seeded the first time a user has no institution
    pub fn default_for(session: &UserSession) -> Self {
        let name = match session.email.as_deref() {
            Some(email) => format!("{}'s institution", email),
            None => "My institution".to_string(),
        };
        Self {
            is_default: true,
            ..Self::new(name)
        }
    }
}

/// How to seed a collection the first time it is observed empty
#[derive(Debug, Clone, Copy)]
pub struct SeedSpec {
    /// Logical key of the once-per-user marker
    pub marker_key: &'static str,
    /// Builds the default record
    pub factory: fn(&UserSession) -> Value,
}

/// A remote collection mirrored into one local cache key
#[derive(Debug, Clone, Copy)]
pub struct CollectionSpec {
    /// Collection name in the remote store
    pub remote_name: &'static str,
    /// Logical key of the local cache entry
    pub local_key: &'static str,
    /// Default-record rule, if any
    pub seed: Option<SeedSpec>,
}

impl CollectionSpec {
    /// A collection without seeding
    pub const fn plain(name: &'static str) -> Self {
        Self {
            remote_name: name,
            local_key: name,
            seed: None,
        }
    }
}

fn default_institution_record(session: &UserSession) -> Value {
    serde_json::to_value(Institution::default_for(session)).unwrap_or(Value::Null)
}

/// Institutions are cached under the legacy `establishments` key
pub const INSTITUTIONS: CollectionSpec = CollectionSpec {
    remote_name: "institutions",
    local_key: "establishments",
    seed: Some(SeedSpec {
        marker_key: "defaultEstablishmentCreated",
        factory: default_institution_record,
    }),
};

pub const STUDENTS: CollectionSpec = CollectionSpec::plain("students");
pub const ACTIVITIES: CollectionSpec = CollectionSpec::plain("activities");
pub const ATTENDANCE: CollectionSpec = CollectionSpec::plain("attendance");

/// Collections tracked when none are configured explicitly
pub const DEFAULT_COLLECTIONS: [CollectionSpec; 4] = [INSTITUTIONS, STUDENTS, ACTIVITIES, ATTENDANCE];
