//! Versioned, schema-validated data exchange over relations
//!
//! Both sides of a structured relation advertise the interface versions they
//! speak under `_supported_versions` in their application databag. The first
//! version (in our preference order) that the remote side also lists is used,
//! and the payload under `data` is YAML validated against that version's
//! schema.

use std::collections::BTreeMap;

use kfp_models::{Databag, Relation};
use serde_yaml::Value;
use tracing::debug;

use crate::model::{needs_update, UnitModel};
use crate::names::relations;

pub const VERSIONS_KEY: &str = "_supported_versions";
pub const DATA_KEY: &str = "data";

/// Validated relation payload with every value rendered as text
pub type FlatRecord = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Boolean,
    TextOrInteger,
}

impl FieldKind {
    fn describe(self) -> &'static str {
        match self {
            FieldKind::Text => "a string",
            FieldKind::Integer => "an integer",
            FieldKind::Boolean => "a boolean",
            FieldKind::TextOrInteger => "a string or an integer",
        }
    }
}

/// Field every payload of a schema must carry
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn required(name: &'static str, kind: FieldKind) -> Field {
    Field { name, kind }
}

/// Schema of one interface version
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub version: &'static str,
    pub fields: &'static [Field],
}

/// A relation endpoint and the schema versions we accept on it, newest first
///
/// An endpoint with no schemas is exposed unversioned.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceSpec {
    pub relation_name: &'static str,
    pub schemas: &'static [Schema],
}

const SERVICE_INFO_V1: Schema = Schema {
    version: "v1",
    fields: &[
        required("service-name", FieldKind::Text),
        required("service-port", FieldKind::TextOrInteger),
    ],
};

pub const OBJECT_STORAGE: InterfaceSpec = InterfaceSpec {
    relation_name: relations::OBJECT_STORAGE,
    schemas: &[Schema {
        version: "v1",
        fields: &[
            required("access-key", FieldKind::Text),
            required("namespace", FieldKind::Text),
            required("port", FieldKind::Integer),
            required("secret-key", FieldKind::Text),
            required("secure", FieldKind::Boolean),
            required("service", FieldKind::Text),
        ],
    }],
};

pub const KFP_VIZ: InterfaceSpec = InterfaceSpec {
    relation_name: relations::KFP_VIZ,
    schemas: &[SERVICE_INFO_V1],
};

pub const KFP_API: InterfaceSpec = InterfaceSpec {
    relation_name: relations::KFP_API,
    schemas: &[SERVICE_INFO_V1],
};

/// Structured endpoints of this operator
pub const OPERATOR_INTERFACES: [InterfaceSpec; 3] = [OBJECT_STORAGE, KFP_VIZ, KFP_API];

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("No versions listed by remote application on relation {relation}")]
    NoVersionsListed { relation: String },
    #[error("No compatible versions found for relation {relation}: ours {ours:?}, theirs {theirs:?}")]
    NoCompatibleVersions {
        relation: String,
        ours: Vec<String>,
        theirs: Vec<String>,
    },
    #[error("Invalid data on relation {relation}: {reason}")]
    RelationData { relation: String, reason: String },
    #[error(transparent)]
    Model(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("{relation}: data is not a mapping")]
    NotAMapping { relation: String },
    #[error("{relation}: missing required field '{field}'")]
    MissingField { relation: String, field: &'static str },
    #[error("{relation}: field '{field}' must be {expected}")]
    WrongType {
        relation: String,
        field: &'static str,
        expected: &'static str,
    },
}

/// Negotiated endpoint
#[derive(Debug, Clone)]
pub enum Interface {
    Structured(SerializedInterface),
    Unversioned(Vec<Relation>),
}

/// Negotiated endpoints keyed by relation name; `None` when nothing is related
pub type Interfaces = BTreeMap<String, Option<Interface>>;

/// One remote application's validated payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRecord {
    pub app: String,
    pub data: FlatRecord,
}

#[derive(Debug, Clone)]
pub struct SerializedInterface {
    relation_name: String,
    schema: Schema,
    relations: Vec<Relation>,
}

impl SerializedInterface {
    pub fn version(&self) -> &str {
        self.schema.version
    }

    /// Validated payloads of every remote application that has sent one
    ///
    /// Applications that have not written `data` yet are skipped; an empty
    /// mapping is returned as an empty record.
    pub fn get_data(&self) -> Result<Vec<InterfaceRecord>, SchemaError> {
        let mut records = Vec::new();
        for relation in &self.relations {
            let (Some(app), Some(raw)) = (&relation.remote_app, relation.app_data.get(DATA_KEY))
            else {
                continue;
            };
            let value: Value = serde_yaml::from_str(raw).map_err(|_| SchemaError::NotAMapping {
                relation: self.relation_name.clone(),
            })?;
            let data = match value.as_mapping() {
                Some(mapping) if mapping.is_empty() => FlatRecord::new(),
                _ => validate(&self.schema, &self.relation_name, &value)?,
            };
            records.push(InterfaceRecord {
                app: app.clone(),
                data,
            });
        }
        Ok(records)
    }

    /// Validate `data` and publish it on every relation of this endpoint
    pub async fn send_data(
        &self,
        model: &dyn UnitModel,
        data: &BTreeMap<String, Value>,
    ) -> anyhow::Result<()> {
        let mapping: serde_yaml::Mapping = data
            .iter()
            .map(|(key, value)| (Value::from(key.as_str()), value.clone()))
            .collect();
        validate(&self.schema, &self.relation_name, &Value::Mapping(mapping))?;

        let payload = Databag::from([(DATA_KEY.to_string(), serde_yaml::to_string(data)?)]);
        for relation in &self.relations {
            if needs_update(relation, &payload) {
                debug!(relation = %relation.relation_id(), "publishing interface data");
                model.set_app_data(relation, &payload).await?;
            }
        }
        Ok(())
    }
}

/// Negotiate every endpoint in `specs`
///
/// Publishes our supported versions on each relation that lacks them, so it
/// must only run on the leader.
pub async fn get_interfaces(
    model: &dyn UnitModel,
    specs: &[InterfaceSpec],
) -> Result<Interfaces, NegotiationError> {
    let mut interfaces = Interfaces::new();
    for spec in specs {
        let relations = model.relations(spec.relation_name).await?;
        let interface = if relations.is_empty() {
            None
        } else if spec.schemas.is_empty() {
            Some(Interface::Unversioned(relations))
        } else {
            Some(Interface::Structured(negotiate(model, spec, relations).await?))
        };
        interfaces.insert(spec.relation_name.to_string(), interface);
    }
    Ok(interfaces)
}

async fn negotiate(
    model: &dyn UnitModel,
    spec: &InterfaceSpec,
    mut relations: Vec<Relation>,
) -> Result<SerializedInterface, NegotiationError> {
    let ours: Vec<&str> = spec.schemas.iter().map(|schema| schema.version).collect();
    let advertised = Databag::from([(
        VERSIONS_KEY.to_string(),
        serde_yaml::to_string(&ours).map_err(anyhow::Error::from)?,
    )]);
    let mut common = ours.clone();

    for relation in relations.iter_mut() {
        if needs_update(relation, &advertised) {
            model.set_app_data(relation, &advertised).await?;
            relation.local_app_data.extend(advertised.clone());
        }

        let theirs = remote_versions(relation)?;
        common.retain(|version| theirs.iter().any(|t| t == version));
        if common.is_empty() {
            return Err(NegotiationError::NoCompatibleVersions {
                relation: spec.relation_name.to_string(),
                ours: ours.iter().map(|v| v.to_string()).collect(),
                theirs,
            });
        }

        if let Some(raw) = relation.app_data.get(DATA_KEY) {
            serde_yaml::from_str::<Value>(raw).map_err(|e| NegotiationError::RelationData {
                relation: spec.relation_name.to_string(),
                reason: e.to_string(),
            })?;
        }
    }

    let schema = spec
        .schemas
        .iter()
        .find(|schema| common.contains(&schema.version))
        .copied()
        .ok_or_else(|| NegotiationError::NoCompatibleVersions {
            relation: spec.relation_name.to_string(),
            ours: ours.iter().map(|v| v.to_string()).collect(),
            theirs: Vec::new(),
        })?;

    Ok(SerializedInterface {
        relation_name: spec.relation_name.to_string(),
        schema,
        relations,
    })
}

fn remote_versions(relation: &Relation) -> Result<Vec<String>, NegotiationError> {
    let raw = relation
        .app_data
        .get(VERSIONS_KEY)
        .filter(|raw| !raw.trim().is_empty())
        .ok_or_else(|| NegotiationError::NoVersionsListed {
            relation: relation.name.clone(),
        })?;
    serde_yaml::from_str(raw).map_err(|e| NegotiationError::RelationData {
        relation: relation.name.clone(),
        reason: format!("unreadable {}: {}", VERSIONS_KEY, e),
    })
}

fn validate(schema: &Schema, relation: &str, value: &Value) -> Result<FlatRecord, SchemaError> {
    let mapping = value.as_mapping().ok_or_else(|| SchemaError::NotAMapping {
        relation: relation.to_string(),
    })?;

    let mut record = FlatRecord::new();
    for field in schema.fields {
        match mapping.get(field.name) {
            None | Some(Value::Null) => {
                return Err(SchemaError::MissingField {
                    relation: relation.to_string(),
                    field: field.name,
                });
            }
            Some(value) => {
                let text = flatten(field.kind, value).ok_or_else(|| SchemaError::WrongType {
                    relation: relation.to_string(),
                    field: field.name,
                    expected: field.kind.describe(),
                })?;
                record.insert(field.name.to_string(), text);
            }
        }
    }

    // Fields outside the schema are passed through when they are scalars
    for (key, value) in mapping {
        if let (Some(key), Some(text)) = (key.as_str(), scalar_text(value)) {
            record.entry(key.to_string()).or_insert(text);
        }
    }
    Ok(record)
}

fn flatten(kind: FieldKind, value: &Value) -> Option<String> {
    match (kind, value) {
        (FieldKind::Text | FieldKind::TextOrInteger, Value::String(s)) => Some(s.clone()),
        (FieldKind::Integer | FieldKind::TextOrInteger, Value::Number(n)) if n.is_i64() || n.is_u64() => {
            Some(n.to_string())
        }
        (FieldKind::Boolean, Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
