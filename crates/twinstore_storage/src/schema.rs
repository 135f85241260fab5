//! Record type definitions.

use crate::lob::LobKind;
use crate::value::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by [`SchemaBuilder::build`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// The type declares no primary key.
    #[error("type {0} declares no primary key")]
    EmptyPrimaryKey(String),

    /// A property name is declared twice.
    #[error("property {property} declared twice in {schema}")]
    DuplicateProperty {
        /// Type name.
        schema: String,
        /// Property name.
        property: String,
    },

    /// A key refers to an undeclared property.
    #[error("key {key} of {schema} refers to unknown property {property}")]
    UnknownProperty {
        /// Type name.
        schema: String,
        /// Key name.
        key: String,
        /// Property name.
        property: String,
    },

    /// A property of this kind cannot take the requested role.
    #[error("property {property} of {schema} cannot be used as {role}")]
    InvalidRole {
        /// Type name.
        schema: String,
        /// Property name.
        property: String,
        /// The rejected role.
        role: &'static str,
    },
}

/// Kind of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Integer,
    /// UTF-8 text.
    Text,
    /// Inline bytes.
    Bytes,
    /// Binary large object.
    Blob,
    /// Character large object.
    Clob,
}

impl PropertyKind {
    /// Returns true if `value` may be stored in a property of this kind.
    /// Nullability is checked separately.
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (PropertyKind::Bool, Value::Bool(_))
                | (PropertyKind::Integer, Value::Integer(_))
                | (PropertyKind::Text, Value::Text(_))
                | (PropertyKind::Bytes, Value::Bytes(_))
                | (PropertyKind::Blob, Value::Blob(_))
                | (PropertyKind::Clob, Value::Clob(_))
        )
    }

    /// Returns the large-object flavour, if this is a LOB kind.
    pub fn lob_kind(self) -> Option<LobKind> {
        match self {
            PropertyKind::Blob => Some(LobKind::Binary),
            PropertyKind::Clob => Some(LobKind::Character),
            _ => None,
        }
    }
}

/// Definition of one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDef {
    /// Property name.
    pub name: String,
    /// Property kind.
    pub kind: PropertyKind,
    /// Whether `Null` is allowed.
    pub nullable: bool,
    /// Whether the property may be missing from the master store, in which
    /// case only the replica retains it.
    pub independent: bool,
    /// Name of the sequence that generates values on insert, if any.
    pub sequence: Option<String>,
}

/// A named unique key other than the primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateKey {
    /// Constraint name.
    pub name: String,
    /// Indexes of the key properties.
    pub properties: Vec<usize>,
}

/// A user-declared record type.
#[derive(Debug, PartialEq, Eq)]
pub struct Schema {
    name: String,
    properties: Vec<PropertyDef>,
    primary_key: Vec<usize>,
    alternate_keys: Vec<AlternateKey>,
    version: Option<usize>,
    authoritative: bool,
    independent: bool,
}

impl Schema {
    /// Starts building a type named `name`.
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name)
    }

    /// Returns the type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns all property definitions in declaration order.
    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    /// Returns the property at `index`.
    pub fn property(&self, index: usize) -> &PropertyDef {
        &self.properties[index]
    }

    /// Returns the number of properties.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Returns the index of the property called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Returns the primary key property indexes.
    pub fn primary_key(&self) -> &[usize] {
        &self.primary_key
    }

    /// Returns true if `index` is part of the primary key.
    pub fn is_primary_key(&self, index: usize) -> bool {
        self.primary_key.contains(&index)
    }

    /// Returns the alternate keys.
    pub fn alternate_keys(&self) -> &[AlternateKey] {
        &self.alternate_keys
    }

    /// Returns the version property index, if the type is versioned.
    pub fn version(&self) -> Option<usize> {
        self.version
    }

    /// Returns true if the master alone is authoritative for this type.
    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    /// Returns true if the type may be missing from the master store.
    pub fn is_independent(&self) -> bool {
        self.independent
    }

    /// Returns the indexes of large-object properties of the given flavour.
    pub fn lob_properties(&self, kind: LobKind) -> Vec<usize> {
        self.properties
            .iter()
            .enumerate()
            .filter(|(_, p)| p.kind.lob_kind() == Some(kind))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Builder for [`Schema`].
#[derive(Debug)]
pub struct SchemaBuilder {
    name: String,
    properties: Vec<PropertyDef>,
    primary_key: Vec<String>,
    alternate_keys: Vec<(String, Vec<String>)>,
    version: Option<String>,
    authoritative: bool,
    independent: bool,
}

impl SchemaBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            primary_key: Vec::new(),
            alternate_keys: Vec::new(),
            version: None,
            authoritative: false,
            independent: false,
        }
    }

    fn push(mut self, name: &str, kind: PropertyKind, nullable: bool, independent: bool) -> Self {
        self.properties.push(PropertyDef {
            name: name.to_owned(),
            kind,
            nullable,
            independent,
            sequence: None,
        });
        self
    }

    /// Adds a non-null primary key property.
    pub fn key(mut self, name: &str, kind: PropertyKind) -> Self {
        self.primary_key.push(name.to_owned());
        self.push(name, kind, false, false)
    }

    /// Adds an integer primary key property generated from `sequence` when
    /// not supplied on insert.
    pub fn sequence_key(mut self, name: &str, sequence: &str) -> Self {
        self = self.key(name, PropertyKind::Integer);
        if let Some(p) = self.properties.last_mut() {
            p.sequence = Some(sequence.to_owned());
        }
        self
    }

    /// Adds a nullable property.
    pub fn property(self, name: &str, kind: PropertyKind) -> Self {
        self.push(name, kind, true, false)
    }

    /// Adds a non-null property.
    pub fn required(self, name: &str, kind: PropertyKind) -> Self {
        self.push(name, kind, false, false)
    }

    /// Adds a nullable property that the master store may not support.
    pub fn independent_property(self, name: &str, kind: PropertyKind) -> Self {
        self.push(name, kind, true, true)
    }

    /// Adds the integer version property used for optimistic locking.
    pub fn version(mut self, name: &str) -> Self {
        self.version = Some(name.to_owned());
        self.push(name, PropertyKind::Integer, true, false)
    }

    /// Declares a unique alternate key over existing properties.
    pub fn alternate_key(mut self, name: &str, properties: &[&str]) -> Self {
        self.alternate_keys.push((
            name.to_owned(),
            properties.iter().map(|p| (*p).to_owned()).collect(),
        ));
        self
    }

    /// Marks the type as authoritative: storage comes straight from the
    /// master without replication.
    pub fn authoritative(mut self) -> Self {
        self.authoritative = true;
        self
    }

    /// Marks the type as independent: the master may lack it entirely.
    pub fn independent(mut self) -> Self {
        self.independent = true;
        self
    }

    /// Validates and builds the schema.
    pub fn build(self) -> Result<Arc<Schema>, SchemaError> {
        let mut seen = HashSet::new();
        for p in &self.properties {
            if !seen.insert(p.name.as_str()) {
                return Err(SchemaError::DuplicateProperty {
                    schema: self.name.clone(),
                    property: p.name.clone(),
                });
            }
        }
        if self.primary_key.is_empty() {
            return Err(SchemaError::EmptyPrimaryKey(self.name));
        }

        let resolve = |key: &str, names: &[String]| -> Result<Vec<usize>, SchemaError> {
            names
                .iter()
                .map(|n| {
                    let index = self
                        .properties
                        .iter()
                        .position(|p| &p.name == n)
                        .ok_or_else(|| SchemaError::UnknownProperty {
                            schema: self.name.clone(),
                            key: key.to_owned(),
                            property: n.clone(),
                        })?;
                    let def = &self.properties[index];
                    if def.kind.lob_kind().is_some() || def.independent {
                        return Err(SchemaError::InvalidRole {
                            schema: self.name.clone(),
                            property: n.clone(),
                            role: "a key",
                        });
                    }
                    Ok(index)
                })
                .collect()
        };

        let primary_key = resolve("primary", &self.primary_key)?;
        let alternate_keys = self
            .alternate_keys
            .iter()
            .map(|(name, props)| {
                Ok(AlternateKey {
                    name: name.clone(),
                    properties: resolve(name, props)?,
                })
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;
        let version = self
            .version
            .as_deref()
            .and_then(|v| self.properties.iter().position(|p| p.name == v));

        Ok(Arc::new(Schema {
            name: self.name,
            properties: self.properties,
            primary_key,
            alternate_keys,
            version,
            authoritative: self.authoritative,
            independent: self.independent,
        }))
    }
}
