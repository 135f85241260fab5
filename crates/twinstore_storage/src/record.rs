//! Dynamic records.
//!
//! A [`Record`] holds one value and one [`PropertyState`] per property of
//! its [`Schema`]. Records are always seen through a store's
//! [`RecordLayout`], which marks the properties that store can represent.
//! The `copy_*` family moves values between records of the same type that
//! belong to different stores; properties unsupported on either side are
//! skipped, which is how replica-only (independent) values survive a copy
//! from the master.

use crate::error::{PersistError, PersistResult};
use crate::lob::LobRef;
use crate::schema::Schema;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Dirty-state of a single property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyState {
    /// Never assigned or loaded.
    Uninitialized,
    /// Matches what the store holds.
    Clean,
    /// Assigned since the last load or write.
    Dirty,
}

/// A schema as seen by one store.
#[derive(Debug, PartialEq, Eq)]
pub struct RecordLayout {
    schema: Arc<Schema>,
    supported: Vec<bool>,
}

impl RecordLayout {
    /// Creates a layout supporting every property.
    pub fn new(schema: Arc<Schema>) -> Arc<Self> {
        let supported = vec![true; schema.len()];
        Arc::new(Self { schema, supported })
    }

    /// Creates a layout that lacks the named properties. Only independent
    /// properties may be left out; other names are ignored.
    pub fn with_unsupported(schema: Arc<Schema>, unsupported: &[String]) -> Arc<Self> {
        let supported = schema
            .properties()
            .iter()
            .map(|p| !(p.independent && unsupported.iter().any(|u| u == &p.name)))
            .collect();
        Arc::new(Self { schema, supported })
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Returns true if the property at `index` is supported.
    pub fn is_supported(&self, index: usize) -> bool {
        self.supported.get(index).copied().unwrap_or(false)
    }
}

/// An instance of a record type.
#[derive(Clone)]
pub struct Record {
    layout: Arc<RecordLayout>,
    values: Vec<Value>,
    states: Vec<PropertyState>,
}

impl Record {
    /// Creates a blank record with every property uninitialized.
    pub fn new(layout: Arc<RecordLayout>) -> Self {
        let n = layout.schema.len();
        Self {
            layout,
            values: vec![Value::Null; n],
            states: vec![PropertyState::Uninitialized; n],
        }
    }

    /// Returns the record type.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.layout.schema
    }

    /// Returns the layout of the owning store.
    pub fn layout(&self) -> &Arc<RecordLayout> {
        &self.layout
    }

    /// Returns the value of the named property, or `None` if the property
    /// does not exist.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schema().index_of(name).map(|i| &self.values[i])
    }

    /// Returns the value at `index`.
    pub fn value(&self, index: usize) -> &Value {
        &self.values[index]
    }

    /// Returns all values in declaration order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns the state of the property at `index`.
    pub fn state(&self, index: usize) -> PropertyState {
        self.states[index]
    }

    /// Returns the state of the named property.
    pub fn state_of(&self, name: &str) -> Option<PropertyState> {
        self.schema().index_of(name).map(|i| self.states[i])
    }

    /// Assigns the named property and marks it dirty.
    ///
    /// # Errors
    ///
    /// Fails if the property is unknown, unsupported by this store, of a
    /// different kind, or not nullable and `value` is null.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> PersistResult<()> {
        let index = self.schema().index_of(name).ok_or_else(|| {
            PersistError::Unsupported(format!("{} has no property {name}", self.schema().name()))
        })?;
        self.set_at(index, value.into())
    }

    /// Assigns the property at `index` and marks it dirty.
    pub fn set_at(&mut self, index: usize, value: Value) -> PersistResult<()> {
        let def = self.schema().property(index);
        if !self.layout.is_supported(index) {
            return Err(PersistError::Unsupported(format!(
                "property {} is not supported by this store",
                def.name
            )));
        }
        if !def.kind.accepts(&value) || (value.is_null() && !def.nullable) {
            return Err(PersistError::Unsupported(format!(
                "value {value} is not valid for property {}",
                def.name
            )));
        }
        self.values[index] = value;
        self.states[index] = PropertyState::Dirty;
        Ok(())
    }

    /// Builder-style assignment for constructing records in one expression.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> PersistResult<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Loads a value with the given state without validation. Used by
    /// stores when materializing rows.
    pub fn load_at(&mut self, index: usize, value: Value, state: PropertyState) {
        self.values[index] = value;
        self.states[index] = state;
    }

    /// Swaps the large-object handle at `index`, keeping the property state.
    pub fn replace_lob(&mut self, index: usize, lob: LobRef) {
        self.values[index] = match self.values[index] {
            Value::Clob(_) => Value::Clob(lob),
            _ => Value::Blob(lob),
        };
    }

    fn copy_at(&self, index: usize, target: &mut Record, state: PropertyState) -> bool {
        if self.states[index] == PropertyState::Uninitialized
            || !self.layout.is_supported(index)
            || !target.layout.is_supported(index)
        {
            return false;
        }
        target.values[index] = self.values[index].clone();
        target.states[index] = state;
        true
    }

    fn debug_check_type(&self, other: &Record) {
        debug_assert_eq!(
            self.schema().name(),
            other.schema().name(),
            "records of different types"
        );
    }

    /// Copies every initialized property supported on both sides. Copied
    /// properties take the source's state.
    pub fn copy_all_properties(&self, target: &mut Record) {
        self.debug_check_type(target);
        for i in 0..self.values.len() {
            self.copy_at(i, target, self.states[i]);
        }
    }

    /// Makes the target mirror this record on every property supported on
    /// both sides. Properties uninitialized here are cleared to null in the
    /// target; properties this store lacks keep the target's value. Every
    /// mirrored property is marked dirty.
    pub fn mirror_supported_properties(&self, target: &mut Record) {
        self.debug_check_type(target);
        for i in 0..self.values.len() {
            if !self.layout.is_supported(i) || !target.layout.is_supported(i) {
                continue;
            }
            target.values[i] = match self.states[i] {
                PropertyState::Uninitialized => Value::Null,
                _ => self.values[i].clone(),
            };
            target.states[i] = PropertyState::Dirty;
        }
    }

    /// Copies the primary key properties.
    pub fn copy_primary_key_properties(&self, target: &mut Record) {
        self.debug_check_type(target);
        for &i in self.schema().primary_key() {
            self.copy_at(i, target, self.states[i]);
        }
    }

    /// Copies the version property, if the type has one.
    pub fn copy_version_property(&self, target: &mut Record) {
        self.debug_check_type(target);
        if let Some(i) = self.schema().version() {
            self.copy_at(i, target, self.states[i]);
        }
    }

    /// Copies the dirty properties; they stay dirty in the target.
    pub fn copy_dirty_properties(&self, target: &mut Record) {
        self.debug_check_type(target);
        for i in 0..self.values.len() {
            if self.states[i] == PropertyState::Dirty {
                self.copy_at(i, target, PropertyState::Dirty);
            }
        }
    }

    /// Copies the initialized properties whose value differs from the
    /// target's. Copied properties are marked dirty in the target.
    pub fn copy_unequal_properties(&self, target: &mut Record) {
        self.debug_check_type(target);
        for i in 0..self.values.len() {
            if !self.values[i].content_eq(&target.values[i]) {
                self.copy_at(i, target, PropertyState::Dirty);
            }
        }
    }

    /// Returns true if every property supported on both sides holds an
    /// equal value. Large objects compare by content.
    pub fn equal_properties(&self, other: &Record) -> bool {
        if self.schema().name() != other.schema().name() {
            return false;
        }
        (0..self.values.len()).all(|i| {
            !self.layout.is_supported(i)
                || !other.layout.is_supported(i)
                || self.values[i].content_eq(&other.values[i])
        })
    }

    /// Returns true if both records carry the same primary key.
    pub fn equal_primary_keys(&self, other: &Record) -> bool {
        self.schema()
            .primary_key()
            .iter()
            .all(|&i| self.values[i] == other.values[i])
    }

    /// Returns true if any property is dirty.
    pub fn has_dirty_properties(&self) -> bool {
        self.states.contains(&PropertyState::Dirty)
    }

    /// Marks every initialized property clean.
    pub fn mark_properties_clean(&mut self) {
        for s in &mut self.states {
            if *s == PropertyState::Dirty {
                *s = PropertyState::Clean;
            }
        }
    }

    /// Marks every initialized property dirty.
    pub fn mark_all_properties_dirty(&mut self) {
        for s in &mut self.states {
            if *s == PropertyState::Clean {
                *s = PropertyState::Dirty;
            }
        }
    }

    /// Returns true if the named property is supported by this store.
    pub fn is_property_supported(&self, name: &str) -> bool {
        self.schema()
            .index_of(name)
            .is_some_and(|i| self.layout.is_supported(i))
    }

    /// Returns true if every primary key property is initialized.
    pub fn is_primary_key_initialized(&self) -> bool {
        self.schema()
            .primary_key()
            .iter()
            .all(|&i| self.states[i] != PropertyState::Uninitialized)
    }

    /// Returns the current version number, if the type is versioned and
    /// the version is set.
    pub fn version(&self) -> Option<i64> {
        self.schema()
            .version()
            .and_then(|i| self.values[i].as_integer())
    }

    /// Returns the primary key values in key order.
    pub fn key_values(&self) -> Vec<Value> {
        self.schema()
            .primary_key()
            .iter()
            .map(|&i| self.values[i].clone())
            .collect()
    }

    /// Renders only the type name and primary key, for logging without
    /// dumping record payloads.
    pub fn to_string_key_only(&self) -> String {
        let schema = self.schema();
        let mut out = format!("{}{{", schema.name());
        for (n, &i) in schema.primary_key().iter().enumerate() {
            if n > 0 {
                out.push_str(", ");
            }
            out.push_str(&format!("{}={}", schema.property(i).name, self.values[i]));
        }
        out.push('}');
        out
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let schema = self.schema();
        let mut map = f.debug_map();
        for (i, p) in schema.properties().iter().enumerate() {
            if self.states[i] != PropertyState::Uninitialized {
                map.entry(&p.name, &self.values[i]);
            }
        }
        map.finish()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let schema = self.schema();
        write!(f, "{}{{", schema.name())?;
        let mut first = true;
        for (i, p) in schema.properties().iter().enumerate() {
            if self.states[i] == PropertyState::Uninitialized {
                continue;
            }
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}={}", p.name, self.values[i])?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PropertyKind;

    fn schema() -> Arc<Schema> {
        Schema::builder("Item")
            .key("id", PropertyKind::Integer)
            .property("name", PropertyKind::Text)
            .independent_property("local_note", PropertyKind::Text)
            .version("version")
            .build()
            .unwrap()
    }

    fn full() -> Arc<RecordLayout> {
        RecordLayout::new(schema())
    }

    #[test]
    fn set_validates_kind_and_support() {
        let mut r = Record::new(full());
        assert!(r.set("id", 1).is_ok());
        assert!(r.set("id", "x").is_err());
        assert!(r.set("id", Value::Null).is_err());
        assert!(r.set("missing", 1).is_err());

        let partial = RecordLayout::with_unsupported(schema(), &["local_note".into()]);
        let mut m = Record::new(partial);
        assert!(m.set("local_note", "x").is_err());
        assert!(!m.is_property_supported("local_note"));
    }

    #[test]
    fn copy_all_skips_unsupported_and_uninitialized() {
        let layout = full();
        let master_layout = RecordLayout::with_unsupported(schema(), &["local_note".into()]);

        let replica = Record::new(Arc::clone(&layout))
            .with("id", 7)
            .unwrap()
            .with("local_note", "mine")
            .unwrap();
        let mut master = Record::new(master_layout);
        replica.copy_all_properties(&mut master);
        assert_eq!(master.get("id"), Some(&Value::Integer(7)));
        assert_eq!(master.state_of("name"), Some(PropertyState::Uninitialized));
        assert_eq!(master.get("local_note"), Some(&Value::Null));

        master.set("name", "n").unwrap();
        let mut back = Record::new(layout).with("local_note", "kept").unwrap();
        master.copy_all_properties(&mut back);
        assert_eq!(back.get("local_note"), Some(&Value::Text("kept".into())));
        assert_eq!(back.get("name"), Some(&Value::Text("n".into())));
    }

    #[test]
    fn mirror_clears_properties_the_source_never_set() {
        let master_layout = RecordLayout::with_unsupported(schema(), &["local_note".into()]);
        let master = Record::new(master_layout).with("id", 4).unwrap();
        let mut replica = Record::new(full())
            .with("id", 4)
            .unwrap()
            .with("name", "tampered")
            .unwrap()
            .with("local_note", "kept")
            .unwrap();
        replica.mark_properties_clean();

        master.mirror_supported_properties(&mut replica);
        assert_eq!(replica.get("name"), Some(&Value::Null));
        assert_eq!(replica.state_of("name"), Some(PropertyState::Dirty));
        assert_eq!(replica.get("local_note"), Some(&Value::Text("kept".into())));
        assert_eq!(replica.state_of("local_note"), Some(PropertyState::Clean));
        assert!(replica.equal_properties(&master));
    }

    #[test]
    fn copy_dirty_and_unequal() {
        let mut a = Record::new(full()).with("id", 1).unwrap();
        a.mark_properties_clean();
        a.set("name", "x").unwrap();

        let mut b = Record::new(full());
        a.copy_dirty_properties(&mut b);
        assert_eq!(b.state_of("id"), Some(PropertyState::Uninitialized));
        assert_eq!(b.state_of("name"), Some(PropertyState::Dirty));

        let mut c = Record::new(full()).with("id", 1).unwrap();
        c.mark_properties_clean();
        a.copy_unequal_properties(&mut c);
        assert_eq!(c.state_of("id"), Some(PropertyState::Clean));
        assert_eq!(c.state_of("name"), Some(PropertyState::Dirty));
    }

    #[test]
    fn equality_ignores_unsupported() {
        let master_layout = RecordLayout::with_unsupported(schema(), &["local_note".into()]);
        let replica = Record::new(full())
            .with("id", 1)
            .unwrap()
            .with("local_note", "only here")
            .unwrap();
        let master = Record::new(master_layout).with("id", 1).unwrap();
        assert!(replica.equal_properties(&master));

        let other = Record::new(full()).with("id", 2).unwrap();
        assert!(!replica.equal_properties(&other));
        assert!(!replica.equal_primary_keys(&other));
    }

    #[test]
    fn dirty_state_transitions() {
        let mut r = Record::new(full()).with("id", 1).unwrap();
        assert!(r.has_dirty_properties());
        r.mark_properties_clean();
        assert!(!r.has_dirty_properties());
        r.mark_all_properties_dirty();
        assert_eq!(r.state_of("id"), Some(PropertyState::Dirty));
        assert_eq!(r.state_of("name"), Some(PropertyState::Uninitialized));
    }

    #[test]
    fn key_only_rendering() {
        let r = Record::new(full())
            .with("id", 3)
            .unwrap()
            .with("name", "secret")
            .unwrap();
        assert_eq!(r.to_string_key_only(), "Item{id=3}");
        assert_eq!(r.to_string(), "Item{id=3, name=\"secret\"}");
    }
}
