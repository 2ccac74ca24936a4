//! Fetched model instances.
//!
//! A [`Record`] holds the column values of one row keyed by field name, plus
//! one [`RelationState`] slot per relation. Relation slots start out
//! `Unloaded`; the prefetch engine moves them through `Loading` to
//! `Loaded`. Reading an unloaded relation is a `NoValuesFetched` error rather
//! than an implicit query; [`Record::related_query`] gives an explicit lazy
//! handle instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use terrapin_core::{OrmError, OrmResult};

use crate::model::{FieldKind, ModelMeta};
use crate::query::{QuerySet, Q};
use crate::registry::Registry;
use crate::row::{FromValue, Row};
use crate::value::Value;

/// Data held by a loaded relation slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// Forward FK, one-to-one and backward one-to-one.
    One(Option<Box<Record>>),
    /// Backward FK and many-to-many.
    Many(Vec<Record>),
}

/// Load state of a relation slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RelationState {
    #[default]
    Unloaded,
    /// A prefetch for this slot is in flight.
    Loading,
    Loaded(Related),
}

/// One fetched row of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    model: Arc<ModelMeta>,
    values: BTreeMap<String, Value>,
    relations: BTreeMap<String, RelationState>,
}

impl Record {
    /// Creates an empty, unsaved record.
    pub fn new(model: Arc<ModelMeta>) -> Self {
        Self {
            model,
            values: BTreeMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Creates an unsaved record from `(field, value)` pairs.
    pub fn with_values<I, K, V>(model: Arc<ModelMeta>, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut record = Self::new(model);
        for (k, v) in values {
            record.set(k, v);
        }
        record
    }

    /// Maps a driver row onto field names. Columns that are not model
    /// columns (annotations) are kept under their own name.
    pub fn from_row(model: Arc<ModelMeta>, row: Row) -> Self {
        let by_column: BTreeMap<&str, &str> = model
            .data_fields()
            .filter_map(|f| f.column.as_deref().map(|c| (c, f.name.as_str())))
            .collect();
        let values = row
            .into_pairs()
            .map(|(column, value)| {
                let name = by_column
                    .get(column.as_str())
                    .map_or(column.clone(), |n| (*n).to_string());
                (name, value)
            })
            .collect();
        Self {
            model,
            values,
            relations: BTreeMap::new(),
        }
    }

    pub fn model(&self) -> &Arc<ModelMeta> {
        &self.model
    }

    pub fn model_name(&self) -> &str {
        &self.model.name
    }

    /// Reads a value; `pk` aliases the primary key.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let name = if name == "pk" { self.model.pk_attr.as_str() } else { name };
        self.values.get(name)
    }

    /// Reads and converts a value.
    pub fn get_as<T: FromValue>(&self, name: &str) -> OrmResult<T> {
        let value = self
            .get(name)
            .ok_or_else(|| OrmError::unknown_field(&self.model.name, name))?;
        T::from_value(value)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let name = if name == "pk" { self.model.pk_attr.clone() } else { name };
        self.values.insert(name, value.into());
    }

    /// Removes a value and returns it.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// The primary key, `None` while unsaved.
    pub fn pk(&self) -> Option<&Value> {
        self.get(&self.model.pk_attr).filter(|v| !v.is_null())
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }

    /// The state of a relation slot; unknown slots are `Unloaded`.
    pub fn relation_state(&self, name: &str) -> &RelationState {
        const UNLOADED: &RelationState = &RelationState::Unloaded;
        self.relations.get(name).unwrap_or(UNLOADED)
    }

    pub fn set_relation(&mut self, name: impl Into<String>, state: RelationState) {
        self.relations.insert(name.into(), state);
    }

    fn loaded(&self, name: &str) -> OrmResult<&Related> {
        match self.relation_state(name) {
            RelationState::Loaded(related) => Ok(related),
            RelationState::Loading => Err(OrmError::NoValuesFetched(format!(
                "Relation \"{name}\" of model \"{}\" is still being fetched",
                self.model.name
            ))),
            RelationState::Unloaded => Err(OrmError::NoValuesFetched(format!(
                "No values were fetched for relation \"{name}\" of model \"{}\", \
                 use prefetch_related() or fetch_related() first",
                self.model.name
            ))),
        }
    }

    /// A loaded single-object relation.
    pub fn related_one(&self, name: &str) -> OrmResult<Option<&Self>> {
        match self.loaded(name)? {
            Related::One(record) => Ok(record.as_deref()),
            Related::Many(_) => Err(OrmError::FieldError(format!(
                "Relation \"{name}\" holds many records"
            ))),
        }
    }

    /// A loaded multi-object relation.
    pub fn related_many(&self, name: &str) -> OrmResult<&[Self]> {
        match self.loaded(name)? {
            Related::Many(records) => Ok(records),
            Related::One(_) => Err(OrmError::FieldError(format!(
                "Relation \"{name}\" holds a single record"
            ))),
        }
    }

    /// A query for the records behind `relation`, scoped to this record.
    pub fn related_query(&self, registry: &Arc<Registry>, relation: &str) -> OrmResult<QuerySet> {
        let field = self
            .model
            .field(relation)
            .ok_or_else(|| OrmError::unknown_field(&self.model.name, relation))?;
        let unsaved = || {
            OrmError::ParamsError(format!(
                "Record of model \"{}\" has no primary key yet",
                self.model.name
            ))
        };
        match &field.kind {
            FieldKind::Data(_) => Err(OrmError::FieldError(format!(
                "\"{relation}\" is not a relation of model \"{}\"",
                self.model.name
            ))),
            FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => {
                let key = self.get(&rel.source_field).cloned().unwrap_or(Value::Null);
                let qs = registry.query(&rel.target)?;
                if key.is_null() {
                    Ok(qs.none())
                } else {
                    Ok(qs.filter(Q::new("pk", key)))
                }
            }
            FieldKind::BackwardForeignKey(rel) | FieldKind::BackwardOneToOne(rel) => {
                let pk = self.pk().cloned().ok_or_else(unsaved)?;
                Ok(registry
                    .query(&rel.target)?
                    .filter(Q::new(rel.source_field.clone(), pk)))
            }
            FieldKind::ManyToMany(m2m) => {
                let pk = self.pk().cloned().ok_or_else(unsaved)?;
                Ok(registry
                    .query(&m2m.target)?
                    .filter(Q::new(format!("{}__pk", m2m.related_name), pk)))
            }
        }
    }
}
