//! Model declarations and resolved model metadata.
//!
//! A model is declared as a [`ModelDef`]: a name, a table, an ordered list of
//! [`FieldDef`]s and optional mixin [`FieldGroup`]s. The
//! [`RegistryBuilder`](crate::registry::RegistryBuilder) resolves all
//! declarations together into immutable [`ModelMeta`] records: relation
//! targets are checked, implicit `{fk}_id` source fields and reverse
//! relations are added, and many-to-many junction tables are named.
//!
//! Queries only ever read `ModelMeta`.

use std::collections::HashMap;

use terrapin_core::OrmResult;

use crate::fields::{FieldDef, FieldType, OnDelete};
use crate::record::Record;
use crate::value::Value;

/// A reusable group of fields that several models can mix in.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldGroup {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl FieldGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }
}

/// Declaration of a model.
///
/// Field precedence when the same name appears more than once: the model's own
/// fields win, then mixins from left to right.
///
/// # Examples
///
/// ```
/// use terrapin_db::fields::{FieldDef, FieldType};
/// use terrapin_db::model::{FieldGroup, ModelDef};
///
/// let timestamps = FieldGroup::new("Timestamps")
///     .field(FieldDef::new("created", FieldType::DatetimeField).nullable());
///
/// let def = ModelDef::new("Tournament")
///     .field(FieldDef::new("id", FieldType::IntField).primary_key())
///     .field(FieldDef::new("name", FieldType::CharField { max_length: 255 }))
///     .mixin(timestamps)
///     .ordering(["name"]);
/// assert_eq!(def.table, "tournament");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDef {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldDef>,
    pub mixins: Vec<FieldGroup>,
    /// Default ordering, `-` prefix for descending.
    pub ordering: Vec<String>,
    pub unique_together: Vec<Vec<String>>,
    pub indexes: Vec<Vec<String>>,
    /// Table comment emitted in DDL.
    pub description: Option<String>,
}

impl ModelDef {
    /// Creates a declaration; the table defaults to the lowercased name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.to_lowercase(),
            name,
            fields: Vec::new(),
            mixins: Vec::new(),
            ordering: Vec::new(),
            unique_together: Vec::new(),
            indexes: Vec::new(),
            description: None,
        }
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn mixin(mut self, group: FieldGroup) -> Self {
        self.mixins.push(group);
        self
    }

    #[must_use]
    pub fn ordering<I, S>(mut self, ordering: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordering = ordering.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn unique_together<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_together
            .push(fields.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn index<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes.push(fields.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// All declared fields after applying mixin precedence.
    pub fn flattened_fields(&self) -> Vec<FieldDef> {
        let mut seen: Vec<&str> = Vec::new();
        let mut out = Vec::new();
        let sources = std::iter::once(&self.fields).chain(self.mixins.iter().map(|m| &m.fields));
        for fields in sources {
            for field in fields {
                if !seen.contains(&field.name.as_str()) {
                    seen.push(&field.name);
                    out.push(field.clone());
                }
            }
        }
        out
    }
}

/// Resolved relation between two models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationMeta {
    /// The model on the other side.
    pub target: String,
    /// Name of the data field holding the key. For forward relations it lives
    /// on this model, for backward relations on `target`.
    pub source_field: String,
    /// Name of the matching relation on the other side.
    pub related_name: String,
    pub on_delete: OnDelete,
}

/// Resolved many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManyToManyMeta {
    pub target: String,
    /// Junction table.
    pub through: String,
    /// Junction column pointing at `target`.
    pub forward_key: String,
    /// Junction column pointing at this model.
    pub backward_key: String,
    /// Name of the matching relation on the other side.
    pub related_name: String,
    /// `true` on the side that declared the field (owns the junction DDL).
    pub declared: bool,
}

/// What a resolved field is.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// A plain column.
    Data(FieldType),
    ForeignKey(RelationMeta),
    OneToOne(RelationMeta),
    BackwardForeignKey(RelationMeta),
    BackwardOneToOne(RelationMeta),
    ManyToMany(ManyToManyMeta),
}

impl FieldKind {
    pub const fn is_relation(&self) -> bool {
        !matches!(self, Self::Data(_))
    }

    /// Relations whose terminal use needs a nested field.
    pub const fn is_many(&self) -> bool {
        matches!(
            self,
            Self::BackwardForeignKey(_) | Self::BackwardOneToOne(_) | Self::ManyToMany(_)
        )
    }

    /// The other model of a relation.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Data(_) => None,
            Self::ForeignKey(r)
            | Self::OneToOne(r)
            | Self::BackwardForeignKey(r)
            | Self::BackwardOneToOne(r) => Some(&r.target),
            Self::ManyToMany(m) => Some(&m.target),
        }
    }
}

/// A resolved field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMeta {
    pub name: String,
    /// `None` for relation pseudo-fields.
    pub column: Option<String>,
    pub kind: FieldKind,
    pub primary_key: bool,
    pub generated: bool,
    pub null: bool,
    pub unique: bool,
    pub index: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl FieldMeta {
    pub(crate) fn data(def: &FieldDef) -> Self {
        Self {
            name: def.name.clone(),
            column: Some(def.column.clone()),
            kind: FieldKind::Data(def.field_type.clone()),
            primary_key: def.primary_key,
            generated: def.generated,
            null: def.null,
            unique: def.unique,
            index: def.index,
            default: def.default.clone(),
            description: def.description.clone(),
        }
    }

    pub(crate) fn relation(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            column: None,
            kind,
            primary_key: false,
            generated: false,
            null: true,
            unique: false,
            index: false,
            default: None,
            description: None,
        }
    }

    /// The storage type of a data field.
    pub const fn field_type(&self) -> Option<&FieldType> {
        match &self.kind {
            FieldKind::Data(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        self.field_type().is_some_and(FieldType::is_text)
    }
}

/// Immutable metadata of one registered model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMeta {
    pub name: String,
    pub table: String,
    /// Name of the primary-key field.
    pub pk_attr: String,
    pub ordering: Vec<String>,
    pub unique_together: Vec<Vec<String>>,
    pub indexes: Vec<Vec<String>>,
    pub description: Option<String>,
    fields: Vec<FieldMeta>,
    by_name: HashMap<String, usize>,
}

impl ModelMeta {
    pub(crate) fn new(def: &ModelDef, pk_attr: String, fields: Vec<FieldMeta>) -> Self {
        let by_name = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            name: def.name.clone(),
            table: def.table.clone(),
            pk_attr,
            ordering: def.ordering.clone(),
            unique_together: def.unique_together.clone(),
            indexes: def.indexes.clone(),
            description: def.description.clone(),
            fields,
            by_name,
        }
    }

    /// Looks a field up by name; `pk` aliases the primary key.
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        let name = if name == "pk" { self.pk_attr.as_str() } else { name };
        self.by_name.get(name).and_then(|&i| self.fields.get(i))
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// All fields in declaration order.
    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    /// Fields backed by a column, in declaration order.
    pub fn data_fields(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields.iter().filter(|f| f.column.is_some())
    }

    /// Relation pseudo-fields.
    pub fn relations(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields.iter().filter(|f| f.kind.is_relation())
    }

    pub fn pk_field(&self) -> Option<&FieldMeta> {
        self.field(&self.pk_attr)
    }

    /// Column of the primary key.
    pub fn pk_column(&self) -> &str {
        self.pk_field()
            .and_then(|f| f.column.as_deref())
            .unwrap_or(&self.pk_attr)
    }

    /// Column backing a data field.
    pub fn column_of(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(|f| f.column.as_deref())
    }

    pub(crate) fn push_field(&mut self, field: FieldMeta) {
        self.by_name.insert(field.name.clone(), self.fields.len());
        self.fields.push(field);
    }
}

/// A Rust type backed by a registered model.
///
/// Implement this to map fetched [`Record`]s into typed structs with
/// [`QuerySet::all_as`](crate::query::QuerySet::all_as).
///
/// ```
/// use terrapin_core::OrmResult;
/// use terrapin_db::fields::{FieldDef, FieldType};
/// use terrapin_db::model::{Model, ModelDef};
/// use terrapin_db::record::Record;
///
/// struct Team {
///     id: i64,
///     name: String,
/// }
///
/// impl Model for Team {
///     fn model_name() -> &'static str {
///         "Team"
///     }
///
///     fn definition() -> ModelDef {
///         ModelDef::new("Team")
///             .field(FieldDef::new("id", FieldType::IntField).primary_key())
///             .field(FieldDef::new("name", FieldType::TextField))
///     }
///
///     fn from_record(record: &Record) -> OrmResult<Self> {
///         Ok(Self {
///             id: record.get_as("id")?,
///             name: record.get_as("name")?,
///         })
///     }
/// }
/// ```
pub trait Model: Sized + Send + Sync {
    /// Name the model is registered under.
    fn model_name() -> &'static str;

    /// The declaration registered by [`RegistryBuilder::model`](crate::registry::RegistryBuilder::model).
    fn definition() -> ModelDef;

    fn from_record(record: &Record) -> OrmResult<Self>;
}
