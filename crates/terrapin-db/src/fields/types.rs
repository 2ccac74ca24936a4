//! Field type definitions.
//!
//! [`FieldDef`] is the declaration of one model field as written by the user;
//! the [`Registry`](crate::registry::Registry) turns declarations into
//! resolved [`FieldMeta`](crate::model::FieldMeta) records. Relation fields
//! are declared through [`FieldType::ForeignKey`], [`FieldType::OneToOneField`]
//! and [`FieldType::ManyToManyField`].

use crate::query::compiler::Dialect;
use crate::value::Value;

/// The type of a model field, determining its SQL column type.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    /// 32-bit integer. Generated when used as the primary key.
    IntField,
    /// 64-bit integer. Generated when used as the primary key.
    BigIntField,
    /// 16-bit integer.
    SmallIntField,
    /// Bounded string.
    CharField {
        /// Maximum length in characters.
        max_length: usize,
    },
    /// Unbounded text.
    TextField,
    BooleanField,
    FloatField,
    /// Fixed precision decimal.
    DecimalField {
        /// Total digits.
        max_digits: u32,
        /// Digits after the point.
        decimal_places: u32,
    },
    DateField,
    DatetimeField,
    TimeField,
    UuidField,
    BinaryField,
    JsonField,
    /// Many-to-one relation. The column lives on this model as `{name}_id`.
    ForeignKey {
        /// Name of the referenced model.
        to: String,
        /// Behavior when the referenced row is deleted.
        on_delete: OnDelete,
        /// Name of the reverse accessor on the target model.
        related_name: Option<String>,
    },
    /// Unique many-to-one relation.
    OneToOneField {
        /// Name of the referenced model.
        to: String,
        /// Behavior when the referenced row is deleted.
        on_delete: OnDelete,
        /// Name of the reverse accessor on the target model.
        related_name: Option<String>,
    },
    /// Many-to-many relation through a junction table.
    ManyToManyField {
        /// Name of the related model.
        to: String,
        /// Junction table name, `{table}_{related_table}` when unset.
        through: Option<String>,
        /// Junction column pointing at the related model.
        forward_key: Option<String>,
        /// Junction column pointing at the declaring model.
        backward_key: Option<String>,
        /// Name of the reverse accessor on the related model.
        related_name: Option<String>,
    },
}

/// ON DELETE action of a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OnDelete {
    Cascade,
    Restrict,
    SetNull,
    SetDefault,
    NoAction,
}

impl OnDelete {
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::Restrict => "RESTRICT",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::NoAction => "NO ACTION",
        }
    }
}

impl FieldType {
    /// Returns `true` for the three relation types.
    pub const fn is_relation(&self) -> bool {
        matches!(
            self,
            Self::ForeignKey { .. } | Self::OneToOneField { .. } | Self::ManyToManyField { .. }
        )
    }

    /// Returns `true` for string-backed columns, which compare with LIKE directly.
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::CharField { .. } | Self::TextField)
    }

    /// Returns `true` for integer types that may back a generated primary key.
    pub const fn is_integer(&self) -> bool {
        matches!(self, Self::IntField | Self::BigIntField | Self::SmallIntField)
    }

    /// SQL column type for `dialect`.
    pub fn column_type(&self, dialect: Dialect) -> String {
        match (self, dialect) {
            (Self::IntField, _) => "INT".to_string(),
            (Self::BigIntField, _) => "BIGINT".to_string(),
            (Self::SmallIntField, _) => "SMALLINT".to_string(),
            (Self::CharField { max_length }, _) => format!("VARCHAR({max_length})"),
            (Self::TextField, Dialect::MySQL) => "LONGTEXT".to_string(),
            (Self::TextField, _) => "TEXT".to_string(),
            (Self::BooleanField, Dialect::SQLite) => "INT".to_string(),
            (Self::BooleanField, _) => "BOOL".to_string(),
            (Self::FloatField, Dialect::SQLite) => "REAL".to_string(),
            (Self::FloatField, Dialect::PostgreSQL) => "DOUBLE PRECISION".to_string(),
            (Self::FloatField, Dialect::MySQL) => "DOUBLE".to_string(),
            (Self::DecimalField { .. }, Dialect::SQLite) => "VARCHAR(40)".to_string(),
            (
                Self::DecimalField {
                    max_digits,
                    decimal_places,
                },
                _,
            ) => format!("DECIMAL({max_digits},{decimal_places})"),
            (Self::DateField, _) => "DATE".to_string(),
            (Self::DatetimeField, Dialect::SQLite) => "TIMESTAMP".to_string(),
            (Self::DatetimeField, Dialect::PostgreSQL) => "TIMESTAMPTZ".to_string(),
            (Self::DatetimeField, Dialect::MySQL) => "DATETIME(6)".to_string(),
            (Self::TimeField, Dialect::MySQL) => "TIME(6)".to_string(),
            (Self::TimeField, _) => "TIME".to_string(),
            (Self::UuidField, Dialect::PostgreSQL) => "UUID".to_string(),
            (Self::UuidField, _) => "CHAR(36)".to_string(),
            (Self::BinaryField, Dialect::SQLite) => "BLOB".to_string(),
            (Self::BinaryField, Dialect::PostgreSQL) => "BYTEA".to_string(),
            (Self::BinaryField, Dialect::MySQL) => "LONGBLOB".to_string(),
            (Self::JsonField, Dialect::PostgreSQL) => "JSONB".to_string(),
            (Self::JsonField, _) => "JSON".to_string(),
            // Relations never own a column of their own type.
            (Self::ForeignKey { .. } | Self::OneToOneField { .. } | Self::ManyToManyField { .. }, _) => {
                String::new()
            }
        }
    }

    /// Column definition of a database-generated primary key.
    pub fn generated_pk_sql(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::SQLite => "INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL".to_string(),
            Dialect::PostgreSQL => match self {
                Self::BigIntField => "BIGSERIAL NOT NULL PRIMARY KEY".to_string(),
                Self::SmallIntField => "SMALLSERIAL NOT NULL PRIMARY KEY".to_string(),
                _ => "SERIAL NOT NULL PRIMARY KEY".to_string(),
            },
            Dialect::MySQL => format!(
                "{} NOT NULL PRIMARY KEY AUTO_INCREMENT",
                self.column_type(dialect)
            ),
        }
    }
}

/// Declaration of a single model field.
///
/// # Examples
///
/// ```
/// use terrapin_db::fields::{FieldDef, FieldType};
///
/// let id = FieldDef::new("id", FieldType::IntField).primary_key();
/// assert!(id.generated);
///
/// let name = FieldDef::new("name", FieldType::CharField { max_length: 255 })
///     .unique()
///     .description("Tournament name");
/// assert!(name.unique);
///
/// let fk = FieldDef::foreign_key("tournament", "Tournament").related_name("events");
/// assert!(fk.field_type.is_relation());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Attribute name used in filters and records.
    pub name: String,
    /// Database column name. Defaults to `name`, or `{name}_id` for FK/O2O.
    pub column: String,
    pub field_type: FieldType,
    pub primary_key: bool,
    /// Value is assigned by the database (auto-increment).
    pub generated: bool,
    pub null: bool,
    pub unique: bool,
    /// Creates a single-column index.
    pub index: bool,
    pub default: Option<Value>,
    /// Column comment emitted in DDL.
    pub description: Option<String>,
}

impl FieldDef {
    /// Creates a field with default attributes (non-null, not unique).
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        let column = match field_type {
            FieldType::ForeignKey { .. } | FieldType::OneToOneField { .. } => format!("{name}_id"),
            _ => name.clone(),
        };
        Self {
            name,
            column,
            field_type,
            primary_key: false,
            generated: false,
            null: false,
            unique: false,
            index: false,
            default: None,
            description: None,
        }
    }

    /// Declares a foreign key to `to` with `CASCADE` deletion.
    pub fn foreign_key(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::ForeignKey {
                to: to.into(),
                on_delete: OnDelete::Cascade,
                related_name: None,
            },
        )
    }

    /// Declares a one-to-one relation to `to` with `CASCADE` deletion.
    pub fn one_to_one(name: impl Into<String>, to: impl Into<String>) -> Self {
        let mut field = Self::new(
            name,
            FieldType::OneToOneField {
                to: to.into(),
                on_delete: OnDelete::Cascade,
                related_name: None,
            },
        );
        field.unique = true;
        field
    }

    /// Declares a many-to-many relation to `to`.
    pub fn many_to_many(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::ManyToManyField {
                to: to.into(),
                through: None,
                forward_key: None,
                backward_key: None,
                related_name: None,
            },
        )
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Marks this field as the primary key. Integer keys become generated.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.generated = self.field_type.is_integer();
        self
    }

    /// Overrides whether the database generates the value.
    #[must_use]
    pub const fn generated(mut self, generated: bool) -> Self {
        self.generated = generated;
        self
    }

    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub const fn index(mut self) -> Self {
        self.index = true;
        self
    }

    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// Sets the reverse accessor name of a relation field.
    #[must_use]
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        match &mut self.field_type {
            FieldType::ForeignKey { related_name, .. }
            | FieldType::OneToOneField { related_name, .. }
            | FieldType::ManyToManyField { related_name, .. } => *related_name = Some(name.into()),
            _ => {}
        }
        self
    }

    /// Sets the ON DELETE action of a FK or O2O field.
    #[must_use]
    pub fn on_delete(mut self, action: OnDelete) -> Self {
        if let FieldType::ForeignKey { on_delete, .. } | FieldType::OneToOneField { on_delete, .. } =
            &mut self.field_type
        {
            *on_delete = action;
        }
        self
    }

    /// Sets the junction table of an M2M field.
    #[must_use]
    pub fn through(mut self, table: impl Into<String>) -> Self {
        if let FieldType::ManyToManyField { through, .. } = &mut self.field_type {
            *through = Some(table.into());
        }
        self
    }

    /// Sets the junction key columns of an M2M field.
    #[must_use]
    pub fn junction_keys(mut self, forward: impl Into<String>, backward: impl Into<String>) -> Self {
        if let FieldType::ManyToManyField {
            forward_key,
            backward_key,
            ..
        } = &mut self.field_type
        {
            *forward_key = Some(forward.into());
            *backward_key = Some(backward.into());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let f = FieldDef::new("name", FieldType::TextField);
        assert_eq!(f.column, "name");
        assert!(!f.primary_key);
        assert!(!f.null);
        assert!(f.default.is_none());
    }

    #[test]
    fn test_fk_column_defaults_to_id_suffix() {
        let f = FieldDef::foreign_key("tournament", "Tournament");
        assert_eq!(f.column, "tournament_id");
        assert!(matches!(
            f.field_type,
            FieldType::ForeignKey {
                on_delete: OnDelete::Cascade,
                ..
            }
        ));
    }

    #[test]
    fn test_one_to_one_is_unique() {
        assert!(FieldDef::one_to_one("address", "Address").unique);
    }

    #[test]
    fn test_relation_builders() {
        let f = FieldDef::foreign_key("owner", "User")
            .related_name("things")
            .on_delete(OnDelete::SetNull)
            .nullable();
        match f.field_type {
            FieldType::ForeignKey {
                related_name,
                on_delete,
                ..
            } => {
                assert_eq!(related_name.as_deref(), Some("things"));
                assert_eq!(on_delete, OnDelete::SetNull);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(f.null);
    }

    #[test]
    fn test_m2m_builders() {
        let f = FieldDef::many_to_many("participants", "Team")
            .through("event_team")
            .junction_keys("team_id", "event_id");
        match f.field_type {
            FieldType::ManyToManyField {
                through,
                forward_key,
                backward_key,
                ..
            } => {
                assert_eq!(through.as_deref(), Some("event_team"));
                assert_eq!(forward_key.as_deref(), Some("team_id"));
                assert_eq!(backward_key.as_deref(), Some("event_id"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_primary_key_generated_only_for_integers() {
        assert!(FieldDef::new("id", FieldType::BigIntField).primary_key().generated);
        assert!(!FieldDef::new("id", FieldType::UuidField).primary_key().generated);
    }

    #[test]
    fn test_column_types_per_dialect() {
        let t = FieldType::DatetimeField;
        assert_eq!(t.column_type(Dialect::SQLite), "TIMESTAMP");
        assert_eq!(t.column_type(Dialect::PostgreSQL), "TIMESTAMPTZ");
        assert_eq!(t.column_type(Dialect::MySQL), "DATETIME(6)");
        assert_eq!(
            FieldType::CharField { max_length: 40 }.column_type(Dialect::SQLite),
            "VARCHAR(40)"
        );
    }

    #[test]
    fn test_generated_pk_sql() {
        assert_eq!(
            FieldType::IntField.generated_pk_sql(Dialect::SQLite),
            "INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL"
        );
        assert_eq!(
            FieldType::BigIntField.generated_pk_sql(Dialect::PostgreSQL),
            "BIGSERIAL NOT NULL PRIMARY KEY"
        );
        assert_eq!(
            FieldType::IntField.generated_pk_sql(Dialect::MySQL),
            "INT NOT NULL PRIMARY KEY AUTO_INCREMENT"
        );
    }

    #[test]
    fn test_text_and_integer_classification() {
        assert!(FieldType::TextField.is_text());
        assert!(!FieldType::IntField.is_text());
        assert!(FieldType::SmallIntField.is_integer());
        assert!(!FieldType::FloatField.is_integer());
    }
}
