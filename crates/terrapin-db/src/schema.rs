//! CREATE TABLE generation for every registered model.
//!
//! Tables are emitted so that each one follows the tables its foreign keys
//! reference. The order comes from a depth-first walk over the reference
//! graph: a table is marked in progress before its references are visited and
//! done after its statements are emitted. Reaching an in-progress table again
//! means the foreign keys form a cycle, which cannot be created in one pass.
//! Self-references are not edges. Junction tables of many-to-many fields come
//! last, after every model table.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use terrapin_core::logging::DB_TARGET;
use terrapin_core::{OrmError, OrmResult};

use crate::executor::DbExecutor;
use crate::model::{FieldKind, FieldMeta, ManyToManyMeta, ModelMeta, RelationMeta};
use crate::query::compiler::Dialect;
use crate::registry::Registry;
use crate::value::Value;

/// How DDL is generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaOptions {
    pub dialect: Dialect,
    /// Emit `IF NOT EXISTS` so existing tables are left alone.
    pub safe: bool,
}

impl SchemaOptions {
    pub const fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            safe: false,
        }
    }

    #[must_use]
    pub const fn safe(mut self, safe: bool) -> Self {
        self.safe = safe;
        self
    }

    const fn if_not_exists(self) -> &'static str {
        if self.safe {
            "IF NOT EXISTS "
        } else {
            ""
        }
    }
}

/// Statements of one model table.
#[derive(Debug)]
struct TableSql {
    /// Tables referenced by foreign keys, excluding the table itself.
    references: Vec<String>,
    statements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// `{prefix}_{table}_{fields}_{hash}` with table and fields shortened and a
/// hash of the full names keeping the result unique.
fn index_name(prefix: &str, table: &str, columns: &[&str]) -> String {
    let joined = columns.join("_");
    let digest = Sha256::digest(format!("{table};{}", columns.join(";")).as_bytes());
    let hash: String = digest.iter().take(3).map(|b| format!("{b:02x}")).collect();
    let table: String = table.chars().take(11).collect();
    let fields: String = joined.chars().take(7).collect();
    format!("{prefix}_{table}_{fields}_{hash}")
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn default_sql(value: &Value, dialect: Dialect) -> Option<String> {
    match value {
        Value::Null => Some("NULL".to_string()),
        Value::Bool(b) if dialect == Dialect::SQLite => Some(i32::from(*b).to_string()),
        Value::Bool(b) => Some(if *b { "TRUE" } else { "FALSE" }.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::String(s) => Some(quote_literal(s)),
        _ => None,
    }
}

struct Generator<'a> {
    registry: &'a Registry,
    options: SchemaOptions,
}

impl Generator<'_> {
    fn q(&self, ident: &str) -> String {
        self.options.dialect.quote(ident)
    }

    fn inline_comment(&self, text: Option<&str>) -> String {
        match (text, self.options.dialect) {
            (Some(text), Dialect::SQLite) => format!(" /* {} */", text.replace("*/", "* /")),
            (Some(text), Dialect::MySQL) => format!(" COMMENT {}", quote_literal(text)),
            _ => String::new(),
        }
    }

    /// Column type of the key that references `model`'s primary key.
    fn key_type(&self, model: &ModelMeta) -> OrmResult<String> {
        model
            .pk_field()
            .and_then(FieldMeta::field_type)
            .map(|t| t.column_type(self.options.dialect))
            .ok_or_else(|| {
                OrmError::ConfigurationError(format!(
                    "Model \"{}\" has no primary key column",
                    model.name
                ))
            })
    }

    fn references(&self, rel: &RelationMeta) -> OrmResult<String> {
        let target = self.registry.get(&rel.target)?;
        Ok(format!(
            " REFERENCES {} ({}) ON DELETE {}",
            self.q(&target.table),
            self.q(target.pk_column()),
            rel.on_delete.sql()
        ))
    }

    fn column_sql(
        &self,
        field: &FieldMeta,
        relation: Option<&(RelationMeta, bool)>,
    ) -> OrmResult<Option<String>> {
        let (Some(column), Some(field_type)) = (field.column.as_deref(), field.field_type()) else {
            return Ok(None);
        };
        let dialect = self.options.dialect;
        let mut sql = self.q(column);
        if field.primary_key && field.generated && field_type.is_integer() {
            sql.push(' ');
            sql.push_str(&field_type.generated_pk_sql(dialect));
        } else if field.primary_key {
            sql.push_str(&format!(" {} NOT NULL PRIMARY KEY", field_type.column_type(dialect)));
        } else {
            match relation {
                Some((rel, _)) => {
                    let target = self.registry.get(&rel.target)?;
                    sql.push_str(&format!(" {}", self.key_type(&target)?));
                }
                None => sql.push_str(&format!(" {}", field_type.column_type(dialect))),
            }
            if !field.null {
                sql.push_str(" NOT NULL");
            }
            if let Some(default) = field.default.as_ref().and_then(|v| default_sql(v, dialect)) {
                sql.push_str(&format!(" DEFAULT {default}"));
            }
            if field.unique || relation.is_some_and(|(_, one_to_one)| *one_to_one) {
                sql.push_str(" UNIQUE");
            }
            if let Some((rel, _)) = relation {
                sql.push_str(&self.references(rel)?);
            }
        }
        sql.push_str(&self.inline_comment(field.description.as_deref()));
        Ok(Some(sql))
    }

    fn create_table(&self, model: &ModelMeta) -> OrmResult<TableSql> {
        let dialect = self.options.dialect;
        let table = self.q(&model.table);

        // Data fields that hold a forward key, with whether it is one-to-one.
        let mut keys: HashMap<&str, (RelationMeta, bool)> = HashMap::new();
        let mut references = Vec::new();
        for field in model.relations() {
            let (rel, one_to_one) = match &field.kind {
                FieldKind::ForeignKey(rel) => (rel, false),
                FieldKind::OneToOne(rel) => (rel, true),
                _ => continue,
            };
            let target = self.registry.get(&rel.target)?;
            if target.table != model.table && !references.contains(&target.table) {
                references.push(target.table.clone());
            }
            keys.insert(rel.source_field.as_str(), (rel.clone(), one_to_one));
        }

        let mut parts = Vec::new();
        let mut column_comments = Vec::new();
        for field in model.data_fields() {
            if let Some(sql) = self.column_sql(field, keys.get(field.name.as_str()))? {
                parts.push(sql);
            }
            if let (Dialect::PostgreSQL, Some(text), Some(column)) =
                (dialect, &field.description, &field.column)
            {
                column_comments.push(format!(
                    "COMMENT ON COLUMN {table}.{} IS {};",
                    self.q(column),
                    quote_literal(text)
                ));
            }
        }
        for fields in &model.unique_together {
            let columns = self.columns_of(model, fields)?;
            let quoted: Vec<String> = columns.iter().map(|c| self.q(c)).collect();
            parts.push(format!(
                "CONSTRAINT {} UNIQUE ({})",
                self.q(&index_name("uid", &model.table, &columns)),
                quoted.join(", ")
            ));
        }

        let table_comment = match (dialect, model.description.as_deref()) {
            (Dialect::SQLite, text @ Some(_)) => self.inline_comment(text),
            (Dialect::MySQL, Some(text)) => format!(" COMMENT={}", quote_literal(text)),
            _ => String::new(),
        };
        let mut statements = vec![format!(
            "CREATE TABLE {}{table} (\n    {}\n){table_comment};",
            self.options.if_not_exists(),
            parts.join(",\n    ")
        )];
        if let (Dialect::PostgreSQL, Some(text)) = (dialect, &model.description) {
            statements.push(format!("COMMENT ON TABLE {table} IS {};", quote_literal(text)));
        }
        statements.extend(column_comments);

        let single = model
            .data_fields()
            .filter(|f| f.index && !f.unique && !f.primary_key)
            .map(|f| vec![f.name.clone()]);
        for fields in single.chain(model.indexes.iter().cloned()) {
            let columns = self.columns_of(model, &fields)?;
            statements.push(self.create_index(&model.table, &columns, false));
        }

        Ok(TableSql {
            references,
            statements,
        })
    }

    fn columns_of<'m>(&self, model: &'m ModelMeta, fields: &[String]) -> OrmResult<Vec<&'m str>> {
        fields
            .iter()
            .map(|name| {
                let field = model
                    .field(name)
                    .ok_or_else(|| OrmError::unknown_field(&model.name, name))?;
                match &field.kind {
                    FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => {
                        model.column_of(&rel.source_field)
                    }
                    _ => field.column.as_deref(),
                }
                .ok_or_else(|| {
                    OrmError::ConfigurationError(format!(
                        "\"{name}\" of model \"{}\" has no column to index",
                        model.name
                    ))
                })
            })
            .collect()
    }

    fn create_index(&self, table: &str, columns: &[&str], unique: bool) -> String {
        let (prefix, keyword) = if unique {
            ("uidx", "UNIQUE INDEX")
        } else {
            ("idx", "INDEX")
        };
        // MySQL has no IF NOT EXISTS for indexes.
        let guard = match self.options.dialect {
            Dialect::MySQL => "",
            Dialect::SQLite | Dialect::PostgreSQL => self.options.if_not_exists(),
        };
        let quoted: Vec<String> = columns.iter().map(|c| self.q(c)).collect();
        format!(
            "CREATE {keyword} {guard}{} ON {} ({});",
            self.q(&index_name(prefix, table, columns)),
            self.q(table),
            quoted.join(", ")
        )
    }

    fn junction_table(&self, owner: &ModelMeta, m2m: &ManyToManyMeta) -> OrmResult<Vec<String>> {
        let target = self.registry.get(&m2m.target)?;
        let column = |key: &str, model: &ModelMeta| -> OrmResult<String> {
            Ok(format!(
                "{} {} NOT NULL REFERENCES {} ({}) ON DELETE CASCADE",
                self.q(key),
                self.key_type(model)?,
                self.q(&model.table),
                self.q(model.pk_column())
            ))
        };
        let create = format!(
            "CREATE TABLE {}{} (\n    {},\n    {}\n);",
            self.options.if_not_exists(),
            self.q(&m2m.through),
            column(&m2m.backward_key, owner)?,
            column(&m2m.forward_key, &target)?
        );
        let index = self.create_index(
            &m2m.through,
            &[m2m.backward_key.as_str(), m2m.forward_key.as_str()],
            true,
        );
        Ok(vec![create, index])
    }

    fn visit(
        &self,
        table: &str,
        tables: &HashMap<String, TableSql>,
        marks: &mut HashMap<String, Mark>,
        out: &mut Vec<String>,
    ) -> OrmResult<()> {
        match marks.get(table) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                return Err(OrmError::ConfigurationError(format!(
                    "Can't create schema due to cyclic fk references through table \"{table}\""
                )));
            }
            None => {}
        }
        marks.insert(table.to_string(), Mark::InProgress);
        if let Some(sql) = tables.get(table) {
            for reference in &sql.references {
                self.visit(reference, tables, marks, out)?;
            }
            out.extend(sql.statements.iter().cloned());
        }
        marks.insert(table.to_string(), Mark::Done);
        Ok(())
    }

    fn generate(&self) -> OrmResult<Vec<String>> {
        let mut tables = HashMap::new();
        let mut order = Vec::new();
        let mut junctions = Vec::new();
        for model in self.registry.models() {
            tables.insert(model.table.clone(), self.create_table(model)?);
            order.push(model.table.clone());
            for field in model.relations() {
                if let FieldKind::ManyToMany(m2m) = &field.kind {
                    if m2m.declared {
                        junctions.extend(self.junction_table(model, m2m)?);
                    }
                }
            }
        }

        let mut marks = HashMap::new();
        let mut out = Vec::new();
        for table in &order {
            self.visit(table, &tables, &mut marks, &mut out)?;
        }
        out.extend(junctions);
        Ok(out)
    }
}

/// DDL for every registered model, one statement per line group.
pub fn generate_schema_sql(registry: &Registry, options: SchemaOptions) -> OrmResult<String> {
    let statements = Generator { registry, options }.generate()?;
    Ok(statements.join("\n"))
}

/// Creates every registered table on `db`.
pub async fn generate_schema(db: &dyn DbExecutor, registry: &Registry, safe: bool) -> OrmResult<()> {
    let options = SchemaOptions::new(db.dialect()).safe(safe);
    let script = generate_schema_sql(registry, options)?;
    tracing::debug!(target: DB_TARGET, tables = registry.len(), safe, "generating schema");
    tracing::trace!(target: DB_TARGET, %script, "schema");
    db.execute_script(&script).await
}
