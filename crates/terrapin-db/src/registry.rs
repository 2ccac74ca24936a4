//! Build-time model registry.
//!
//! All models are declared up front and resolved together by
//! [`RegistryBuilder::build`]. Resolution happens in passes:
//!
//! 1. flatten fields (own fields, then mixins left to right) and find the pk
//! 2. resolve forward FK / O2O targets and add implicit `{name}_id` fields
//! 3. add backward relations to the targets
//! 4. name many-to-many junction tables and add the reverse side
//!
//! Any inconsistency is a configuration error; the resulting [`Registry`] is
//! immutable and shared behind an `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use terrapin_core::{OrmError, OrmResult};

use crate::fields::{FieldDef, FieldType};
use crate::model::{
    FieldKind, FieldMeta, ManyToManyMeta, Model, ModelDef, ModelMeta, RelationMeta,
};
use crate::query::QuerySet;

/// Collects model declarations.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    defs: Vec<ModelDef>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a declaration.
    #[must_use]
    pub fn register(mut self, def: ModelDef) -> Self {
        self.defs.push(def);
        self
    }

    /// Adds the declaration of a typed model.
    #[must_use]
    pub fn model<M: Model>(self) -> Self {
        self.register(M::definition())
    }

    /// Resolves every declaration into a [`Registry`].
    pub fn build(self) -> OrmResult<Arc<Registry>> {
        let mut metas: BTreeMap<String, ModelMeta> = BTreeMap::new();
        let mut flattened: Vec<(ModelDef, Vec<FieldDef>)> = Vec::new();

        for def in self.defs {
            if metas.contains_key(&def.name) {
                return Err(OrmError::ConfigurationError(format!(
                    "Model \"{}\" is registered twice",
                    def.name
                )));
            }
            let fields = def.flattened_fields();
            let mut pks = fields.iter().filter(|f| f.primary_key);
            let pk = pks.next().ok_or_else(|| {
                OrmError::ConfigurationError(format!("Model \"{}\" has no primary key", def.name))
            })?;
            if pks.next().is_some() {
                return Err(OrmError::ConfigurationError(format!(
                    "Model \"{}\" has more than one primary key",
                    def.name
                )));
            }
            let data: Vec<FieldMeta> = fields
                .iter()
                .filter(|f| !f.field_type.is_relation())
                .map(FieldMeta::data)
                .collect();
            let meta = ModelMeta::new(&def, pk.name.clone(), data);
            metas.insert(def.name.clone(), meta);
            flattened.push((def, fields));
        }

        for (def, fields) in &flattened {
            for field in fields {
                resolve_relation(&mut metas, def, field)?;
            }
        }

        let models = metas
            .into_iter()
            .map(|(name, meta)| (name, Arc::new(meta)))
            .collect();
        let registry = Registry { models };
        tracing::debug!(models = registry.models.len(), "model registry built");
        Ok(Arc::new(registry))
    }
}

fn target_meta<'a>(
    metas: &'a BTreeMap<String, ModelMeta>,
    owner: &str,
    field: &str,
    to: &str,
) -> OrmResult<&'a ModelMeta> {
    metas.get(to).ok_or_else(|| {
        OrmError::ConfigurationError(format!(
            "Field \"{field}\" of model \"{owner}\" references unknown model \"{to}\""
        ))
    })
}

fn add_backward(
    metas: &mut BTreeMap<String, ModelMeta>,
    target: &str,
    field: FieldMeta,
) -> OrmResult<()> {
    let Some(meta) = metas.get_mut(target) else {
        return Err(OrmError::ConfigurationError(format!(
            "Unknown model \"{target}\""
        )));
    };
    if meta.has_field(&field.name) {
        return Err(OrmError::ConfigurationError(format!(
            "backward relation \"{}\" duplicates in model {target}",
            field.name
        )));
    }
    meta.push_field(field);
    Ok(())
}

/// Errors when `meta` already has a field called `name`.
fn ensure_free(meta: &ModelMeta, name: &str, declared_by: &str) -> OrmResult<()> {
    if meta.has_field(name) {
        return Err(OrmError::ConfigurationError(format!(
            "Field \"{name}\" of relation \"{declared_by}\" duplicates in model {}",
            meta.name
        )));
    }
    Ok(())
}

fn resolve_relation(
    metas: &mut BTreeMap<String, ModelMeta>,
    def: &ModelDef,
    field: &FieldDef,
) -> OrmResult<()> {
    match &field.field_type {
        FieldType::ForeignKey {
            to,
            on_delete,
            related_name,
        }
        | FieldType::OneToOneField {
            to,
            on_delete,
            related_name,
        } => {
            let one_to_one = matches!(field.field_type, FieldType::OneToOneField { .. });
            let target = target_meta(metas, &def.name, &field.name, to)?;
            let key_type = target
                .pk_field()
                .and_then(FieldMeta::field_type)
                .cloned()
                .unwrap_or(FieldType::IntField);
            let backward_name = related_name.clone().unwrap_or_else(|| {
                if one_to_one {
                    def.table.clone()
                } else {
                    format!("{}s", def.table)
                }
            });

            let meta = metas
                .get_mut(&def.name)
                .ok_or_else(|| OrmError::ConfigurationError(format!("Unknown model \"{}\"", def.name)))?;
            ensure_free(meta, &field.name, &field.name)?;
            ensure_free(meta, &field.column, &field.name)?;
            let source = FieldDef::new(field.column.clone(), key_type);
            let mut source = FieldMeta::data(&source);
            source.null = field.null;
            source.unique = one_to_one || field.unique;
            source.index = field.index;
            source.description = field.description.clone();
            meta.push_field(source);
            let source_field = field.column.clone();
            let forward = RelationMeta {
                target: to.clone(),
                source_field: source_field.clone(),
                related_name: backward_name.clone(),
                on_delete: *on_delete,
            };
            let backward = RelationMeta {
                target: def.name.clone(),
                source_field,
                related_name: field.name.clone(),
                on_delete: *on_delete,
            };
            let (forward_kind, backward_kind) = if one_to_one {
                (FieldKind::OneToOne(forward), FieldKind::BackwardOneToOne(backward))
            } else {
                (
                    FieldKind::ForeignKey(forward),
                    FieldKind::BackwardForeignKey(backward),
                )
            };
            let mut forward_meta = FieldMeta::relation(field.name.clone(), forward_kind);
            forward_meta.null = field.null;
            meta.push_field(forward_meta);
            add_backward(metas, to, FieldMeta::relation(backward_name, backward_kind))
        }
        FieldType::ManyToManyField {
            to,
            through,
            forward_key,
            backward_key,
            related_name,
        } => {
            let target = target_meta(metas, &def.name, &field.name, to)?;
            let through = through
                .clone()
                .unwrap_or_else(|| format!("{}_{}", def.table, target.table));
            let backward_key = backward_key
                .clone()
                .unwrap_or_else(|| format!("{}_id", def.table));
            let forward_key = forward_key.clone().unwrap_or_else(|| {
                if to == &def.name {
                    format!("{}_rel_id", target.table)
                } else {
                    format!("{}_id", target.table)
                }
            });
            let backward_name = related_name
                .clone()
                .unwrap_or_else(|| format!("{}s", def.table));

            let forward = ManyToManyMeta {
                target: to.clone(),
                through: through.clone(),
                forward_key: forward_key.clone(),
                backward_key: backward_key.clone(),
                related_name: backward_name.clone(),
                declared: true,
            };
            let reverse = ManyToManyMeta {
                target: def.name.clone(),
                through,
                forward_key: backward_key,
                backward_key: forward_key,
                related_name: field.name.clone(),
                declared: false,
            };
            let meta = metas
                .get_mut(&def.name)
                .ok_or_else(|| OrmError::ConfigurationError(format!("Unknown model \"{}\"", def.name)))?;
            ensure_free(meta, &field.name, &field.name)?;
            meta.push_field(FieldMeta::relation(
                field.name.clone(),
                FieldKind::ManyToMany(forward),
            ));
            add_backward(
                metas,
                to,
                FieldMeta::relation(backward_name, FieldKind::ManyToMany(reverse)),
            )
        }
        _ => Ok(()),
    }
}

/// Immutable set of resolved models.
#[derive(Debug, Default)]
pub struct Registry {
    models: BTreeMap<String, Arc<ModelMeta>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Returns a model by name.
    pub fn get(&self, name: &str) -> OrmResult<Arc<ModelMeta>> {
        self.models.get(name).cloned().ok_or_else(|| {
            OrmError::ConfigurationError(format!("No model with name \"{name}\" registered"))
        })
    }

    /// All models, ordered by name.
    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelMeta>> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Starts a query over the named model.
    pub fn query(self: &Arc<Self>, name: &str) -> OrmResult<QuerySet> {
        let model = self.get(name)?;
        Ok(QuerySet::new(Arc::clone(self), model))
    }

    /// Starts a query over a typed model.
    pub fn objects<M: Model>(self: &Arc<Self>) -> OrmResult<QuerySet> {
        self.query(M::model_name())
    }
}
