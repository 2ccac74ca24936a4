//! Batched relation loading.
//!
//! Given a batch of fetched records and a list of relation paths, the engine
//! issues one query per relation (never one per record) and fills each
//! record's relation slot:
//!
//! - forward foreign keys and one-to-ones: `pk IN (keys)`, matched by pk
//! - backward foreign keys: `fk IN (pks)`, grouped by fk
//! - backward one-to-ones: as backward foreign keys, one record or none
//! - many-to-many: a join through the junction table that also selects the
//!   owner's key, grouped by it
//!
//! Relations of one batch are fetched concurrently. A path such as
//! `events__participants` loads `events` first and then `participants` on the
//! fetched events, recursively. Slots are `Loading` while the batch is in
//! flight and go back to the state they held before if any fetch fails.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use terrapin_core::logging::DB_TARGET;
use terrapin_core::{OrmError, OrmResult};

use crate::executor::DbExecutor;
use crate::model::{FieldKind, ModelMeta};
use crate::query::lookups::LOOKUP_SEP;
use crate::query::{QuerySet, Q};
use crate::record::{Record, Related, RelationState};
use crate::registry::Registry;
use crate::value::Value;

/// A relation to load for every record of a batch.
///
/// ```
/// use terrapin_db::prefetch::Prefetch;
/// # fn demo(registry: std::sync::Arc<terrapin_db::registry::Registry>) -> terrapin_core::OrmResult<()> {
/// let recent = registry
///     .query("Event")?
///     .filter(terrapin_db::query::Q::new("rating__gte", 3));
/// let tournaments = registry.query("Tournament")?.prefetch_related([
///     Prefetch::new("events").queryset(recent).to_attr("good_events"),
///     Prefetch::new("events__participants"),
/// ]);
/// # let _ = tournaments;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Prefetch {
    relation: String,
    queryset: Option<QuerySet>,
    to_attr: Option<String>,
}

impl Prefetch {
    /// Loads `relation`, a `__`-separated path for nested relations.
    pub fn new(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            queryset: None,
            to_attr: None,
        }
    }

    /// Fetches the last relation of the path through `queryset`, which must
    /// query the related model.
    #[must_use]
    pub fn queryset(mut self, queryset: QuerySet) -> Self {
        self.queryset = Some(queryset);
        self
    }

    /// Stores the loaded records under `name` instead of the relation name.
    #[must_use]
    pub fn to_attr(mut self, name: impl Into<String>) -> Self {
        self.to_attr = Some(name.into());
        self
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }
}

impl From<&str> for Prefetch {
    fn from(relation: &str) -> Self {
        Self::new(relation)
    }
}

impl From<String> for Prefetch {
    fn from(relation: String) -> Self {
        Self::new(relation)
    }
}

/// One relation of one batch.
#[derive(Debug)]
struct RelationPlan {
    relation: String,
    kind: FieldKind,
    /// Slot the result is stored under.
    slot: String,
    queryset: Option<QuerySet>,
    /// Prefetches to run on the fetched records.
    nested: Vec<Prefetch>,
}

impl RelationPlan {
    const fn is_single(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::ForeignKey(_) | FieldKind::OneToOne(_) | FieldKind::BackwardOneToOne(_)
        )
    }

    /// The value a record is matched on: its key column for forward
    /// relations, its pk otherwise.
    fn parent_key<'r>(&self, record: &'r Record) -> Option<&'r Value> {
        match &self.kind {
            FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) => {
                record.get(&rel.source_field).filter(|v| !v.is_null())
            }
            _ => record.pk(),
        }
    }

    fn keys(&self, records: &[Record]) -> Vec<Value> {
        let mut seen = HashSet::new();
        records
            .iter()
            .filter_map(|record| self.parent_key(record))
            .filter(|key| seen.insert(key.group_key()))
            .cloned()
            .collect()
    }
}

/// Groups requests by their first relation. Nested paths become prefetches
/// of that relation's plan.
fn plan(model: &ModelMeta, requests: &[Prefetch]) -> OrmResult<Vec<RelationPlan>> {
    let mut plans: Vec<RelationPlan> = Vec::new();
    for request in requests {
        let (head, rest) = match request.relation.split_once(LOOKUP_SEP) {
            Some((head, rest)) => (head, Some(rest)),
            None => (request.relation.as_str(), None),
        };
        let kind = model
            .field(head)
            .map(|f| &f.kind)
            .filter(|kind| kind.is_relation())
            .ok_or_else(|| {
                OrmError::FieldError(format!(
                    "Relation \"{head}\" for model \"{}\" not found",
                    model.name
                ))
            })?;
        let slot = match (rest, &request.to_attr) {
            (None, Some(attr)) => attr.clone(),
            _ => head.to_string(),
        };

        let index = if let Some(i) = plans
            .iter()
            .position(|p| p.relation == head && p.slot == slot)
        {
            i
        } else {
            plans.push(RelationPlan {
                relation: head.to_string(),
                kind: kind.clone(),
                slot,
                queryset: None,
                nested: Vec::new(),
            });
            plans.len() - 1
        };
        let plan = &mut plans[index];
        match rest {
            None => {
                if request.queryset.is_some() {
                    plan.queryset.clone_from(&request.queryset);
                }
            }
            Some(rest) => plan.nested.push(Prefetch {
                relation: rest.to_string(),
                queryset: request.queryset.clone(),
                to_attr: request.to_attr.clone(),
            }),
        }
    }
    Ok(plans)
}

/// Fetches the related records of one plan, keyed by the parent key they
/// belong to.
async fn fetch_relation(
    db: &dyn DbExecutor,
    registry: &Arc<Registry>,
    model: &ModelMeta,
    plan: &RelationPlan,
    keys: Vec<Value>,
) -> OrmResult<HashMap<String, Vec<Record>>> {
    let mut grouped: HashMap<String, Vec<Record>> = HashMap::new();
    if keys.is_empty() {
        return Ok(grouped);
    }
    let target = plan.kind.target().unwrap_or_default();
    let queryset = match &plan.queryset {
        Some(qs) if qs.model().name != target => {
            return Err(OrmError::ParamsError(format!(
                "Prefetch of \"{}\" on model \"{}\" needs a queryset over \"{target}\", got \"{}\"",
                plan.relation,
                model.name,
                qs.model().name
            )));
        }
        Some(qs) => qs.clone(),
        None => registry.query(target)?,
    }
    .prefetch_related(plan.nested.iter().cloned());

    tracing::debug!(
        target: DB_TARGET,
        model = %model.name,
        relation = %plan.relation,
        keys = keys.len(),
        "prefetch"
    );

    match &plan.kind {
        FieldKind::ForeignKey(_) | FieldKind::OneToOne(_) => {
            let records = queryset
                .filter(Q::new("pk__in", Value::List(keys)))
                .all(db)
                .await?;
            for record in records {
                if let Some(pk) = record.pk() {
                    grouped.entry(pk.group_key()).or_default().push(record);
                }
            }
        }
        FieldKind::BackwardForeignKey(rel) | FieldKind::BackwardOneToOne(rel) => {
            let records = queryset
                .filter(Q::new(
                    format!("{}{LOOKUP_SEP}in", rel.source_field),
                    Value::List(keys),
                ))
                .all(db)
                .await?;
            for record in records {
                if let Some(key) = record.get(&rel.source_field) {
                    grouped.entry(key.group_key()).or_default().push(record);
                }
            }
        }
        FieldKind::ManyToMany(m2m) => {
            let rows = queryset.fetch_m2m(db, m2m, &keys).await?;
            for (owner, record) in rows {
                grouped.entry(owner.group_key()).or_default().push(record);
            }
        }
        FieldKind::Data(_) => {
            return Err(OrmError::FieldError(format!(
                "\"{}\" of model \"{}\" is not a relation",
                plan.relation, model.name
            )));
        }
    }
    Ok(grouped)
}

/// Runs `requests` against a batch of records of one model.
pub(crate) fn prefetch_records<'a>(
    db: &'a dyn DbExecutor,
    registry: &'a Arc<Registry>,
    records: &'a mut [Record],
    requests: &'a [Prefetch],
) -> BoxFuture<'a, OrmResult<()>> {
    Box::pin(async move {
        let Some(first) = records.first() else {
            return Ok(());
        };
        if requests.is_empty() {
            return Ok(());
        }
        let model = Arc::clone(first.model());
        let plans = plan(&model, requests)?;

        let batches: Vec<(&RelationPlan, Vec<Value>)> =
            plans.iter().map(|p| (p, p.keys(records))).collect();
        let previous: Vec<Vec<RelationState>> = records
            .iter_mut()
            .map(|record| {
                plans
                    .iter()
                    .map(|plan| {
                        let before = record.relation_state(&plan.slot).clone();
                        record.set_relation(plan.slot.clone(), RelationState::Loading);
                        before
                    })
                    .collect()
            })
            .collect();

        let fetched = try_join_all(
            batches
                .into_iter()
                .map(|(plan, keys)| fetch_relation(db, registry, &model, plan, keys)),
        )
        .await;
        let groups = match fetched {
            Ok(groups) => groups,
            Err(err) => {
                for (record, states) in records.iter_mut().zip(previous) {
                    for (plan, state) in plans.iter().zip(states) {
                        record.set_relation(plan.slot.clone(), state);
                    }
                }
                return Err(err);
            }
        };

        for (plan, grouped) in plans.iter().zip(groups) {
            for record in records.iter_mut() {
                let group = plan
                    .parent_key(record)
                    .and_then(|key| grouped.get(&key.group_key()))
                    .cloned()
                    .unwrap_or_default();
                let related = if plan.is_single() {
                    Related::One(group.into_iter().next().map(Box::new))
                } else {
                    Related::Many(group)
                };
                record.set_relation(plan.slot.clone(), RelationState::Loaded(related));
            }
        }
        Ok(())
    })
}

/// Loads relations onto records that were already fetched.
pub async fn fetch_related<I, P>(
    db: &dyn DbExecutor,
    registry: &Arc<Registry>,
    records: &mut [Record],
    relations: I,
) -> OrmResult<()>
where
    I: IntoIterator<Item = P>,
    P: Into<Prefetch>,
{
    let requests: Vec<Prefetch> = relations.into_iter().map(Into::into).collect();
    prefetch_records(db, registry, records, &requests).await
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::executor::{Capabilities, QueryResult, StatementCache};
    use crate::fields::{FieldDef, FieldType};
    use crate::model::ModelDef;
    use crate::query::compiler::Dialect;
    use crate::row::Row;

    /// Answers queries whose SQL contains a registered fragment.
    struct ScriptedDb {
        responses: Vec<(&'static str, Vec<&'static str>, Vec<Vec<Value>>)>,
        failing: Option<&'static str>,
        statements: Mutex<Vec<String>>,
        cache: StatementCache,
        lock: Arc<tokio::sync::Mutex<()>>,
    }

    impl ScriptedDb {
        fn new() -> Self {
            Self {
                responses: Vec::new(),
                failing: None,
                statements: Mutex::new(Vec::new()),
                cache: StatementCache::new(),
                lock: Arc::new(tokio::sync::Mutex::new(())),
            }
        }

        fn respond(
            mut self,
            fragment: &'static str,
            columns: Vec<&'static str>,
            rows: Vec<Vec<Value>>,
        ) -> Self {
            self.responses.push((fragment, columns, rows));
            self
        }

        fn statements(&self) -> Vec<String> {
            self.statements.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl DbExecutor for ScriptedDb {
        fn capabilities(&self) -> Capabilities {
            Capabilities::for_dialect(Dialect::SQLite)
        }

        async fn run_query(&self, sql: &str, _params: &[Value]) -> OrmResult<QueryResult> {
            self.statements.lock().unwrap().push(sql.to_string());
            if self.failing.is_some_and(|f| sql.contains(f)) {
                return Err(OrmError::OperationalError("no such table".to_string()));
            }
            let Some((_, columns, rows)) = self.responses.iter().find(|(f, _, _)| sql.contains(f))
            else {
                return Ok(QueryResult::default());
            };
            let columns: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
            let rows: Vec<Row> = rows
                .iter()
                .map(|values| Row::new(columns.clone(), values.clone()))
                .collect();
            Ok(QueryResult {
                row_count: rows.len() as u64,
                columns,
                rows,
            })
        }

        async fn run_insert(&self, _sql: &str, _params: &[Value]) -> OrmResult<Value> {
            Ok(Value::Null)
        }

        async fn run_many(&self, _sql: &str, _params: &[Vec<Value>]) -> OrmResult<u64> {
            Ok(0)
        }

        async fn run_script(&self, _script: &str) -> OrmResult<()> {
            Ok(())
        }

        fn statement_cache(&self) -> &StatementCache {
            &self.cache
        }

        fn transaction_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
            Arc::clone(&self.lock)
        }
    }

    fn registry() -> Arc<Registry> {
        Registry::builder()
            .register(
                ModelDef::new("Tournament")
                    .field(FieldDef::new("id", FieldType::IntField).primary_key())
                    .field(FieldDef::new("name", FieldType::TextField)),
            )
            .register(
                ModelDef::new("Event")
                    .field(FieldDef::new("id", FieldType::IntField).primary_key())
                    .field(FieldDef::new("name", FieldType::TextField))
                    .field(FieldDef::foreign_key("tournament", "Tournament").nullable())
                    .field(FieldDef::many_to_many("participants", "Team").related_name("events")),
            )
            .register(
                ModelDef::new("Team")
                    .field(FieldDef::new("id", FieldType::IntField).primary_key())
                    .field(FieldDef::new("name", FieldType::TextField)),
            )
            .build()
            .unwrap()
    }

    fn tournaments(reg: &Arc<Registry>, ids: &[i64]) -> Vec<Record> {
        let model = reg.get("Tournament").unwrap();
        ids.iter()
            .map(|id| Record::with_values(Arc::clone(&model), [("id", *id)]))
            .collect()
    }

    fn event_rows() -> ScriptedDb {
        ScriptedDb::new().respond(
            "FROM \"event\"",
            vec!["id", "name", "tournament_id"],
            vec![
                vec![Value::Int(10), Value::from("a"), Value::Int(1)],
                vec![Value::Int(11), Value::from("b"), Value::Int(1)],
                vec![Value::Int(12), Value::from("c"), Value::Int(2)],
            ],
        )
    }

    #[tokio::test]
    async fn test_empty_batch_issues_no_query() {
        let reg = registry();
        let db = ScriptedDb::new();
        let mut records: Vec<Record> = Vec::new();
        fetch_related(&db, &reg, &mut records, ["events"]).await.unwrap();
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_relation() {
        let reg = registry();
        let db = ScriptedDb::new();
        let mut records = tournaments(&reg, &[1]);
        let err = fetch_related(&db, &reg, &mut records, ["name"]).await.unwrap_err();
        assert!(matches!(err, OrmError::FieldError(_)));
        assert!(db.statements().is_empty());
        assert_eq!(records[0].relation_state("name"), &RelationState::Unloaded);
    }

    #[tokio::test]
    async fn test_backward_fk_groups_children() {
        let reg = registry();
        let db = event_rows();
        let mut records = tournaments(&reg, &[1, 2, 3]);
        fetch_related(&db, &reg, &mut records, ["events"]).await.unwrap();

        assert_eq!(db.statements().len(), 1);
        assert!(db.statements()[0].contains("WHERE \"event\".\"tournament_id\" IN (?,?,?)"));
        let counts: Vec<usize> = records
            .iter()
            .map(|r| r.related_many("events").unwrap().len())
            .collect();
        assert_eq!(counts, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_forward_fk_with_null_key() {
        let reg = registry();
        let db = ScriptedDb::new().respond(
            "FROM \"tournament\"",
            vec!["id", "name"],
            vec![vec![Value::Int(1), Value::from("cup")]],
        );
        let model = reg.get("Event").unwrap();
        let mut records = vec![
            Record::with_values(Arc::clone(&model), [("id", Value::Int(10)), ("tournament_id", Value::Int(1))]),
            Record::with_values(Arc::clone(&model), [("id", Value::Int(11)), ("tournament_id", Value::Null)]),
            Record::with_values(Arc::clone(&model), [("id", Value::Int(12)), ("tournament_id", Value::Int(1))]),
        ];
        fetch_related(&db, &reg, &mut records, ["tournament"]).await.unwrap();

        let statements = db.statements();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].contains("\"tournament\".\"id\" IN (?)"));
        let parent = records[0].related_one("tournament").unwrap().unwrap();
        assert_eq!(parent.get("name"), Some(&Value::from("cup")));
        assert!(records[1].related_one("tournament").unwrap().is_none());
        assert!(records[2].related_one("tournament").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sibling_relations_and_to_attr() {
        let reg = registry();
        let db = event_rows().respond(
            "FROM \"team\"",
            vec!["id", "name", "_backward_relation_key"],
            vec![vec![Value::Int(100), Value::from("red"), Value::Int(10)]],
        );
        let model = reg.get("Event").unwrap();
        let mut records = vec![
            Record::with_values(Arc::clone(&model), [("id", Value::Int(10)), ("tournament_id", Value::Int(1))]),
            Record::with_values(Arc::clone(&model), [("id", Value::Int(11)), ("tournament_id", Value::Int(1))]),
        ];
        let named = reg.query("Team").unwrap().filter(Q::new("name__startswith", "r"));
        fetch_related(
            &db,
            &reg,
            &mut records,
            [
                Prefetch::new("participants"),
                Prefetch::new("participants").queryset(named).to_attr("red_teams"),
            ],
        )
        .await
        .unwrap();

        assert_eq!(db.statements().len(), 2);
        assert_eq!(records[0].related_many("participants").unwrap().len(), 1);
        assert_eq!(records[0].related_many("red_teams").unwrap().len(), 1);
        assert!(records[1].related_many("participants").unwrap().is_empty());
        let team = &records[0].related_many("participants").unwrap()[0];
        assert_eq!(team.get("_backward_relation_key"), None);
    }

    #[tokio::test]
    async fn test_nested_prefetch_runs_on_children() {
        let reg = registry();
        let db = event_rows().respond(
            "FROM \"team\"",
            vec!["id", "name", "_backward_relation_key"],
            vec![
                vec![Value::Int(100), Value::from("red"), Value::Int(10)],
                vec![Value::Int(101), Value::from("blue"), Value::Int(10)],
            ],
        );
        let mut records = tournaments(&reg, &[1, 2]);
        fetch_related(&db, &reg, &mut records, ["events__participants"])
            .await
            .unwrap();

        let statements = db.statements();
        assert_eq!(statements.len(), 2);
        assert!(statements[1].contains("INNER JOIN \"event_team\""));
        let events = records[0].related_many("events").unwrap();
        assert_eq!(events[0].related_many("participants").unwrap().len(), 2);
        assert!(events[1].related_many("participants").unwrap().is_empty());
        let events = records[1].related_many("events").unwrap();
        assert!(events[0].related_many("participants").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_resets_slots() {
        let reg = registry();
        let mut db = ScriptedDb::new();
        db.failing = Some("FROM \"event\"");
        let mut records = tournaments(&reg, &[1, 2]);
        let err = fetch_related(&db, &reg, &mut records, ["events"]).await.unwrap_err();
        assert!(matches!(err, OrmError::OperationalError(_)));
        for record in &records {
            assert_eq!(record.relation_state("events"), &RelationState::Unloaded);
        }
    }

    #[tokio::test]
    async fn test_failure_keeps_previously_loaded_slots() {
        let reg = registry();
        let mut db = event_rows();
        let mut records = tournaments(&reg, &[1, 3]);
        fetch_related(&db, &reg, &mut records, ["events"]).await.unwrap();

        db.failing = Some("FROM \"event\"");
        assert!(fetch_related(&db, &reg, &mut records, ["events"]).await.is_err());
        assert_eq!(records[0].related_many("events").unwrap().len(), 2);
        assert!(records[1].related_many("events").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queryset_for_wrong_model() {
        let reg = registry();
        let db = ScriptedDb::new();
        let mut records = tournaments(&reg, &[1]);
        let wrong = reg.query("Team").unwrap();
        let err = fetch_related(
            &db,
            &reg,
            &mut records,
            [Prefetch::new("events").queryset(wrong)],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OrmError::ParamsError(_)));
        assert!(db.statements().is_empty());
    }
}
