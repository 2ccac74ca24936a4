//! Shared test models.
//!
//! A tournament has many events, an event has many participating teams
//! through the `event_team` junction table, and an event may name a
//! reporter:
//!
//! | Model        | Table        | Relations                                    |
//! |--------------|--------------|----------------------------------------------|
//! | `Tournament` | `tournament` | `events` (reverse FK)                        |
//! | `Reporter`   | `re_port`    | `events` (reverse FK)                        |
//! | `Event`      | `event`      | `tournament`, `reporter`, `participants`     |
//! | `Team`       | `team`       | `events` (reverse M2M)                       |

use std::sync::Arc;

use terrapin_core::OrmResult;
use terrapin_db::executor::{insert_record, DbExecutor};
use terrapin_db::fields::{FieldDef, FieldType, OnDelete};
use terrapin_db::model::ModelDef;
use terrapin_db::record::Record;
use terrapin_db::registry::Registry;
use terrapin_db::value::Value;

pub fn tournament() -> ModelDef {
    ModelDef::new("Tournament")
        .field(FieldDef::new("id", FieldType::IntField).primary_key())
        .field(FieldDef::new("name", FieldType::CharField { max_length: 255 }).index())
        .field(FieldDef::new("description", FieldType::TextField).nullable())
        .description("What Tournaments we have")
}

pub fn reporter() -> ModelDef {
    ModelDef::new("Reporter")
        .table("re_port")
        .field(FieldDef::new("id", FieldType::IntField).primary_key())
        .field(FieldDef::new("name", FieldType::TextField))
        .description("Whom is assigned as the reporter")
}

pub fn event() -> ModelDef {
    ModelDef::new("Event")
        .field(FieldDef::new("id", FieldType::BigIntField).primary_key())
        .field(FieldDef::new("name", FieldType::TextField).description("The name"))
        .field(
            FieldDef::foreign_key("tournament", "Tournament")
                .related_name("events")
                .description("What tournaments is a happenin'"),
        )
        .field(
            FieldDef::foreign_key("reporter", "Reporter")
                .related_name("events")
                .on_delete(OnDelete::SetNull)
                .nullable(),
        )
        .field(FieldDef::many_to_many("participants", "Team").related_name("events"))
        .field(FieldDef::new("rating", FieldType::IntField).default(0))
        .unique_together(["name", "tournament"])
        .description("This references a Tournament")
}

pub fn team() -> ModelDef {
    ModelDef::new("Team")
        .field(FieldDef::new("id", FieldType::IntField).primary_key())
        .field(FieldDef::new("name", FieldType::TextField))
        .description("The TEAMS!")
}

/// The fixture registry.
pub fn registry() -> OrmResult<Arc<Registry>> {
    Registry::builder()
        .register(tournament())
        .register(reporter())
        .register(event())
        .register(team())
        .build()
}

/// Inserts a `model` record built from `values` and returns it with its
/// generated primary key.
pub async fn create<I, K, V>(
    db: &dyn DbExecutor,
    registry: &Registry,
    model: &str,
    values: I,
) -> OrmResult<Record>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    let mut record = Record::with_values(registry.get(model)?, values);
    insert_record(db, &mut record).await?;
    Ok(record)
}
