//! QuerySet round-trips on SQLite: filters across relations, annotations,
//! aggregates, subqueries and the value terminals.

use std::sync::Arc;

use terrapin_core::OrmError;
use terrapin_db::query::expressions::{count, length, outer_ref, subquery, upper};
use terrapin_db::query::{Dialect, Expression, Q};
use terrapin_db::record::Record;
use terrapin_db::registry::Registry;
use terrapin_db::value::Value;
use terrapin_test::{create, fixtures, TestDatabase};

struct World {
    registry: Arc<Registry>,
    db: TestDatabase,
    open: Record,
    closed: Record,
}

/// "Open" has events "alpha" (rating 5) and "beta" (rating 1); "Closed" has
/// none. Team "red" plays in alpha, "blue" in alpha and beta.
async fn world() -> World {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    let open = create(&db, &registry, "Tournament", [("name", "Open")])
        .await
        .unwrap();
    let closed = create(
        &db,
        &registry,
        "Tournament",
        [("name", Value::from("Closed")), ("description", Value::from("invite only"))],
    )
    .await
    .unwrap();
    let open_pk = open.pk().cloned().unwrap();
    let alpha = create(
        &db,
        &registry,
        "Event",
        [
            ("name", Value::from("alpha")),
            ("tournament_id", open_pk.clone()),
            ("rating", Value::from(5)),
        ],
    )
    .await
    .unwrap();
    let beta = create(
        &db,
        &registry,
        "Event",
        [
            ("name", Value::from("beta")),
            ("tournament_id", open_pk),
            ("rating", Value::from(1)),
        ],
    )
    .await
    .unwrap();
    let red = create(&db, &registry, "Team", [("name", "red")]).await.unwrap();
    let blue = create(&db, &registry, "Team", [("name", "blue")]).await.unwrap();
    let red_pk = red.pk().cloned().unwrap();
    let blue_pk = blue.pk().cloned().unwrap();
    terrapin_db::add_m2m(&db, &alpha, "participants", &[red_pk, blue_pk.clone()])
        .await
        .unwrap();
    terrapin_db::add_m2m(&db, &beta, "participants", &[blue_pk])
        .await
        .unwrap();
    World {
        registry,
        db,
        open,
        closed,
    }
}

fn names(records: &[Record]) -> Vec<String> {
    let mut names: Vec<String> = records.iter().map(|r| r.get_as("name").unwrap()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_filter_by_field_and_comparators() {
    let w = world().await;
    let events = w.registry.query("Event").unwrap();

    let good = events.clone().filter(Q::new("rating__gt", 2)).all(&w.db).await.unwrap();
    assert_eq!(names(&good), vec!["alpha"]);

    let starts = events
        .clone()
        .filter(Q::new("name__istartswith", "BE"))
        .all(&w.db)
        .await
        .unwrap();
    assert_eq!(names(&starts), vec!["beta"]);

    let either = events
        .clone()
        .filter(Q::new("name", "alpha") | Q::new("rating", 1))
        .count(&w.db)
        .await
        .unwrap();
    assert_eq!(either, 2);

    let excluded = events.exclude(Q::new("name", "alpha")).all(&w.db).await.unwrap();
    assert_eq!(names(&excluded), vec!["beta"]);
}

#[tokio::test]
async fn test_null_lookups() {
    let w = world().await;
    let tournaments = w.registry.query("Tournament").unwrap();
    let without = tournaments
        .clone()
        .filter(Q::new("description__isnull", true))
        .all(&w.db)
        .await
        .unwrap();
    assert_eq!(names(&without), vec!["Open"]);

    // Negated comparisons keep NULL rows.
    let not_invite = tournaments
        .filter(Q::new("description__not", "invite only"))
        .all(&w.db)
        .await
        .unwrap();
    assert_eq!(names(&not_invite), vec!["Open"]);
}

#[tokio::test]
async fn test_filter_across_forward_and_backward_relations() {
    let w = world().await;
    let by_tournament = w
        .registry
        .query("Event")
        .unwrap()
        .filter(Q::new("tournament__name", "Open"))
        .count(&w.db)
        .await
        .unwrap();
    assert_eq!(by_tournament, 2);

    let with_alpha = w
        .registry
        .query("Tournament")
        .unwrap()
        .filter(Q::new("events__name", "alpha"))
        .all(&w.db)
        .await
        .unwrap();
    assert_eq!(names(&with_alpha), vec!["Open"]);

    let blue_events = w
        .registry
        .query("Event")
        .unwrap()
        .filter(Q::new("participants__name", "blue"))
        .all(&w.db)
        .await
        .unwrap();
    assert_eq!(names(&blue_events), vec!["alpha", "beta"]);

    let by_fk_value = w
        .registry
        .query("Event")
        .unwrap()
        .filter(Q::new("tournament", w.open.pk().cloned().unwrap()))
        .count(&w.db)
        .await
        .unwrap();
    assert_eq!(by_fk_value, 2);
}

#[tokio::test]
async fn test_chained_filters_join_relation_once() {
    let w = world().await;
    let qs = w
        .registry
        .query("Tournament")
        .unwrap()
        .filter(Q::new("events__name", "alpha"))
        .filter(Q::new("events__rating__gte", 3));
    let (sql, _) = qs.sql(Dialect::SQLite).unwrap();
    assert_eq!(sql.matches("JOIN").count(), 1, "{sql}");
    assert_eq!(names(&qs.all(&w.db).await.unwrap()), vec!["Open"]);
}

#[tokio::test]
async fn test_count_annotation_filtered_in_having() {
    let w = world().await;
    let rows = w
        .registry
        .query("Tournament")
        .unwrap()
        .annotate("events_count", count("events"))
        .filter(Q::new("events_count__gte", 1))
        .all(&w.db)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_as::<String>("name").unwrap(), "Open");
    assert_eq!(rows[0].get_as::<i64>("events_count").unwrap(), 2);

    let all = w
        .registry
        .query("Tournament")
        .unwrap()
        .annotate("events_count", count("events"))
        .order_by(["events_count"]);
    let counts: Vec<Value> = all
        .values_list_flat(&w.db, ["events_count"])
        .await
        .unwrap();
    assert_eq!(counts, vec![Value::Int(0), Value::Int(2)]);
    assert_eq!(all.count(&w.db).await.unwrap(), 2);
}

#[tokio::test]
async fn test_function_annotations() {
    let w = world().await;
    let rows = w
        .registry
        .query("Event")
        .unwrap()
        .annotate("shout", upper(Expression::f("name")))
        .annotate("name_len", length(Expression::f("name")))
        .annotate("boosted", Expression::f("rating") * 2 + 1)
        .order_by(["name"])
        .values(&w.db, ["shout", "name_len", "boosted"])
        .await
        .unwrap();
    assert_eq!(rows[0]["shout"], Value::from("ALPHA"));
    assert_eq!(rows[0]["name_len"], Value::Int(5));
    assert_eq!(rows[0]["boosted"], Value::Int(11));
    assert_eq!(rows[1]["boosted"], Value::Int(3));
}

#[tokio::test]
async fn test_correlated_subquery_annotation() {
    let w = world().await;
    let top_event = w
        .registry
        .query("Event")
        .unwrap()
        .filter(Q::new("tournament", outer_ref("pk")))
        .order_by(["-rating"])
        .limit(1)
        .only(["name"]);
    let rows = w
        .registry
        .query("Tournament")
        .unwrap()
        .annotate("top_event", subquery(top_event))
        .order_by(["name"])
        .values_list(&w.db, ["name", "top_event"])
        .await
        .unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::from("Closed"), Value::Null],
            vec![Value::from("Open"), Value::from("alpha")],
        ]
    );
}

#[tokio::test]
async fn test_subquery_in_filter() {
    let w = world().await;
    let busy = w
        .registry
        .query("Event")
        .unwrap()
        .filter(Q::new("rating__gte", 1))
        .only(["tournament"]);
    let rows = w
        .registry
        .query("Tournament")
        .unwrap()
        .filter(Q::new("pk__in", busy))
        .all(&w.db)
        .await
        .unwrap();
    assert_eq!(names(&rows), vec!["Open"]);
}

#[tokio::test]
async fn test_values_list_flat_matches_first_column() {
    let w = world().await;
    let qs = w.registry.query("Event").unwrap().order_by(["-name"]);
    let flat = qs.values_list_flat(&w.db, ["name"]).await.unwrap();
    let tuples = qs.values_list(&w.db, ["name"]).await.unwrap();
    let first_column: Vec<Value> = tuples.into_iter().map(|mut t| t.remove(0)).collect();
    assert_eq!(flat, first_column);
    assert_eq!(flat, vec![Value::from("beta"), Value::from("alpha")]);

    let err = qs.values_list_flat(&w.db, ["name", "rating"]).await.unwrap_err();
    assert!(matches!(err, OrmError::ParamsError(_)));
}

#[tokio::test]
async fn test_values_through_relation_path() {
    let w = world().await;
    let rows = w
        .registry
        .query("Event")
        .unwrap()
        .order_by(["name"])
        .values(&w.db, ["name", "tournament__name"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["tournament__name"], Value::from("Open"));
}

#[tokio::test]
async fn test_get_first_and_exists() {
    let w = world().await;
    let events = w.registry.query("Event").unwrap();

    let alpha = events.clone().filter(Q::new("name", "alpha")).get(&w.db).await.unwrap();
    assert_eq!(alpha.get_as::<i64>("rating").unwrap(), 5);

    let missing = events.clone().filter(Q::new("name", "gamma")).get(&w.db).await;
    assert!(matches!(missing, Err(OrmError::DoesNotExist(_))));
    assert!(events
        .clone()
        .filter(Q::new("name", "gamma"))
        .get_or_none(&w.db)
        .await
        .unwrap()
        .is_none());

    let many = events.get(&w.db).await;
    assert!(matches!(many, Err(OrmError::MultipleObjectsReturned(_))));

    let first = events.first(&w.db).await.unwrap().unwrap();
    assert_eq!(first.get_as::<String>("name").unwrap(), "alpha");
    let last = events.clone().reverse().first(&w.db).await.unwrap().unwrap();
    assert_eq!(last.get_as::<String>("name").unwrap(), "beta");

    assert!(events.exists(&w.db).await.unwrap());
    assert!(!events.clone().none().exists(&w.db).await.unwrap());
}

#[tokio::test]
async fn test_limit_offset_and_distinct() {
    let w = world().await;
    let page = w
        .registry
        .query("Event")
        .unwrap()
        .order_by(["name"])
        .offset(1)
        .all(&w.db)
        .await
        .unwrap();
    assert_eq!(names(&page), vec!["beta"]);

    let tournaments = w
        .registry
        .query("Event")
        .unwrap()
        .distinct()
        .values_list_flat(&w.db, ["tournament__name"])
        .await
        .unwrap();
    assert_eq!(tournaments, vec![Value::from("Open")]);
}

#[tokio::test]
async fn test_unknown_field_is_field_error() {
    let w = world().await;
    let err = w
        .registry
        .query("Event")
        .unwrap()
        .filter(Q::new("nope", 1))
        .all(&w.db)
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::FieldError(_)), "{err:?}");
    assert_eq!(w.db.query_count(), 0);
}

#[tokio::test]
async fn test_update_and_delete() {
    let w = world().await;
    let events = w.registry.query("Event").unwrap();

    let updated = events
        .clone()
        .filter(Q::new("tournament__name", "Open"))
        .update(&w.db, [("rating", Expression::f("rating") + 10)])
        .await
        .unwrap();
    assert_eq!(updated, 2);
    let ratings = events
        .clone()
        .order_by(["name"])
        .values_list_flat(&w.db, ["rating"])
        .await
        .unwrap();
    assert_eq!(ratings, vec![Value::Int(15), Value::Int(11)]);

    let moved = events
        .clone()
        .filter(Q::new("name", "beta"))
        .update(&w.db, [("tournament", w.closed.pk().cloned().unwrap())])
        .await
        .unwrap();
    assert_eq!(moved, 1);

    let deleted = events
        .clone()
        .filter(Q::new("tournament__name", "Closed"))
        .delete(&w.db)
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(events.count(&w.db).await.unwrap(), 1);
}
