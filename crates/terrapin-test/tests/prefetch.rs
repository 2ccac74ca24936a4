//! Prefetching on SQLite: one query per relation regardless of batch size.

use terrapin_core::OrmError;
use terrapin_db::prefetch::{fetch_related, Prefetch};
use terrapin_db::query::Q;
use terrapin_db::record::{Record, RelationState};
use terrapin_db::value::Value;
use terrapin_db::{add_m2m, Registry};
use terrapin_test::{assert_num_queries, create, fixtures, TestDatabase};

fn pk(record: &Record) -> Value {
    record.pk().cloned().unwrap()
}

async fn event(db: &TestDatabase, registry: &Registry, name: &str, tournament: &Record) -> Record {
    create(
        db,
        registry,
        "Event",
        [("name", Value::from(name)), ("tournament_id", pk(tournament))],
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_three_tournaments_one_event_each() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    for name in ["a", "b", "c"] {
        let t = create(&db, &registry, "Tournament", [("name", name)])
            .await
            .unwrap();
        event(&db, &registry, &format!("{name}-final"), &t).await;
    }

    let tournaments = assert_num_queries(&db, 2, || async {
        registry
            .query("Tournament")
            .unwrap()
            .prefetch_related(["events"])
            .all(&db)
            .await
            .unwrap()
    })
    .await;

    assert_eq!(tournaments.len(), 3);
    for t in &tournaments {
        let events = t.related_many("events").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("tournament_id"), t.pk());
        let expected = format!("{}-final", t.get_as::<String>("name").unwrap());
        assert_eq!(events[0].get_as::<String>("name").unwrap(), expected);
    }
}

#[tokio::test]
async fn test_reverse_relation_without_children_is_empty() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    for name in ["x", "y"] {
        create(&db, &registry, "Tournament", [("name", name)])
            .await
            .unwrap();
    }
    let tournaments = registry
        .query("Tournament")
        .unwrap()
        .prefetch_related(["events"])
        .all(&db)
        .await
        .unwrap();
    assert_eq!(tournaments.len(), 2);
    for t in &tournaments {
        assert!(t.related_many("events").unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_unloaded_relation_raises() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    create(&db, &registry, "Tournament", [("name", "t")])
        .await
        .unwrap();
    let t = registry.query("Tournament").unwrap().get(&db).await.unwrap();
    assert_eq!(t.relation_state("events"), &RelationState::Unloaded);
    assert!(matches!(
        t.related_many("events"),
        Err(OrmError::NoValuesFetched(_))
    ));
}

#[tokio::test]
async fn test_forward_fk_and_nullable_fk() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    let t = create(&db, &registry, "Tournament", [("name", "t")])
        .await
        .unwrap();
    let reporter = create(&db, &registry, "Reporter", [("name", "Kim")])
        .await
        .unwrap();
    create(
        &db,
        &registry,
        "Event",
        [
            ("name", Value::from("reported")),
            ("tournament_id", pk(&t)),
            ("reporter_id", pk(&reporter)),
        ],
    )
    .await
    .unwrap();
    event(&db, &registry, "quiet", &t).await;

    let events = assert_num_queries(&db, 3, || async {
        registry
            .query("Event")
            .unwrap()
            .order_by(["name"])
            .prefetch_related(["tournament", "reporter"])
            .all(&db)
            .await
            .unwrap()
    })
    .await;

    let quiet = &events[0];
    let reported = &events[1];
    assert_eq!(
        quiet.related_one("tournament").unwrap().unwrap().get_as::<String>("name").unwrap(),
        "t"
    );
    assert!(quiet.related_one("reporter").unwrap().is_none());
    assert_eq!(
        reported.related_one("reporter").unwrap().unwrap().get_as::<String>("name").unwrap(),
        "Kim"
    );
}

#[tokio::test]
async fn test_many_to_many_both_directions() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    let t = create(&db, &registry, "Tournament", [("name", "t")])
        .await
        .unwrap();
    let final_ = event(&db, &registry, "final", &t).await;
    let semi = event(&db, &registry, "semi", &t).await;
    let red = create(&db, &registry, "Team", [("name", "red")]).await.unwrap();
    let blue = create(&db, &registry, "Team", [("name", "blue")]).await.unwrap();
    add_m2m(&db, &final_, "participants", &[pk(&red), pk(&blue)])
        .await
        .unwrap();
    add_m2m(&db, &semi, "participants", &[pk(&blue)]).await.unwrap();

    let events = assert_num_queries(&db, 2, || async {
        registry
            .query("Event")
            .unwrap()
            .order_by(["name"])
            .prefetch_related(["participants"])
            .all(&db)
            .await
            .unwrap()
    })
    .await;
    let mut final_teams: Vec<String> = events[0]
        .related_many("participants")
        .unwrap()
        .iter()
        .map(|r| r.get_as("name").unwrap())
        .collect();
    final_teams.sort();
    assert_eq!(final_teams, vec!["blue", "red"]);
    assert_eq!(events[1].related_many("participants").unwrap().len(), 1);
    // The junction key is not left on the related records.
    assert!(events[0].related_many("participants").unwrap()[0]
        .get("_backward_relation_key")
        .is_none());

    let teams = registry
        .query("Team")
        .unwrap()
        .order_by(["name"])
        .prefetch_related(["events"])
        .all(&db)
        .await
        .unwrap();
    assert_eq!(teams[0].related_many("events").unwrap().len(), 2);
    assert_eq!(teams[1].related_many("events").unwrap().len(), 1);
}

#[tokio::test]
async fn test_nested_prefetch_runs_one_query_per_level() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    let blue = create(&db, &registry, "Team", [("name", "blue")]).await.unwrap();
    for name in ["a", "b"] {
        let t = create(&db, &registry, "Tournament", [("name", name)])
            .await
            .unwrap();
        for round in ["r1", "r2"] {
            let e = event(&db, &registry, round, &t).await;
            add_m2m(&db, &e, "participants", &[pk(&blue)]).await.unwrap();
        }
    }

    let tournaments = assert_num_queries(&db, 3, || async {
        registry
            .query("Tournament")
            .unwrap()
            .prefetch_related(["events__participants"])
            .all(&db)
            .await
            .unwrap()
    })
    .await;
    for t in &tournaments {
        let events = t.related_many("events").unwrap();
        assert_eq!(events.len(), 2);
        for e in events {
            let teams = e.related_many("participants").unwrap();
            assert_eq!(teams.len(), 1);
            assert_eq!(teams[0].get_as::<String>("name").unwrap(), "blue");
        }
    }
}

#[tokio::test]
async fn test_custom_queryset_and_to_attr() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    let t = create(&db, &registry, "Tournament", [("name", "t")])
        .await
        .unwrap();
    for (name, rating) in [("low", 1), ("high", 9)] {
        create(
            &db,
            &registry,
            "Event",
            [
                ("name", Value::from(name)),
                ("tournament_id", pk(&t)),
                ("rating", Value::from(rating)),
            ],
        )
        .await
        .unwrap();
    }

    let good = registry
        .query("Event")
        .unwrap()
        .filter(Q::new("rating__gte", 5));
    let t = registry
        .query("Tournament")
        .unwrap()
        .prefetch_related([
            Prefetch::new("events").queryset(good).to_attr("good_events"),
            Prefetch::new("events"),
        ])
        .get(&db)
        .await
        .unwrap();
    let good_events = t.related_many("good_events").unwrap();
    assert_eq!(good_events.len(), 1);
    assert_eq!(good_events[0].get_as::<String>("name").unwrap(), "high");
    assert_eq!(t.related_many("events").unwrap().len(), 2);
}

#[tokio::test]
async fn test_m2m_custom_queryset_filters_per_link() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    let t = create(&db, &registry, "Tournament", [("name", "t")])
        .await
        .unwrap();
    let final_ = event(&db, &registry, "final", &t).await;
    let semi = event(&db, &registry, "semi", &t).await;
    let red = create(&db, &registry, "Team", [("name", "red")]).await.unwrap();
    let blue = create(&db, &registry, "Team", [("name", "blue")]).await.unwrap();
    add_m2m(&db, &final_, "participants", &[pk(&red), pk(&blue)])
        .await
        .unwrap();
    add_m2m(&db, &semi, "participants", &[pk(&blue)]).await.unwrap();

    // The filter crosses back to Event through the link row of each owner,
    // so blue's place in the final does not leak into the semi.
    let in_final = registry
        .query("Team")
        .unwrap()
        .filter(Q::new("events__name", "final"));
    let events = assert_num_queries(&db, 3, || async {
        registry
            .query("Event")
            .unwrap()
            .order_by(["name"])
            .prefetch_related([
                Prefetch::new("participants")
                    .queryset(in_final.clone())
                    .to_attr("finalists"),
                Prefetch::new("participants")
                    .queryset(registry.query("Team").unwrap().filter(Q::new("name", "blue"))),
            ])
            .all(&db)
            .await
            .unwrap()
    })
    .await;

    let names = |record: &Record, slot: &str| {
        let mut names: Vec<String> = record
            .related_many(slot)
            .unwrap()
            .iter()
            .map(|r| r.get_as("name").unwrap())
            .collect();
        names.sort();
        names
    };
    let (final_, semi) = (&events[0], &events[1]);
    assert_eq!(names(final_, "finalists"), vec!["blue", "red"]);
    assert!(names(semi, "finalists").is_empty());
    assert_eq!(names(final_, "participants"), vec!["blue"]);
    assert_eq!(names(semi, "participants"), vec!["blue"]);

    // Outside a prefetch the same filter still means "plays in the final".
    let finalists = in_final
        .order_by(["name"])
        .values_list_flat(&db, ["name"])
        .await
        .unwrap();
    assert_eq!(finalists, vec![Value::from("blue"), Value::from("red")]);
}

#[tokio::test]
async fn test_fetch_related_on_existing_records() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    let t = create(&db, &registry, "Tournament", [("name", "t")])
        .await
        .unwrap();
    event(&db, &registry, "e1", &t).await;

    let mut records = registry.query("Tournament").unwrap().all(&db).await.unwrap();
    db.reset_query_count();
    fetch_related(&db, &registry, &mut records, ["events"])
        .await
        .unwrap();
    assert_eq!(db.query_count(), 1);
    assert_eq!(records[0].related_many("events").unwrap().len(), 1);

    let err = fetch_related(&db, &registry, &mut records, ["nothing"])
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::FieldError(_)));
}

#[tokio::test]
async fn test_related_query_handle() {
    let registry = fixtures::registry().unwrap();
    let db = TestDatabase::with_registry(&registry).await.unwrap();
    let t = create(&db, &registry, "Tournament", [("name", "t")])
        .await
        .unwrap();
    event(&db, &registry, "e1", &t).await;
    event(&db, &registry, "e2", &t).await;

    let handle = t.related_query(&registry, "events").unwrap();
    assert_eq!(handle.count(&db).await.unwrap(), 2);
    let one = handle
        .filter(Q::new("name", "e2"))
        .get(&db)
        .await
        .unwrap();
    let back = one
        .related_query(&registry, "tournament")
        .unwrap()
        .get(&db)
        .await
        .unwrap();
    assert_eq!(back.pk(), t.pk());
}
