use std::sync::{Arc, OnceLock};

use dataroom_core::{
    Actor, AuditAction, CellValue, ColumnDef, ComparisonOp, DatasetDirectory, FilterPredicate,
    InMemoryDataset, MemoryAuditSink, OrganizationId,
};
use dataroom_mpc::{
    CoordinatorKeyPair, DataRoom, MpcConfig, MpcCoordinator, MpcEngine, MpcError,
    ParticipantStatus, QueryType, RoomStatus,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn keys() -> CoordinatorKeyPair {
    static KEYS: OnceLock<CoordinatorKeyPair> = OnceLock::new();
    KEYS.get_or_init(|| CoordinatorKeyPair::generate(1024).unwrap())
        .clone()
}

struct Harness {
    coordinator: MpcCoordinator,
    audit: Arc<MemoryAuditSink>,
}

fn sales(org: &str, revenues: &[f64], with_region: bool) -> InMemoryDataset {
    let mut columns = vec![ColumnDef::new("revenue", "integer")];
    if with_region {
        columns.push(ColumnDef::new("region", "text"));
    }
    let rows: Vec<Vec<CellValue>> = revenues
        .iter()
        .map(|revenue| {
            let mut row = vec![CellValue::Number(*revenue)];
            if with_region {
                row.push("west".into());
            }
            row
        })
        .collect();
    InMemoryDataset::new(format!("ds-{org}"), org, "sales", columns)
        .with_rows(rows)
        .unwrap()
}

fn harness(datasets: Vec<InMemoryDataset>, config: MpcConfig) -> Harness {
    let directory = DatasetDirectory::new();
    for dataset in datasets {
        directory.register(Arc::new(dataset));
    }
    let audit = Arc::new(MemoryAuditSink::new());
    let coordinator = MpcCoordinator::new(config, keys(), directory, audit.clone())
        .with_engine(MpcEngine::with_seed(2024));
    Harness { coordinator, audit }
}

fn three_orgs() -> Vec<InMemoryDataset> {
    vec![
        sales("org-a", &[60.0, 40.0], true),
        sales("org-b", &[150.0, 50.0], true),
        sales("org-c", &[100.0, 100.0, 100.0], true),
    ]
}

fn attested_room(harness: &Harness, query_type: QueryType, orgs: &[&str]) -> DataRoom {
    let actor = Actor::from("analyst");
    let mut room = harness
        .coordinator
        .create_room("quarterly revenue", query_type, "revenue", actor.clone())
        .with_dp_noise(false);
    for org in orgs {
        room.add_participant((*org).into(), format!("ds-{org}").into())
            .unwrap();
    }
    for org in orgs {
        harness
            .coordinator
            .attest(&mut room, &(*org).into(), &actor)
            .unwrap();
    }
    room
}

#[tokio::test]
async fn three_party_sum_reconstructs_exact_total() {
    let harness = harness(three_orgs(), MpcConfig::default());
    let mut room = attested_room(&harness, QueryType::Sum, &["org-a", "org-b", "org-c"]);
    assert_eq!(room.status(), RoomStatus::Attested);

    let result = harness
        .coordinator
        .execute(&mut room, &Actor::from("analyst"))
        .await
        .unwrap();
    assert!((result.value - 600.0).abs() < 1e-6, "got {}", result.value);
    assert_eq!(result.epsilon, None);
    assert_eq!(room.status(), RoomStatus::Completed);
    assert!(room
        .participants()
        .iter()
        .all(|participant| participant.status == ParticipantStatus::Computed
            && participant.metadata["encrypted_noise"].is_string()));
    assert_eq!(
        harness.audit.actions(),
        vec![AuditAction::DataRoomAttested, AuditAction::MpcExecuted]
    );
    let executed = harness.audit.events().pop().unwrap();
    assert_eq!(executed.metadata["organizations"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn average_divides_by_reconstructed_count() {
    let averaging = harness(three_orgs(), MpcConfig::default());
    let mut room = attested_room(&averaging, QueryType::Avg, &["org-a", "org-b", "org-c"]);
    let result = averaging
        .coordinator
        .execute(&mut room, &Actor::system())
        .await
        .unwrap();
    assert!((result.value - 600.0 / 7.0).abs() < 1e-6);

    let counting = harness(three_orgs(), MpcConfig::default());
    let mut room = attested_room(&counting, QueryType::Count, &["org-a", "org-c"]);
    let result = counting
        .coordinator
        .execute(&mut room, &Actor::system())
        .await
        .unwrap();
    assert_eq!(result.value, 5.0);
}

#[tokio::test]
async fn laplace_layer_uses_room_epsilon() {
    let harness = harness(three_orgs(), MpcConfig::default());
    let mut room = attested_room(&harness, QueryType::Sum, &["org-a", "org-b", "org-c"]);
    room.apply_dp_noise = true;
    let result = harness
        .coordinator
        .execute(&mut room, &Actor::system())
        .await
        .unwrap();
    assert_eq!(result.epsilon, Some(0.1));
    // Scale 10; a deviation beyond 200 has probability e^-20.
    assert!((result.value - 600.0).abs() < 200.0);
}

#[tokio::test]
async fn unattested_room_fails_fast_without_mutation() {
    let harness = harness(three_orgs(), MpcConfig::default());
    let actor = Actor::system();
    let mut room = harness
        .coordinator
        .create_room("r", QueryType::Sum, "revenue", actor.clone());
    room.add_participant("org-a".into(), "ds-org-a".into()).unwrap();
    room.add_participant("org-b".into(), "ds-org-b".into()).unwrap();
    harness
        .coordinator
        .attest(&mut room, &"org-a".into(), &actor)
        .unwrap();
    let before = room.clone();

    let err = harness
        .coordinator
        .execute(&mut room, &actor)
        .await
        .unwrap_err();
    assert!(matches!(&err, MpcError::NotAttested(orgs) if orgs == &vec![OrganizationId::from("org-b")]));
    assert!(err.to_string().contains("org-b"));
    assert_eq!(room, before);
    assert_eq!(
        harness.audit.actions(),
        vec![AuditAction::DataRoomExecutionFailed]
    );
    assert_eq!(harness.audit.events()[0].metadata["stage"], "precondition");
}

#[tokio::test]
async fn declined_participant_is_reported_apart_from_unattested() {
    let harness = harness(three_orgs(), MpcConfig::default());
    let actor = Actor::system();
    let mut room = harness
        .coordinator
        .create_room("r", QueryType::Sum, "revenue", actor.clone());
    for org in ["org-a", "org-b", "org-c"] {
        room.add_participant(org.into(), format!("ds-{org}").into())
            .unwrap();
    }
    harness
        .coordinator
        .attest(&mut room, &"org-a".into(), &actor)
        .unwrap();
    room.decline(&"org-c".into()).unwrap();
    assert_eq!(room.unattested(), vec![OrganizationId::from("org-b")]);
    let before = room.clone();

    let err = harness
        .coordinator
        .execute(&mut room, &actor)
        .await
        .unwrap_err();
    assert!(matches!(&err, MpcError::Declined(orgs) if orgs == &vec![OrganizationId::from("org-c")]));
    assert_eq!(err.to_string(), "participants declined: org-c");
    assert_eq!(room, before);
    assert_eq!(
        room.participant(&"org-c".into()).map(|participant| participant.status),
        Some(ParticipantStatus::Declined)
    );
    assert_eq!(harness.audit.events()[0].metadata["stage"], "precondition");
}

#[tokio::test]
async fn single_party_room_is_rejected() {
    let harness = harness(three_orgs(), MpcConfig::default());
    let mut room = attested_room(&harness, QueryType::Sum, &["org-a"]);
    let err = harness
        .coordinator
        .execute(&mut room, &Actor::system())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MpcError::NotEnoughParties {
            required: 2,
            actual: 1
        }
    ));
    assert_eq!(room.status(), RoomStatus::Pending);
}

#[tokio::test]
async fn schema_gate_blocks_incompatible_columns() {
    let mut datasets = three_orgs();
    datasets.push(
        InMemoryDataset::new(
            "ds-org-d",
            "org-d",
            "sales",
            vec![ColumnDef::new("revenu", "integer")],
        ),
    );
    let harness = harness(datasets, MpcConfig::default());
    let mut room = attested_room(&harness, QueryType::Sum, &["org-a", "org-d"]);
    let err = harness
        .coordinator
        .execute(&mut room, &Actor::system())
        .await
        .unwrap_err();
    let MpcError::Schema(errors) = err else {
        panic!("expected schema error");
    };
    assert!(errors[0].contains("ds-org-d"));
    assert_eq!(room.status(), RoomStatus::Attested);
    let failed = harness.audit.events().pop().unwrap();
    assert_eq!(failed.action, AuditAction::DataRoomExecutionFailed);
    assert_eq!(failed.metadata["stage"], "schema");
}

#[tokio::test]
async fn participant_failure_fails_the_room() {
    let datasets = vec![
        sales("org-a", &[10.0], true),
        sales("org-b", &[20.0], false),
        sales("org-c", &[30.0], false),
    ];
    let harness = harness(datasets, MpcConfig::default());
    let mut room = attested_room(&harness, QueryType::Sum, &["org-a", "org-b", "org-c"]);
    room.filters = vec![FilterPredicate::new("region", ComparisonOp::Eq, "west")];

    let err = harness
        .coordinator
        .execute(&mut room, &Actor::system())
        .await
        .unwrap_err();
    let MpcError::ParticipantsFailed(failures) = &err else {
        panic!("expected participant failure, got {err}");
    };
    let orgs: Vec<&str> = failures.iter().map(|(org, _)| org.as_str()).collect();
    assert_eq!(orgs, vec!["org-b", "org-c"]);

    assert_eq!(room.status(), RoomStatus::Failed);
    assert!(room.result().unwrap()["error"]
        .as_str()
        .unwrap()
        .contains("org-b"));
    let statuses: Vec<ParticipantStatus> =
        room.participants().iter().map(|p| p.status).collect();
    assert_eq!(
        statuses,
        vec![
            ParticipantStatus::Attested,
            ParticipantStatus::Failed,
            ParticipantStatus::Failed
        ]
    );
    assert_eq!(
        harness.audit.actions().last(),
        Some(&AuditAction::DataRoomExecutionFailed)
    );

    // Terminal rooms do not run again.
    assert!(matches!(
        harness.coordinator.execute(&mut room, &Actor::system()).await,
        Err(MpcError::NotAttested(_))
    ));
}

proptest! {
    #[test]
    fn shares_reconstruct_any_value(value in -1e9f64..1e9, parties in 2usize..12, seed in any::<u64>()) {
        let engine = MpcEngine::with_seed(seed);
        let shares = engine.generate_shares(value, parties).unwrap();
        prop_assert_eq!(shares.len(), parties);
        let total = engine.reconstruct(&shares).unwrap();
        prop_assert!((total - value).abs() <= 1e-6 * value.abs().max(1.0));
    }

    #[test]
    fn masking_noise_stays_in_range(magnitude in 0f64..1e6, seed in any::<u64>()) {
        let engine = MpcEngine::with_seed(seed);
        prop_assert!(engine.generate_masking_noise(magnitude).abs() <= magnitude);
    }
}
