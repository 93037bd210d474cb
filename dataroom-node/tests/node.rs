use std::path::Path;
use std::sync::OnceLock;

use dataroom_core::{AuditAction, ComparisonOp, DatasetId, FilterPredicate};
use dataroom_exec::{ExecuteError, RunStatus, SubmitError};
use dataroom_mpc::{CoordinatorKeyPair, MpcError, QueryType, RoomStatus};
use dataroom_node::config::{load_config, Config, ConfigFormat};
use dataroom_node::service::{DataRoomNode, RoomRequest};
use pretty_assertions::assert_eq;

fn keys() -> CoordinatorKeyPair {
    static KEYS: OnceLock<CoordinatorKeyPair> = OnceLock::new();
    KEYS.get_or_init(|| CoordinatorKeyPair::generate(1024).unwrap())
        .clone()
}

fn shipped_config() -> Config {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/configs/dataroom-node.toml");
    load_config(Path::new(path), ConfigFormat::Auto).unwrap()
}

fn node(config: &Config) -> DataRoomNode {
    DataRoomNode::with_keys(config, keys()).unwrap()
}

#[test]
fn shipped_config_loads() {
    let config = shipped_config();
    assert_eq!(config.datasets.len(), 3);
    assert_eq!(config.node.actor, "analyst@dataroom");
    assert_eq!(config.dp.bounds["revenue"].upper, 1000.0);

    let node = node(&config);
    assert_eq!(
        node.catalog().available_backends(),
        vec!["dp_backend", "he_backend", "mpc_backend"]
    );
    let budgets = node.budgets();
    assert_eq!(budgets.len(), 3);
    assert_eq!(budgets[2].1.total, 1.0);
}

#[test]
fn validation_reports_cost_and_rejections() {
    let node = node(&Config::sample());
    let report = node.validate_sql("SELECT COUNT(*), AVG(revenue) FROM visits");
    assert!(report.valid);
    assert_eq!(report.estimated_epsilon, Some(0.6));

    let rejected = node.validate_sql("SELECT * FROM visits");
    assert!(!rejected.valid);
    assert!(rejected.errors[0].starts_with("Cannot SELECT *"));
}

#[tokio::test]
async fn dp_query_spends_budget() {
    let node = node(&Config::sample());
    let dataset = DatasetId::from("clinic-a");
    let run = node
        .run_query(
            "SELECT COUNT(*) FROM visits WHERE region = 'west'",
            dataset.clone(),
            "dp_backend",
            None,
        )
        .await
        .unwrap();
    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(run.epsilon_consumed(), 0.1);
    assert_eq!(node.budget(&dataset).unwrap().consumed, 0.1);
    assert_eq!(node.runs().len(), 1);

    let actions: Vec<AuditAction> = node.audit_trail().iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::QueryCreated, AuditAction::QueryExecuted]
    );
    assert_eq!(node.audit_trail()[0].actor.as_str(), "dataroom-node");
}

#[tokio::test]
async fn rejected_sql_never_reaches_a_backend() {
    let node = node(&Config::sample());
    let err = node
        .run_query("SELECT age FROM visits", "clinic-a".into(), "dp_backend", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecuteError::Submit(SubmitError::Validation { .. })
    ));
    assert!(node.runs().is_empty());
}

#[tokio::test]
async fn data_room_sums_across_clinics() {
    let config = shipped_config();
    let node = node(&config);
    let request = RoomRequest {
        name: "west revenue".into(),
        query_type: QueryType::Sum,
        column: "revenue".into(),
        datasets: vec!["clinic-a".into(), "clinic-b".into(), "clinic-c".into()],
        filters: vec![FilterPredicate::new("region", ComparisonOp::Eq, "west")],
        apply_dp_noise: false,
    };
    let mut room = node.open_room(&request).unwrap();
    assert_eq!(room.status(), RoomStatus::Attested);

    let result = node.execute_room(&mut room).await.unwrap();
    let expected = 120.0 + 45.0 + 99.9 + 200.0 + 300.0 + 25.0;
    assert!((result.value - expected).abs() < 1e-6, "got {}", result.value);
    assert_eq!(room.status(), RoomStatus::Completed);

    let actions: Vec<AuditAction> = node.audit_trail().iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![AuditAction::DataRoomAttested, AuditAction::MpcExecuted]
    );
}

#[tokio::test]
async fn data_room_needs_two_organizations() {
    let node = node(&Config::sample());
    let request = RoomRequest {
        name: "solo".into(),
        query_type: QueryType::Count,
        column: "age".into(),
        datasets: vec!["clinic-a".into()],
        filters: Vec::new(),
        apply_dp_noise: true,
    };
    let mut room = node.open_room(&request).unwrap();
    let err = node.execute_room(&mut room).await.unwrap_err();
    assert!(matches!(err, MpcError::NotEnoughParties { actual: 1, .. }));
    assert_eq!(room.status(), RoomStatus::Pending);
}
