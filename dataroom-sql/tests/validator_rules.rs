use dataroom_core::AggregateFunction;
use dataroom_sql::{Clause, SqlSafetyValidator, ValidationReport, Violation};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn validator() -> SqlSafetyValidator {
    SqlSafetyValidator::default()
}

#[test]
fn grouped_average_with_count_guard_costs_point_six() {
    let report = validator().validate(
        "SELECT state, AVG(age), COUNT(*) FROM patients GROUP BY state HAVING COUNT(*) >= 25",
    );
    assert_eq!(
        report,
        ValidationReport {
            valid: true,
            estimated_epsilon: Some(0.6),
            errors: Vec::new(),
        }
    );
}

#[test]
fn select_star_names_the_rule() {
    let report = validator().validate("SELECT * FROM patients");
    assert!(!report.valid);
    assert_eq!(report.estimated_epsilon, None);
    assert!(report
        .errors
        .iter()
        .any(|error| error.contains("Cannot SELECT *")));
}

#[test]
fn unparsable_sql_yields_a_single_syntax_error() {
    let report = validator().validate("SELECT COUNT(* FROM");
    assert!(!report.valid);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("Invalid SQL syntax"));
}

#[test]
fn grouped_query_without_having_is_rejected() {
    let violations = validator()
        .analyze("SELECT state, COUNT(*) FROM patients GROUP BY state")
        .unwrap_err();
    assert_eq!(violations, vec![Violation::MissingKAnonymity { floor: 25 }]);
}

#[test]
fn subqueries_are_found_in_every_clause() {
    let cases = [
        (
            "SELECT (SELECT MAX(age) FROM patients) FROM patients",
            Clause::TargetList,
        ),
        (
            "WITH adults AS (SELECT age FROM patients) SELECT COUNT(*) FROM adults",
            Clause::From,
        ),
        (
            "SELECT COUNT(*) FROM (patients p JOIN (SELECT id FROM visits) v ON p.id = v.id)",
            Clause::From,
        ),
        (
            "SELECT COUNT(*) FROM patients WHERE EXISTS (SELECT 1 FROM visits)",
            Clause::Where,
        ),
        (
            "SELECT COUNT(*) FROM patients WHERE age > 10 AND id IN (SELECT id FROM visits)",
            Clause::Where,
        ),
    ];
    for (sql, clause) in cases {
        let violations = validator().analyze(sql).unwrap_err();
        assert!(
            violations.contains(&Violation::Subquery { clause }),
            "{sql}: {violations:?}"
        );
    }
}

#[test]
fn statement_kinds_outside_select_are_rejected() {
    for sql in [
        "DROP TABLE patients",
        "SELECT COUNT(*) FROM a UNION SELECT COUNT(*) FROM b",
        "SELECT COUNT(*) FROM a; SELECT COUNT(*) FROM b",
    ] {
        let report = validator().validate(sql);
        assert!(!report.valid, "{sql} should be rejected");
        assert_eq!(report.errors.len(), 1, "{sql}: {:?}", report.errors);
    }
}

#[test]
fn stddev_is_whitelisted_and_weighted_high() {
    let validated = validator()
        .analyze("SELECT STDDEV(age), MIN(age) FROM patients")
        .unwrap();
    assert_eq!(validated.estimated_epsilon, 0.6);
    assert_eq!(
        validated.aggregate_functions().into_iter().collect::<Vec<_>>(),
        vec![AggregateFunction::Min, AggregateFunction::Stddev]
    );
}

fn query_fragments() -> impl Strategy<Value = String> {
    let projection = prop::sample::select(vec![
        "*",
        "COUNT(*)",
        "state, AVG(age)",
        "SUM(age), MAX(age)",
        "MEDIAN(age)",
        "age",
        "(SELECT 1)",
    ]);
    let tail = prop::sample::select(vec![
        "",
        " WHERE age > 18",
        " GROUP BY state",
        " GROUP BY state HAVING COUNT(*) >= 25",
        " GROUP BY state HAVING COUNT(*) > 3",
        " WHERE id IN (SELECT id FROM visits)",
    ]);
    (projection, tail).prop_map(|(projection, tail)| format!("SELECT {projection} FROM patients{tail}"))
}

proptest! {
    #[test]
    fn validation_is_idempotent(sql in query_fragments()) {
        let validator = validator();
        let first = validator.validate(&sql);
        let second = validator.validate(&sql);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn accepted_queries_cost_at_least_the_floor(sql in query_fragments()) {
        let report = validator().validate(&sql);
        if report.valid {
            prop_assert!(report.estimated_epsilon.unwrap_or_default() >= 0.1);
            prop_assert!(report.errors.is_empty());
        } else {
            prop_assert!(!report.errors.is_empty());
        }
    }
}
