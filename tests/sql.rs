//! End-to-end planner/executor tests driven against the in-memory fakes in
//! `tests/common`: one root SQL statement in, rows out.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use dataverse_sql_engine::error::EngineError;
use dataverse_sql_engine::options::PlannerOptions;
use dataverse_sql_engine::plan::dml::{DmlExecuteState, DmlMode};
use dataverse_sql_engine::plan::node::PlanNode;
use dataverse_sql_engine::plan::operators::{AggOp, MergeAggregateState, SingleRowState};
use dataverse_sql_engine::plan::scan::AdaptiveAggregateScanState;
use dataverse_sql_engine::planner::plan_statement;
use dataverse_sql_engine::script::scope::VariableScope;
use dataverse_sql_engine::value::{Raw, Row, Value};
use uuid::Uuid;

use common::{parse_statement, row, test_context, uuid_value, FakeFetchXmlClient, FakeMetadataClient, FakeRecordWriteClient};

async fn run_to_rows(plan: &mut PlanNode, ctx: &Arc<dataverse_sql_engine::context::ExecContext>) -> Vec<Row> {
    let scope = VariableScope::new();
    let mut out = Vec::new();
    while let Some(r) = plan.next_row(ctx, &scope).await.expect("plan execution should not fail") {
        out.push(r);
    }
    out
}

fn ts(s: &str) -> Value {
    Value::from_raw(Raw::Timestamp(DateTime::parse_from_rfc3339(s).unwrap()))
}

// --- scenario (a): bare COUNT(*) fast path ---------------------------------

#[tokio::test]
async fn count_star_uses_metadata_record_count() {
    let fetchxml = Arc::new(FakeFetchXmlClient::new());
    let metadata = Arc::new(FakeMetadataClient::new().with_count("account", 42));
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml.clone(), metadata, write, 1);

    let stmt = parse_statement("SELECT COUNT(*) FROM account");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("count").unwrap().display_text(), "42");
    assert_eq!(fetchxml.call_count(), 0);
}

#[tokio::test]
async fn count_star_falls_back_when_metadata_has_no_count() {
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table(
        "account",
        vec![
            row("account", &[("accountid", uuid_value(Uuid::new_v4()))]),
            row("account", &[("accountid", uuid_value(Uuid::new_v4()))]),
            row("account", &[("accountid", uuid_value(Uuid::new_v4()))]),
        ],
    ));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml.clone(), metadata, write, 1);

    let stmt = parse_statement("SELECT COUNT(*) FROM account");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("count").unwrap().display_text(), "3");
    assert!(fetchxml.call_count() >= 1);
}

// --- invariant 7: WHERE collapses Unknown to false -------------------------

#[tokio::test]
async fn where_clause_drops_unknown_predicate_rows() {
    let rows = vec![
        row("contact", &[("contactid", uuid_value(Uuid::new_v4())), ("age", Value::int(30))]),
        row("contact", &[("contactid", uuid_value(Uuid::new_v4())), ("age", Value::null())]),
        row("contact", &[("contactid", uuid_value(Uuid::new_v4())), ("age", Value::int(45))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("contact", rows));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    // `age > 20` is Unknown for the null row; it must not appear in the result.
    let stmt = parse_statement("SELECT age FROM contact WHERE age > 20");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    let mut ages: Vec<String> = rows.iter().map(|r| r.get("age").unwrap().display_text()).collect();
    ages.sort();
    assert_eq!(ages, vec!["30", "45"]);
}

// --- invariant 8: UNION dedups, UNION ALL preserves multiplicity -----------

#[tokio::test]
async fn union_dedupes_full_row_tuples() {
    let fetchxml = Arc::new(
        FakeFetchXmlClient::new()
            .with_table(
                "account_a",
                vec![row("account_a", &[("name", Value::string("Acme"))]), row("account_a", &[("name", Value::string("Globex"))])],
            )
            .with_table(
                "account_b",
                vec![row("account_b", &[("name", Value::string("Acme"))]), row("account_b", &[("name", Value::string("Initech"))])],
            ),
    );
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    let stmt = parse_statement("SELECT name FROM account_a UNION SELECT name FROM account_b");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    let mut names: Vec<String> = rows.iter().map(|r| r.get("name").unwrap().display_text()).collect();
    names.sort();
    assert_eq!(names, vec!["Acme", "Globex", "Initech"]);
}

#[tokio::test]
async fn union_all_preserves_duplicates() {
    let fetchxml = Arc::new(
        FakeFetchXmlClient::new()
            .with_table(
                "account_a",
                vec![row("account_a", &[("name", Value::string("Acme"))]), row("account_a", &[("name", Value::string("Globex"))])],
            )
            .with_table(
                "account_b",
                vec![row("account_b", &[("name", Value::string("Acme"))]), row("account_b", &[("name", Value::string("Initech"))])],
            ),
    );
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    let stmt = parse_statement("SELECT name FROM account_a UNION ALL SELECT name FROM account_b");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    let mut names: Vec<String> = rows.iter().map(|r| r.get("name").unwrap().display_text()).collect();
    names.sort();
    assert_eq!(names, vec!["Acme", "Acme", "Globex", "Initech"]);
}

// --- scenario (c): IN (subquery) rewritten to an INNER JOIN ----------------

#[tokio::test]
async fn in_subquery_rewrites_to_inner_join() {
    let accounts = vec![
        row("account", &[("accountid", Value::string("acc-1")), ("name", Value::string("Acme"))]),
        row("account", &[("accountid", Value::string("acc-2")), ("name", Value::string("Globex"))]),
        row("account", &[("accountid", Value::string("acc-3")), ("name", Value::string("Initech"))]),
    ];
    let contacts = vec![
        row("contact", &[("accountid", Value::string("acc-1")), ("country", Value::string("US"))]),
        row("contact", &[("accountid", Value::string("acc-2")), ("country", Value::string("UK"))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("account", accounts).with_table("contact", contacts));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    let stmt =
        parse_statement("SELECT name FROM account WHERE accountid IN (SELECT accountid FROM contact WHERE country = 'US')");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name").unwrap().display_text(), "Acme");
}

// --- scenario (d): NOT IN (subquery) two-phase literal fallback ------------

#[tokio::test]
async fn not_in_subquery_rewrites_to_literal_list() {
    let contacts = vec![
        row("contact", &[("accountid", Value::string("id-1"))]),
        row("contact", &[("accountid", Value::string("id-2"))]),
        row("contact", &[("accountid", Value::string("id-3"))]),
    ];
    let blocked = vec![row("blocked", &[("accountid", Value::string("id-2"))])];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("contact", contacts).with_table("blocked", blocked));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    let stmt = parse_statement("SELECT accountid FROM contact WHERE accountid NOT IN (SELECT accountid FROM blocked)");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    let mut ids: Vec<String> = rows.iter().map(|r| r.get("accountid").unwrap().display_text()).collect();
    ids.sort();
    assert_eq!(ids, vec!["id-1", "id-3"]);
}

#[tokio::test]
async fn not_in_subquery_fallback_errors_past_condition_value_limit() {
    let mut blocked = Vec::with_capacity(5001);
    for i in 0..5001 {
        blocked.push(row("blocked", &[("accountid", Value::string(format!("id-{i}")))]));
    }
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("blocked", blocked));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    let stmt = parse_statement("SELECT accountid FROM contact WHERE accountid NOT IN (SELECT accountid FROM blocked)");
    let err = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::OperationNotSupported(_)));
}

// --- scenario (e): window function with an explicit frame ------------------

#[tokio::test]
async fn window_function_with_explicit_frame() {
    let opps = vec![
        row(
            "opportunity",
            &[("accountid", Value::string("a1")), ("region", Value::string("west")), ("revenue", Value::double(10.0))],
        ),
        row(
            "opportunity",
            &[("accountid", Value::string("a2")), ("region", Value::string("west")), ("revenue", Value::double(20.0))],
        ),
        row(
            "opportunity",
            &[("accountid", Value::string("a3")), ("region", Value::string("west")), ("revenue", Value::double(30.0))],
        ),
        row(
            "opportunity",
            &[("accountid", Value::string("a4")), ("region", Value::string("west")), ("revenue", Value::double(40.0))],
        ),
        row(
            "opportunity",
            &[("accountid", Value::string("a5")), ("region", Value::string("west")), ("revenue", Value::double(50.0))],
        ),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("opportunity", opps));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    let stmt = parse_statement(
        "SELECT accountid, revenue, SUM(revenue) OVER (PARTITION BY region ORDER BY revenue ROWS BETWEEN 2 PRECEDING AND CURRENT ROW) AS running_total FROM opportunity",
    );
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows.len(), 5);
    let totals: Vec<f64> = rows.iter().map(|r| r.get("running_total").unwrap().display_text().parse().unwrap()).collect();
    assert_eq!(totals, vec![10.0, 30.0, 60.0, 90.0, 120.0]);
}

// --- invariant 9: default window frame and ROW_NUMBER uniqueness -----------

#[tokio::test]
async fn bare_row_number_assigns_unique_ascending_positions() {
    let opps = vec![
        row("opportunity", &[("accountid", Value::string("a1"))]),
        row("opportunity", &[("accountid", Value::string("a2"))]),
        row("opportunity", &[("accountid", Value::string("a3"))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("opportunity", opps));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    let stmt = parse_statement("SELECT accountid, ROW_NUMBER() OVER () AS rn FROM opportunity");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    let rns: Vec<i64> = rows.iter().map(|r| r.get("rn").unwrap().display_text().parse().unwrap()).collect();
    assert_eq!(rns, vec![1, 2, 3]);
}

// --- scenario (b): partitioned SUM fan-out ----------------------------------

#[tokio::test]
async fn partitioned_aggregate_sums_across_partitions() {
    let opps = vec![
        row("opportunity", &[("createdon", ts("2020-06-15T00:00:00+00:00")), ("revenue", Value::double(100.0))]),
        row("opportunity", &[("createdon", ts("2021-06-15T00:00:00+00:00")), ("revenue", Value::double(200.0))]),
        row("opportunity", &[("createdon", ts("2022-06-15T00:00:00+00:00")), ("revenue", Value::double(300.0))]),
        row("opportunity", &[("createdon", ts("2023-06-15T00:00:00+00:00")), ("revenue", Value::double(400.0))]),
        row("opportunity", &[("createdon", ts("2024-06-15T00:00:00+00:00")), ("revenue", Value::double(500.0))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("opportunity", opps));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml.clone(), metadata, write, 4);

    let options = PlannerOptions {
        pool_capacity: Some(4),
        estimated_record_count: Some(250_000),
        min_date: Some(DateTime::parse_from_rfc3339("2020-01-01T00:00:00+00:00").unwrap()),
        max_date: Some(DateTime::parse_from_rfc3339("2024-12-31T00:00:00+00:00").unwrap()),
        ..Default::default()
    };

    let stmt = parse_statement("SELECT SUM(revenue) AS total, YEAR(createdon) AS y FROM opportunity GROUP BY YEAR(createdon)");
    let mut plan = plan_statement(&stmt, &ctx, &options).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows.len(), 5);
    let mut by_year: Vec<(i64, f64)> = rows
        .iter()
        .map(|r| (r.get("y").unwrap().display_text().parse().unwrap(), r.get("total").unwrap().display_text().parse().unwrap()))
        .collect();
    by_year.sort_by_key(|(y, _)| *y);
    assert_eq!(by_year, vec![(2020, 100.0), (2021, 200.0), (2022, 300.0), (2023, 400.0), (2024, 500.0)]);
    // Seven date-range ticks sized by `max_records_per_partition`, one backend round trip each.
    assert_eq!(fetchxml.call_count(), 7);
}

// --- invariant 3: merging partitions matches a single whole-range scan -----

#[tokio::test]
async fn merging_partitions_matches_a_single_unpartitioned_scan() {
    let opps = vec![
        row("opportunity", &[("createdon", ts("2020-03-01T00:00:00+00:00")), ("revenue", Value::double(10.0))]),
        row("opportunity", &[("createdon", ts("2020-09-01T00:00:00+00:00")), ("revenue", Value::double(25.0))]),
        row("opportunity", &[("createdon", ts("2021-03-01T00:00:00+00:00")), ("revenue", Value::double(40.0))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("opportunity", opps));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    let min_date = DateTime::parse_from_rfc3339("2020-01-01T00:00:00+00:00").unwrap();
    let max_date = DateTime::parse_from_rfc3339("2021-12-31T00:00:00+00:00").unwrap();
    // Mirrors what the transpiler renders for `SUM(revenue) GROUP BY
    // YEAR(createdon)`: a real pre-aggregated partial per partition, not a
    // raw-record passthrough.
    let template = "<fetch aggregate=\"true\"><entity name=\"opportunity\">\
        <attribute name=\"createdon\" groupby=\"true\" dategrouping=\"year\" alias=\"year\" />\
        <attribute name=\"revenue\" aggregate=\"sum\" alias=\"total\" />\
        <filter>{date_filter}</filter></entity></fetch>"
        .to_string();
    let aggregates = vec![("total".to_string(), AggOp::Sum, "total".to_string())];

    let mid = min_date + (max_date - min_date) / 2;
    let partitioned = PlanNode::MergeAggregate(MergeAggregateState::new(
        vec![
            PlanNode::AdaptiveAggregateScan(AdaptiveAggregateScanState::new(template.clone(), "createdon".into(), min_date, mid, 16)),
            PlanNode::AdaptiveAggregateScan(AdaptiveAggregateScanState::new(template.clone(), "createdon".into(), mid, max_date, 16)),
        ],
        vec!["year".into()],
        aggregates.clone(),
        HashMap::new(),
        HashMap::new(),
    ));

    let unpartitioned = PlanNode::MergeAggregate(MergeAggregateState::new(
        vec![PlanNode::AdaptiveAggregateScan(AdaptiveAggregateScanState::new(template, "createdon".into(), min_date, max_date, 16))],
        vec!["year".into()],
        aggregates,
        HashMap::new(),
        HashMap::new(),
    ));

    let mut a = partitioned;
    let mut b = unpartitioned;
    let mut a_rows = run_to_rows(&mut a, &ctx).await;
    let mut b_rows = run_to_rows(&mut b, &ctx).await;
    let key = |r: &Row| (r.get("year").unwrap().display_text(), r.get("total").unwrap().display_text());
    a_rows.sort_by_key(key);
    b_rows.sort_by_key(key);

    assert_eq!(a_rows.len(), 2);
    assert_eq!(a_rows.iter().map(key).collect::<Vec<_>>(), b_rows.iter().map(key).collect::<Vec<_>>());
}

// --- AVG/STDEV/VAR merge via partial-stat companions ------------------------

#[tokio::test]
async fn partitioned_avg_merges_via_sum_and_count_companions() {
    let opps = vec![
        row("opportunity", &[("createdon", ts("2020-06-15T00:00:00+00:00")), ("revenue", Value::double(100.0))]),
        row("opportunity", &[("createdon", ts("2021-06-15T00:00:00+00:00")), ("revenue", Value::double(200.0))]),
        row("opportunity", &[("createdon", ts("2022-06-15T00:00:00+00:00")), ("revenue", Value::double(300.0))]),
        row("opportunity", &[("createdon", ts("2023-06-15T00:00:00+00:00")), ("revenue", Value::double(400.0))]),
        row("opportunity", &[("createdon", ts("2024-06-15T00:00:00+00:00")), ("revenue", Value::double(500.0))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("opportunity", opps));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml.clone(), metadata, write, 4);

    let options = PlannerOptions {
        pool_capacity: Some(4),
        estimated_record_count: Some(250_000),
        min_date: Some(DateTime::parse_from_rfc3339("2020-01-01T00:00:00+00:00").unwrap()),
        max_date: Some(DateTime::parse_from_rfc3339("2024-12-31T00:00:00+00:00").unwrap()),
        ..Default::default()
    };

    // Averaging every partition's own avg would be wrong the moment
    // partitions hold unequal counts; this only comes out to 300 if the
    // merge actually divides the summed sum by the summed count.
    let stmt = parse_statement("SELECT AVG(revenue) AS avg_rev FROM opportunity");
    let mut plan = plan_statement(&stmt, &ctx, &options).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows.len(), 1);
    let avg: f64 = rows[0].get("avg_rev").unwrap().display_text().parse().unwrap();
    assert!((avg - 300.0).abs() < 1e-9, "expected avg 300.0, got {avg}");
}

#[tokio::test]
async fn partitioned_stdev_and_var_merge_via_welford_companions() {
    let opps = vec![
        row("opportunity", &[("createdon", ts("2020-06-15T00:00:00+00:00")), ("revenue", Value::double(100.0))]),
        row("opportunity", &[("createdon", ts("2021-06-15T00:00:00+00:00")), ("revenue", Value::double(200.0))]),
        row("opportunity", &[("createdon", ts("2022-06-15T00:00:00+00:00")), ("revenue", Value::double(300.0))]),
        row("opportunity", &[("createdon", ts("2023-06-15T00:00:00+00:00")), ("revenue", Value::double(400.0))]),
        row("opportunity", &[("createdon", ts("2024-06-15T00:00:00+00:00")), ("revenue", Value::double(500.0))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("opportunity", opps));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml.clone(), metadata, write, 4);

    let options = PlannerOptions {
        pool_capacity: Some(4),
        estimated_record_count: Some(250_000),
        min_date: Some(DateTime::parse_from_rfc3339("2020-01-01T00:00:00+00:00").unwrap()),
        max_date: Some(DateTime::parse_from_rfc3339("2024-12-31T00:00:00+00:00").unwrap()),
        ..Default::default()
    };

    let stmt = parse_statement("SELECT STDEV(revenue) AS sd, VAR(revenue) AS vr FROM opportunity");
    let mut plan = plan_statement(&stmt, &ctx, &options).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows.len(), 1);
    // Sample variance over {100,200,300,400,500}: mean 300, sum of squared
    // deviations 100000, divided by (n - 1) = 4.
    let var: f64 = rows[0].get("vr").unwrap().display_text().parse().unwrap();
    let sd: f64 = rows[0].get("sd").unwrap().display_text().parse().unwrap();
    assert!((var - 25000.0).abs() < 1e-6, "expected variance 25000.0, got {var}");
    assert!((sd - 25000.0_f64.sqrt()).abs() < 1e-6, "expected stdev sqrt(25000), got {sd}");
}

// --- DML ---------------------------------------------------------------

#[tokio::test]
async fn insert_values_writes_one_record() {
    let fetchxml = Arc::new(FakeFetchXmlClient::new());
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write.clone(), 1);

    let stmt = parse_statement("INSERT INTO account (accountid, name) VALUES ('11111111-1111-1111-1111-111111111111', 'Acme')");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows[0].get("inserted_count").unwrap().display_text(), "1");
    let created = write.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, "account");
    assert_eq!(created[0].1.get("name").unwrap().display_text(), "Acme");
}

#[tokio::test]
async fn insert_select_maps_columns_positionally() {
    let accounts = vec![
        row("account", &[("accountid", Value::string("acc-1")), ("name", Value::string("Acme"))]),
        row("account", &[("accountid", Value::string("acc-2")), ("name", Value::string("Globex"))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("account", accounts));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write.clone(), 1);

    let stmt = parse_statement("INSERT INTO account_archive (accountid, name) SELECT accountid, name FROM account");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows[0].get("inserted_count").unwrap().display_text(), "2");
    let created = write.created.lock().unwrap();
    assert_eq!(created.len(), 2);
    let mut names: Vec<String> = created.iter().map(|(_, v)| v.get("name").unwrap().display_text()).collect();
    names.sort();
    assert_eq!(names, vec!["Acme", "Globex"]);
}

#[tokio::test]
async fn update_writes_only_matching_rows() {
    let contacts = vec![
        row("contact", &[("contactid", uuid_value(Uuid::new_v4())), ("country", Value::string("US"))]),
        row("contact", &[("contactid", uuid_value(Uuid::new_v4())), ("country", Value::string("US"))]),
        row("contact", &[("contactid", uuid_value(Uuid::new_v4())), ("country", Value::string("UK"))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("contact", contacts));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write.clone(), 1);

    let stmt = parse_statement("UPDATE contact SET email = 'new@example.com' WHERE country = 'US'");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows[0].get("updated_count").unwrap().display_text(), "2");
    let updated = write.updated.lock().unwrap();
    assert_eq!(updated.len(), 2);
    for (_, _, values) in updated.iter() {
        assert_eq!(values.get("email").unwrap().display_text(), "new@example.com");
    }
}

#[tokio::test]
async fn delete_removes_only_matching_rows() {
    let contacts = vec![
        row("contact", &[("contactid", uuid_value(Uuid::new_v4())), ("country", Value::string("US"))]),
        row("contact", &[("contactid", uuid_value(Uuid::new_v4())), ("country", Value::string("UK"))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("contact", contacts));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write.clone(), 1);

    let stmt = parse_statement("DELETE FROM contact WHERE country = 'UK'");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows[0].get("deleted_count").unwrap().display_text(), "1");
    assert_eq!(write.deleted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn merge_plan_only_dispatches_update_or_insert_by_match_column() {
    let staging = vec![
        row("account_staging", &[("accountid", uuid_value(Uuid::new_v4()))]),
        row("account_staging", &[("accountid", Value::null())]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("account_staging", staging));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write.clone(), 1);

    let stmt = parse_statement(
        "MERGE INTO account USING account_staging ON account.accountid = account_staging.accountid \
         WHEN MATCHED THEN UPDATE SET name = account_staging.name \
         WHEN NOT MATCHED THEN INSERT (accountid) VALUES (account_staging.accountid)",
    );
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows[0].get("source_count").unwrap().display_text(), "2");
    assert_eq!(rows[0].get("updated_count").unwrap().display_text(), "1");
    assert_eq!(rows[0].get("inserted_count").unwrap().display_text(), "1");
    assert_eq!(write.updated.lock().unwrap().len(), 1);
    assert_eq!(write.created.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn dml_row_cap_is_enforced_before_any_write() {
    let contacts = vec![
        row("contact", &[("contactid", uuid_value(Uuid::new_v4()))]),
        row("contact", &[("contactid", uuid_value(Uuid::new_v4()))]),
        row("contact", &[("contactid", uuid_value(Uuid::new_v4()))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("contact", contacts));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    let ctx = test_context(fetchxml, metadata, write.clone(), 1);

    let options = PlannerOptions { dml_row_cap: Some(2), ..Default::default() };
    let stmt = parse_statement("DELETE FROM contact");
    let mut plan = plan_statement(&stmt, &ctx, &options).await.unwrap();
    let scope = VariableScope::new();
    let err = plan.next_row(&ctx, &scope).await.unwrap_err();

    assert!(matches!(err, EngineError::RowCapExceeded { cap: 2 }));
    assert_eq!(write.deleted.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn continue_on_error_tallies_failures_instead_of_aborting() {
    let contacts = vec![
        row("contact", &[("contactid", uuid_value(Uuid::new_v4()))]),
        row("contact", &[("contactid", uuid_value(Uuid::new_v4()))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("contact", contacts));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    write.fail_on("contact");
    let ctx = test_context(fetchxml, metadata, write.clone(), 1);

    let options = PlannerOptions { continue_on_error: true, ..Default::default() };
    let stmt = parse_statement("DELETE FROM contact");
    let mut plan = plan_statement(&stmt, &ctx, &options).await.unwrap();
    let rows = run_to_rows(&mut plan, &ctx).await;

    assert_eq!(rows[0].get("errors").unwrap().display_text(), "2");
    assert_eq!(rows[0].get("deleted_count").unwrap().display_text(), "0");
}

#[tokio::test]
async fn continue_on_error_false_aborts_on_first_failure() {
    let contacts = vec![
        row("contact", &[("contactid", uuid_value(Uuid::new_v4()))]),
        row("contact", &[("contactid", uuid_value(Uuid::new_v4()))]),
    ];
    let fetchxml = Arc::new(FakeFetchXmlClient::new().with_table("contact", contacts));
    let metadata = Arc::new(FakeMetadataClient::new());
    let write = Arc::new(FakeRecordWriteClient::new());
    write.fail_on("contact");
    let ctx = test_context(fetchxml, metadata, write.clone(), 1);

    let stmt = parse_statement("DELETE FROM contact");
    let mut plan = plan_statement(&stmt, &ctx, &PlannerOptions::default()).await.unwrap();
    let scope = VariableScope::new();
    let err = plan.next_row(&ctx, &scope).await.unwrap_err();

    assert!(matches!(err, EngineError::DmlPerRecord { index: 0, .. }));
}

#[tokio::test]
async fn dml_execute_state_insert_reports_per_record_index_on_failure() {
    // Built directly from the operator rather than through the planner, to
    // pin down `DmlExecuteState`'s own contract independent of the planner's
    // routing.
    let write = Arc::new(FakeRecordWriteClient::new());
    write.fail_on("contact");
    let fetchxml = Arc::new(FakeFetchXmlClient::new());
    let metadata = Arc::new(FakeMetadataClient::new());
    let ctx = test_context(fetchxml, metadata, write, 1);

    let driving = PlanNode::SingleRow(SingleRowState::new());
    let mut state = DmlExecuteState::new(driving, "contact".to_string(), DmlMode::Insert { columns: Vec::new() }, None, false);
    let scope = VariableScope::new();
    let err = state.next_row(&ctx, &scope).await.unwrap_err();
    assert!(matches!(err, EngineError::DmlPerRecord { index: 0, .. }));
}
