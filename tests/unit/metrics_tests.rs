//! Unit tests for metrics projection and totals.

use agent_kernel::kernel::lifecycle;
use agent_kernel::models::agent::{Agent, AgentState, ExitStatusInfo};
use agent_kernel::models::metrics::{uptime_seconds, AgentMetrics, Snapshot};
use chrono::{Duration, Utc};

fn agent(id: u64) -> Agent {
    Agent::new(id, format!("agent-{id}"), "/bin/sh".into(), vec!["-c".into()], None, Some(4096))
}

#[test]
fn uptime_is_zero_before_start() {
    let agent = agent(1);
    assert_eq!(uptime_seconds(&agent, Utc::now()), 0);
}

#[test]
fn uptime_counts_from_start() {
    let mut agent = agent(1);
    let start = Utc::now();
    lifecycle::begin_start(&mut agent, 10, None, start).expect("start");
    assert_eq!(uptime_seconds(&agent, start + Duration::seconds(42)), 42);
}

#[test]
fn uptime_freezes_once_terminal() {
    let mut agent = agent(1);
    let start = Utc::now();
    lifecycle::begin_start(&mut agent, 10, None, start).expect("start");
    lifecycle::observe_exit(
        &mut agent,
        ExitStatusInfo {
            code: Some(1),
            signal: None,
        },
        false,
        start + Duration::seconds(5),
    );

    assert_eq!(uptime_seconds(&agent, start + Duration::seconds(500)), 5);
}

#[test]
fn projection_copies_record_fields() {
    let mut record = agent(3);
    record.parent_id = Some(1);
    record.child_ids = vec![4, 5];
    record.llm_requests = 2;
    record.llm_tokens = 99;
    record.memory_bytes = 1 << 20;

    let metrics = AgentMetrics::from_agent(&record, Utc::now());
    assert_eq!(metrics.id, 3);
    assert_eq!(metrics.name, "agent-3");
    assert_eq!(metrics.state, AgentState::Created);
    assert_eq!(metrics.parent_id, Some(1));
    assert_eq!(metrics.child_ids, vec![4, 5]);
    assert_eq!(metrics.llm_tokens, 99);
    assert_eq!(metrics.memory_bytes, 1 << 20);
    assert_eq!(metrics.memory_limit_bytes, Some(4096));
    assert_eq!(metrics.state_history, vec![AgentState::Created]);
}

#[test]
fn metrics_serialize_with_snake_case_state() {
    let metrics = AgentMetrics::from_agent(&agent(1), Utc::now());
    let value = serde_json::to_value(&metrics).expect("serialize");
    assert_eq!(value["state"], "created");
    assert_eq!(value["parent_id"], serde_json::Value::Null);
    assert_eq!(value["child_ids"], serde_json::json!([]));
}

#[test]
fn totals_count_states_and_sum_usage() {
    let now = Utc::now();
    let mut running = agent(1);
    lifecycle::begin_start(&mut running, 11, None, now).expect("start");
    lifecycle::confirm_alive(&mut running);
    running.llm_requests = 3;
    running.llm_tokens = 150;
    running.memory_bytes = 1000;

    let mut other = agent(2);
    lifecycle::begin_start(&mut other, 12, None, now).expect("start");
    lifecycle::confirm_alive(&mut other);
    other.llm_requests = 1;
    other.llm_tokens = 50;
    other.memory_bytes = 500;

    let created = agent(3);

    let snapshot = Snapshot::from_metrics(
        [&running, &other, &created]
            .into_iter()
            .map(|a| AgentMetrics::from_agent(a, now))
            .collect(),
    );

    assert_eq!(snapshot.totals.total, 3);
    assert_eq!(snapshot.totals.count(AgentState::Running), 2);
    assert_eq!(snapshot.totals.count(AgentState::Created), 1);
    assert_eq!(snapshot.totals.count(AgentState::Failed), 0);
    assert_eq!(snapshot.totals.llm_requests, 4);
    assert_eq!(snapshot.totals.llm_tokens, 200);
    assert_eq!(snapshot.totals.memory_bytes, 1500);
    assert_eq!(snapshot.agent(2).map(|m| m.pid), Some(Some(12)));
    assert!(snapshot.agent(9).is_none());
}

#[test]
fn empty_snapshot_has_zero_totals() {
    let snapshot = Snapshot::from_metrics(Vec::new());
    assert_eq!(snapshot.totals.total, 0);
    assert!(snapshot.agents.is_empty());
}
