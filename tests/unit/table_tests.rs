//! Unit tests for the agent table: id allocation, hierarchy links, prune.

use std::sync::Arc;

use agent_kernel::kernel::lifecycle;
use agent_kernel::kernel::table::{AgentTable, NewAgent};
use agent_kernel::models::agent::{AgentId, AgentState, LaunchErrorKind};
use agent_kernel::AppError;
use chrono::Utc;

fn new_agent(name: &str, parent_id: Option<AgentId>) -> NewAgent {
    NewAgent {
        name: name.into(),
        command: "/bin/true".into(),
        parent_id,
        ..NewAgent::default()
    }
}

async fn finish(table: &AgentTable, id: AgentId) {
    table
        .with_agent(id, |agent| {
            lifecycle::fail_launch(agent, LaunchErrorKind::ExecFailed, Utc::now());
        })
        .await
        .expect("agent exists");
}

#[tokio::test]
async fn ids_start_at_one_and_increase() {
    let table = AgentTable::new();
    let a = table.insert(new_agent("a", None)).await.expect("insert");
    let b = table.insert(new_agent("b", None)).await.expect("insert");

    assert_eq!(a, 1);
    assert_eq!(b, 2);
    assert_eq!(table.len().await, 2);
}

#[tokio::test]
async fn new_records_are_created() {
    let table = AgentTable::new();
    let id = table.insert(new_agent("a", None)).await.expect("insert");
    let agent = table.read(id).await.expect("present");

    assert_eq!(agent.state, AgentState::Created);
    assert_eq!(agent.pid, None);
    assert_eq!(agent.parent_id, None);
    assert!(agent.child_ids.is_empty());
}

#[tokio::test]
async fn child_is_linked_into_parent() {
    let table = AgentTable::new();
    let parent = table.insert(new_agent("p", None)).await.expect("insert");
    let first = table.insert(new_agent("c1", Some(parent))).await.expect("insert");
    let second = table.insert(new_agent("c2", Some(parent))).await.expect("insert");

    let record = table.read(parent).await.expect("parent");
    assert_eq!(record.child_ids, vec![first, second]);
    assert_eq!(table.read(first).await.expect("child").parent_id, Some(parent));
}

#[tokio::test]
async fn unknown_parent_is_rejected_without_allocating() {
    let table = AgentTable::new();
    let err = table.insert(new_agent("orphan", Some(42))).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert!(table.is_empty().await);

    let id = table.insert(new_agent("a", None)).await.expect("insert");
    assert_eq!(id, 1);
}

#[tokio::test]
async fn concurrent_inserts_get_distinct_ids() {
    let table = Arc::new(AgentTable::new());
    let parent = table.insert(new_agent("p", None)).await.expect("insert");

    let mut handles = Vec::new();
    for i in 0..32 {
        let table = Arc::clone(&table);
        handles.push(tokio::spawn(async move {
            table
                .insert(new_agent(&format!("c{i}"), Some(parent)))
                .await
                .expect("insert")
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.expect("join"));
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 32);

    let mut children = table.read(parent).await.expect("parent").child_ids;
    children.sort_unstable();
    assert_eq!(children, ids);
}

#[tokio::test]
async fn with_agent_on_unknown_id_is_not_found() {
    let table = AgentTable::new();
    let err = table.with_agent(5, |_| ()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn records_are_ordered_by_id() {
    let table = AgentTable::new();
    for name in ["a", "b", "c"] {
        table.insert(new_agent(name, None)).await.expect("insert");
    }
    let ids: Vec<AgentId> = table.records().await.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn live_ids_exclude_terminal_agents() {
    let table = AgentTable::new();
    let a = table.insert(new_agent("a", None)).await.expect("insert");
    let b = table.insert(new_agent("b", None)).await.expect("insert");
    finish(&table, a).await;

    assert_eq!(table.live_ids().await, vec![b]);
}

#[tokio::test]
async fn prune_removes_fully_terminal_trees() {
    let table = AgentTable::new();
    let root = table.insert(new_agent("root", None)).await.expect("insert");
    let child = table.insert(new_agent("child", Some(root))).await.expect("insert");
    finish(&table, root).await;
    finish(&table, child).await;

    let removed = table.prune().await;
    assert_eq!(removed, vec![root, child]);
    assert!(table.is_empty().await);
}

#[tokio::test]
async fn prune_keeps_tree_with_live_descendant() {
    let table = AgentTable::new();
    let root = table.insert(new_agent("root", None)).await.expect("insert");
    let child = table.insert(new_agent("child", Some(root))).await.expect("insert");
    let grandchild = table
        .insert(new_agent("grandchild", Some(child)))
        .await
        .expect("insert");
    finish(&table, root).await;
    finish(&table, child).await;

    assert!(table.prune().await.is_empty());
    assert!(table.read(grandchild).await.is_some());
    assert_eq!(
        table.read(root).await.expect("root kept").child_ids,
        vec![child]
    );
}

#[tokio::test]
async fn pruned_ids_are_not_reused() {
    let table = AgentTable::new();
    let a = table.insert(new_agent("a", None)).await.expect("insert");
    finish(&table, a).await;
    table.prune().await;

    let b = table.insert(new_agent("b", None)).await.expect("insert");
    assert_eq!(b, a + 1);
}
