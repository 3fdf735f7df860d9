//! Integration tests for session lifecycles through the public kernel API.
//!
//! All generation goes through the scripted backend (`test-mock` feature),
//! so every stream is deterministic and start/resume calls are countable.

use std::sync::Arc;
use std::time::Duration;

use tessera_crdt::{Edge, KindRegistry, Node, NodeId, NodeKind, NodeStatus, meta};
use tessera_kernel::mock::{Gate, ScriptedBackend, Step};
use tessera_kernel::{
    FeatureRegistry, GenerationRequest, Kernel, KernelConfig, SessionError, SessionOutcome,
    SessionPhase, SharedGraph, StreamingSession, Checkpoint, UpstreamStatus,
};

// ============================================================================
// Shared test setup
// ============================================================================

fn memory_kernel(backend: Arc<ScriptedBackend>) -> Kernel {
    Kernel::open(
        KernelConfig::default().with_checkpoint_interval(1),
        backend,
        FeatureRegistry::builtin(),
        KindRegistry::new(),
    )
    .unwrap()
}

fn sqlite_kernel(path: &std::path::Path, backend: Arc<ScriptedBackend>) -> Kernel {
    Kernel::open(
        KernelConfig::default()
            .with_checkpoint_interval(1)
            .with_db_path(path),
        backend,
        FeatureRegistry::builtin(),
        KindRegistry::new(),
    )
    .unwrap()
}

fn add(graph: &SharedGraph, kind: NodeKind) -> NodeId {
    let node = Node::new(kind);
    let id = node.id;
    graph.add_node(node).unwrap();
    id
}

/// Poll until the node holds `expected`, or give up after a few seconds.
async fn wait_for_content(graph: &SharedGraph, id: &NodeId, expected: &str) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if graph.node(id).is_some_and(|n| n.content == expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if result.is_err() {
        let actual = graph.node(id).map(|n| n.content);
        panic!("timed out waiting for {expected:?}, node has {actual:?}");
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_fan_out_with_one_branch_stopped_and_continued() {
    let backend = Arc::new(ScriptedBackend::new());
    let kernel = memory_kernel(backend.clone());
    let graph = kernel.graph().clone();
    let sessions = kernel.sessions();

    let gate = Gate::new();
    backend
        .on_start("root", vec![Step::delta("root answer"), Step::done()])
        .on_start("b1", vec![Step::delta("one"), Step::delta(" done"), Step::done()])
        .on_start(
            "b2",
            vec![Step::delta("pre-"), Step::delta("stop"), Step::Gate(gate.clone()), Step::delta("never")],
        )
        .on_start("b3", vec![Step::delta("three"), Step::done()])
        .on_resume("b2", vec![Step::delta("|post"), Step::done()]);

    let a = add(&graph, NodeKind::AssistantOutput);
    sessions
        .start(a, GenerationRequest::new("chat", "root"))
        .await
        .unwrap();
    sessions.wait_idle(&a).await;

    let branches: Vec<NodeId> = (0..3)
        .map(|_| {
            let b = add(&graph, NodeKind::AssistantOutput);
            graph.add_edge(Edge::branch(a, b)).unwrap();
            b
        })
        .collect();
    for (b, prompt) in branches.iter().zip(["b1", "b2", "b3"]) {
        sessions
            .start(*b, GenerationRequest::new("chat", prompt))
            .await
            .unwrap();
    }
    let (b1, b2, b3) = (branches[0], branches[1], branches[2]);

    wait_for_content(&graph, &b2, "pre-stop").await;
    assert_eq!(sessions.cancel(&b2).await.unwrap(), SessionOutcome::Stopped);
    gate.open();

    sessions.wait_idle(&b1).await;
    sessions.wait_idle(&b3).await;
    for id in [a, b1, b3] {
        assert_eq!(graph.node(&id).unwrap().status, NodeStatus::Completed);
    }
    let stopped = graph.node(&b2).unwrap();
    assert_eq!(stopped.status, NodeStatus::Stopped);
    assert_eq!(stopped.content, "pre-stop");
    assert_eq!(graph.read(|s| s.children(&a).len()), 3);

    sessions.continue_session(&b2).await.unwrap();
    sessions.wait_idle(&b2).await;
    let continued = graph.node(&b2).unwrap();
    assert_eq!(continued.status, NodeStatus::Completed);
    assert_eq!(continued.content, "pre-stop|post");
    assert!(sessions.active_nodes().is_empty());
}

#[tokio::test]
async fn test_second_session_requires_cancel() {
    let backend = Arc::new(ScriptedBackend::new());
    let kernel = memory_kernel(backend.clone());
    let graph = kernel.graph().clone();
    let sessions = kernel.sessions();
    backend.on_start("long", vec![Step::delta("x"), Step::Hang]);

    let id = add(&graph, NodeKind::AssistantOutput);
    sessions
        .start(id, GenerationRequest::new("chat", "long"))
        .await
        .unwrap();

    let manual = StreamingSession::new(Checkpoint::new(
        id,
        "chat",
        GenerationRequest::new("chat", "manual"),
    ));
    assert!(matches!(
        sessions.register(manual),
        Err(SessionError::AlreadyActive(n)) if n == id
    ));
    assert!(matches!(
        sessions.continue_session(&id).await,
        Err(SessionError::AlreadyActive(_))
    ));
    assert_eq!(sessions.active_nodes(), vec![id]);

    sessions.discard(&id).await.unwrap();
    assert!(sessions.phase(&id).is_none());
    assert_eq!(graph.node(&id).unwrap().status, NodeStatus::Stopped);
}

#[tokio::test]
async fn test_session_flows_reach_subscribers() {
    let backend = Arc::new(ScriptedBackend::new());
    let kernel = memory_kernel(backend.clone());
    let graph = kernel.graph().clone();
    backend.on_start("q", vec![Step::delta("hi"), Step::done()]);

    let id = add(&graph, NodeKind::AssistantOutput);
    let mut session_flows = graph.flows().subscribe("session.*");
    kernel
        .sessions()
        .start(id, GenerationRequest::new("chat", "q"))
        .await
        .unwrap();
    kernel.sessions().wait_idle(&id).await;

    let mut phases = Vec::new();
    while let Some(msg) = session_flows.try_recv() {
        if let tessera_kernel::GraphFlow::SessionChanged { node_id, phase, .. } = msg.payload {
            assert_eq!(node_id, id);
            phases.push(phase);
        }
    }
    assert_eq!(phases, vec![SessionPhase::Active, SessionPhase::Completed]);
}

// ============================================================================
// Restart (SQLite-backed)
// ============================================================================

#[tokio::test]
async fn test_graph_edits_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tessera.db");

    let (a, b, edge) = {
        let kernel = sqlite_kernel(&db, Arc::new(ScriptedBackend::new()));
        let a = add(kernel.graph(), NodeKind::HumanInput);
        let b = add(kernel.graph(), NodeKind::AssistantOutput);
        let edge = Edge::reply(a, b);
        let edge_id = edge.id;
        kernel.graph().add_edge(edge).unwrap();
        (a, b, edge_id)
    };

    let kernel = sqlite_kernel(&db, Arc::new(ScriptedBackend::new()));
    let graph = kernel.graph();
    assert!(graph.contains(&a));
    assert!(graph.contains(&b));
    assert!(graph.read(|s| s.edge(&edge).is_some()));
    assert_eq!(graph.read(|s| s.children(&a)), vec![b]);
}

#[tokio::test]
async fn test_restart_finishes_completed_upstream_task() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tessera.db");

    let first = Arc::new(ScriptedBackend::new());
    first.on_start_durable("survey", vec![Step::delta("X"), Step::Hang]);
    let node = {
        let kernel = sqlite_kernel(&db, first.clone());
        let id = add(kernel.graph(), NodeKind::ResearchTask);
        kernel
            .sessions()
            .start(id, GenerationRequest::new("research", "survey"))
            .await
            .unwrap();
        wait_for_content(kernel.graph(), &id, "X").await;
        id
    };

    let second = Arc::new(ScriptedBackend::new());
    second
        .set_status("task-1", UpstreamStatus::Completed)
        .set_final("task-1", "XYZ");
    let kernel = sqlite_kernel(&db, second.clone());
    assert_eq!(kernel.graph().node(&node).unwrap().status, NodeStatus::Streaming);

    let report = kernel.resume().await.unwrap();
    assert_eq!(report.completed, 1);

    let finished = kernel.graph().node(&node).unwrap();
    assert_eq!(finished.content, "XYZ");
    assert_eq!(finished.status, NodeStatus::Completed);
    assert_eq!(finished.upstream_task_id(), Some("task-1"));
    assert_eq!(second.start_calls(), 0);
    assert!(kernel.sessions().checkpoints().load(&node).unwrap().is_none());
}

#[tokio::test]
async fn test_restart_keeps_stopped_session_continuable() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tessera.db");

    let first = Arc::new(ScriptedBackend::new());
    first.on_start("essay", vec![Step::delta("A"), Step::delta("B"), Step::Hang]);
    let node = {
        let kernel = sqlite_kernel(&db, first);
        let id = add(kernel.graph(), NodeKind::AssistantOutput);
        kernel
            .sessions()
            .start(id, GenerationRequest::new("chat", "essay"))
            .await
            .unwrap();
        wait_for_content(kernel.graph(), &id, "AB").await;
        kernel.sessions().stop(&id).await.unwrap();
        id
    };

    let second = Arc::new(ScriptedBackend::new());
    second.on_resume("essay", vec![Step::delta("C"), Step::delta("D"), Step::done()]);
    let kernel = sqlite_kernel(&db, second.clone());

    let report = kernel.resume().await.unwrap();
    assert_eq!(report.restored_stopped, 1);
    let node_after = kernel.graph().node(&node).unwrap();
    assert_eq!(node_after.status, NodeStatus::Stopped);
    assert_eq!(node_after.metadata.get(meta::STOPPED), Some(&serde_json::json!(true)));

    kernel.sessions().continue_session(&node).await.unwrap();
    kernel.sessions().wait_idle(&node).await;
    assert_eq!(kernel.graph().node(&node).unwrap().content, "ABCD");
    assert_eq!(second.start_calls(), 0);
}
