//! End-to-end engine scenarios - compiled diagrams driven through fake ports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;

use dipeo_core::compile::compile;
use dipeo_core::domain::{DomainDiagram, HandleDirection, NodeType, PersonConfig};
use dipeo_core::engine::{Engine, ExecutionStatus};
use dipeo_core::events::EventKind;
use dipeo_core::ports::{
    CodeExecutor, CodeLanguage, CompletionRequest, CompletionResponse, FileStore, HttpClient,
    HttpRequest, HttpResponse, LLMClient, LlmConfig, MemorySelectionRequest, Ports, TokenUsage,
};
use dipeo_core::state::NodeStatus;
use dipeo_core::types::{EngineConfig, Error, MessageId, NodeId, PersonId, Result};

// =============================================================================
// Fake ports
// =============================================================================

#[derive(Default)]
struct FakeLlm {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    view_sizes: Mutex<Vec<usize>>,
}

#[async_trait]
impl LLMClient for FakeLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.view_sizes.lock().unwrap().push(request.messages.len());
        Ok(CompletionResponse {
            text: format!("reply to: {}", request.prompt),
            structured: None,
            usage: TokenUsage { input: 1, output: 1 },
        })
    }

    async fn select_memories(&self, request: MemorySelectionRequest) -> Result<Vec<MessageId>> {
        Ok(request.candidates.into_iter().map(|m| m.id).collect())
    }
}

#[derive(Default)]
struct MemFiles {
    files: Mutex<HashMap<String, Bytes>>,
}

#[async_trait]
impl FileStore for MemFiles {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(path.to_string()))
    }

    async fn write(&self, path: &str, payload: Bytes) -> Result<()> {
        self.files.lock().unwrap().insert(path.to_string(), payload);
        Ok(())
    }

    async fn append(&self, path: &str, payload: Bytes) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(path.to_string()).or_default();
        let mut combined = entry.to_vec();
        combined.extend_from_slice(&payload);
        *entry = Bytes::from(combined);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }
}

/// Scripted HTTP responses per call, defaulting to 200 `{}`.
#[derive(Default)]
struct FakeHttp {
    script: Mutex<Vec<u16>>,
    calls: AtomicUsize,
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn request(&self, _request: HttpRequest) -> Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let status = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                200
            } else {
                script.remove(0)
            }
        };
        Ok(HttpResponse {
            status,
            headers: Default::default(),
            body: json!({"ok": status < 400}).to_string(),
        })
    }
}

/// Disk-backed FileStore rooted in a temp directory.
struct DiskFiles {
    root: tempfile::TempDir,
}

impl DiskFiles {
    fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.root.path().join(rel)
    }
}

#[async_trait]
impl FileStore for DiskFiles {
    async fn read(&self, path: &str) -> Result<Bytes> {
        Ok(Bytes::from(std::fs::read(self.path(path))?))
    }

    async fn write(&self, path: &str, payload: Bytes) -> Result<()> {
        std::fs::write(self.path(path), payload)?;
        Ok(())
    }

    async fn append(&self, path: &str, payload: Bytes) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(path))?;
        file.write_all(&payload)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        std::fs::remove_file(self.path(path))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.path(path).exists())
    }
}

/// Code is either the literal JSON the job returns, or the `double_v`
/// routine used by the batch scenario.
#[derive(Default)]
struct FakeCode;

#[async_trait]
impl CodeExecutor for FakeCode {
    async fn run(&self, _language: CodeLanguage, code: &str, inputs: Value) -> Result<Value> {
        if code == "double_v" {
            let v = inputs
                .get("default")
                .and_then(|d| d.get("v"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            return Ok(json!({"out": v * 2}));
        }
        serde_json::from_str(code).map_err(|e| Error::permanent(format!("bad fake code: {e}")))
    }
}

struct Harness {
    engine: Engine,
    llm: Arc<FakeLlm>,
    files: Arc<MemFiles>,
    http: Arc<FakeHttp>,
}

fn harness_with(config: EngineConfig) -> Harness {
    let llm = Arc::new(FakeLlm::default());
    let files = Arc::new(MemFiles::default());
    let http = Arc::new(FakeHttp::default());
    let ports = Ports {
        llm: llm.clone(),
        files: files.clone(),
        http: http.clone(),
        code: Arc::new(FakeCode),
    };
    Harness {
        engine: Engine::new(config, ports),
        llm,
        files,
        http,
    }
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

// =============================================================================
// Diagram builders
// =============================================================================

fn data(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn test_person() -> PersonConfig {
    PersonConfig {
        label: "P".into(),
        llm_config: LlmConfig {
            service: "test".into(),
            model: "test-model".into(),
            api_key_id: None,
            system_prompt: None,
            temperature: None,
        },
    }
}

/// S1: start -> person_job (goldfish, one shot) -> endpoint
fn linear_person_diagram() -> DomainDiagram {
    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let p = d.add_node(
        "p",
        NodeType::PersonJob,
        data(json!({
            "person": "p1",
            "max_iteration": 1,
            "memorize_to": "GOLDFISH",
            "first_only_prompt": "Say hi"
        })),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));
    d.persons.insert(PersonId::from("p1"), test_person());

    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let p_in = d.add_handle(&p, "first", HandleDirection::Input, None);
    let p_out = d.add_handle(&p, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, p_in, data(json!({})));
    d.connect("e2", p_out, e_in, data(json!({})));
    d
}

/// S2: start -> person_job(max_iteration=3) -> condition(detect_max);
/// false loops back, true reaches the endpoint.
fn loop_diagram() -> DomainDiagram {
    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let p = d.add_node(
        "p",
        NodeType::PersonJob,
        data(json!({
            "person": "p1",
            "max_iteration": 3,
            "memorize_to": "GOLDFISH",
            "first_only_prompt": "go",
            "default_prompt": "again"
        })),
    );
    let cond = d.add_node(
        "cond",
        NodeType::Condition,
        data(json!({"condition_type": "detect_max_iterations"})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));
    d.persons.insert(PersonId::from("p1"), test_person());

    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let p_first = d.add_handle(&p, "first", HandleDirection::Input, None);
    let p_in = d.add_handle(&p, "default", HandleDirection::Input, None);
    let p_out = d.add_handle(&p, "default", HandleDirection::Output, None);
    let c_in = d.add_handle(&cond, "default", HandleDirection::Input, None);
    let c_true = d.add_handle(&cond, "condtrue", HandleDirection::Output, None);
    let c_false = d.add_handle(&cond, "condfalse", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);

    d.connect("e_start", s_out, p_first, data(json!({})));
    d.connect("e_work", p_out, c_in, data(json!({})));
    d.connect("e_loop", c_false, p_in, data(json!({})));
    d.connect("e_done", c_true, e_in, data(json!({})));
    d
}

/// S3: start -> code({"x":7}) -> condition(inputs.x > 5); true -> a -> end,
/// false -> b (never fires).
fn branch_diagram() -> DomainDiagram {
    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let code = d.add_node(
        "code",
        NodeType::CodeJob,
        data(json!({"language": "python", "code": "{\"x\": 7}"})),
    );
    let cond = d.add_node(
        "cond",
        NodeType::Condition,
        data(json!({"condition_type": "custom_expression", "expression": "inputs.x > 5"})),
    );
    let a = d.add_node(
        "a",
        NodeType::CodeJob,
        data(json!({"language": "python", "code": "{\"took\": \"a\"}"})),
    );
    let b = d.add_node(
        "b",
        NodeType::CodeJob,
        data(json!({"language": "python", "code": "{\"took\": \"b\"}"})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));

    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let code_in = d.add_handle(&code, "default", HandleDirection::Input, None);
    let code_out = d.add_handle(&code, "default", HandleDirection::Output, None);
    let c_in = d.add_handle(&cond, "default", HandleDirection::Input, None);
    let c_true = d.add_handle(&cond, "condtrue", HandleDirection::Output, None);
    let c_false = d.add_handle(&cond, "condfalse", HandleDirection::Output, None);
    let a_in = d.add_handle(&a, "default", HandleDirection::Input, None);
    let a_out = d.add_handle(&a, "default", HandleDirection::Output, None);
    let b_in = d.add_handle(&b, "default", HandleDirection::Input, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);

    d.connect("e1", s_out, code_in, data(json!({})));
    d.connect("e2", code_out, c_in, data(json!({})));
    d.connect("e3", c_true, a_in, data(json!({})));
    d.connect("e4", c_false, b_in, data(json!({})));
    d.connect("e5", a_out, e_in, data(json!({})));
    d
}

/// Child for S4: start -> code(double_v) -> endpoint.
fn worker_child_diagram() -> DomainDiagram {
    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let code = d.add_node(
        "code",
        NodeType::CodeJob,
        data(json!({"language": "python", "code": "double_v"})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));

    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let c_in = d.add_handle(&code, "default", HandleDirection::Input, None);
    let c_out = d.add_handle(&code, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, c_in, data(json!({})));
    d.connect("e2", c_out, e_in, data(json!({})));
    d
}

/// S4 parent: start -> sub_diagram(batch over items) -> endpoint.
fn batch_parent_diagram() -> DomainDiagram {
    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let sub = d.add_node(
        "sub",
        NodeType::SubDiagram,
        data(json!({
            "diagram_name": "worker_diagram",
            "batch": true,
            "batch_input_key": "items",
            "output_mode": "pure_list"
        })),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));

    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let sub_in = d.add_handle(&sub, "default", HandleDirection::Input, None);
    let sub_out = d.add_handle(&sub, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, sub_in, data(json!({})));
    d.connect("e2", sub_out, e_in, data(json!({})));
    d
}

/// S5: start -> code([1,2,3]) -> person_job -> endpoint.
fn list_into_person_diagram() -> DomainDiagram {
    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let code = d.add_node(
        "code",
        NodeType::CodeJob,
        data(json!({"language": "python", "code": "[1, 2, 3]"})),
    );
    let p = d.add_node(
        "p",
        NodeType::PersonJob,
        data(json!({
            "person": "p1",
            "max_iteration": 1,
            "memorize_to": "GOLDFISH",
            "first_only_prompt": "data: {{ inputs }}"
        })),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));
    d.persons.insert(PersonId::from("p1"), test_person());

    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let c_in = d.add_handle(&code, "default", HandleDirection::Input, None);
    let c_out = d.add_handle(&code, "default", HandleDirection::Output, None);
    let p_in = d.add_handle(&p, "default", HandleDirection::Input, None);
    let p_out = d.add_handle(&p, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, c_in, data(json!({})));
    d.connect("e2", c_out, p_in, data(json!({})));
    d.connect("e3", p_out, e_in, data(json!({})));
    d
}

fn compiled(d: &DomainDiagram) -> std::sync::Arc<dipeo_core::domain::ExecutableDiagram> {
    let result = compile(d);
    assert!(result.is_ok(), "compile errors: {:?}", result.errors);
    result.diagram.unwrap()
}

fn event_names(events: &[dipeo_core::events::Event]) -> Vec<(String, Option<String>)> {
    events
        .iter()
        .map(|e| {
            let node = match &e.kind {
                EventKind::NodeStarted { node_id, .. }
                | EventKind::NodeCompleted { node_id, .. }
                | EventKind::NodeFailed { node_id, .. } => Some(node_id.to_string()),
                _ => None,
            };
            (e.kind.type_name().to_string(), node)
        })
        .collect()
}

fn drain_events(
    engine: &Engine,
    execution_id: &dipeo_core::types::ExecutionId,
) -> Vec<dipeo_core::events::Event> {
    let mut sub = engine.subscribe(execution_id, Some(0)).expect("subscribe");
    let mut events = Vec::new();
    while let Some(event) = sub.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn s1_simple_linear_run() {
    let h = harness();
    let diagram = compiled(&linear_person_diagram());

    let id = h.engine.start(diagram, None);
    let outcome = h.engine.wait(&id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    // One LLM call, with an empty (goldfish) conversation view.
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.llm.view_sizes.lock().unwrap().as_slice(), &[0]);

    let events = drain_events(&h.engine, &id);
    let names = event_names(&events);
    let expected: Vec<(String, Option<String>)> = vec![
        ("execution_started".into(), None),
        ("node_started".into(), Some("start".into())),
        ("node_completed".into(), Some("start".into())),
        ("node_started".into(), Some("p".into())),
        ("node_completed".into(), Some("p".into())),
        ("node_started".into(), Some("end".into())),
        ("node_completed".into(), Some("end".into())),
        ("execution_completed".into(), None),
    ];
    // Token events interleave; check the lifecycle subsequence.
    let lifecycle: Vec<_> = names
        .iter()
        .filter(|(n, _)| !n.starts_with("token_") && n != "keep_alive")
        .cloned()
        .collect();
    assert_eq!(lifecycle, expected);

    // Sequences are strictly monotonic from 1.
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1);
    }
}

#[tokio::test]
async fn s2_loop_with_max_iteration() {
    let h = harness();
    let diagram = compiled(&loop_diagram());

    let id = h.engine.start(diagram, None);
    let outcome = h.engine.wait(&id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let events = drain_events(&h.engine, &id);
    let p = NodeId::from("p");
    let completions = events
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::NodeCompleted { node_id, .. } if node_id == &p))
        .count();
    let starts = events
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::NodeStarted { node_id, .. } if node_id == &p))
        .count();
    assert_eq!(completions, 3);
    assert_eq!(starts, 3);

    // All three iterations ran at epoch 0 under cumulative scope.
    assert!(events.iter().all(|e| match &e.kind {
        EventKind::NodeStarted { epoch, .. } => *epoch == 0,
        _ => true,
    }));
}

#[tokio::test]
async fn s3_condition_branch_selection() {
    let h = harness();
    let diagram = compiled(&branch_diagram());

    let id = h.engine.start(diagram, None);
    let outcome = h.engine.wait(&id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let events = drain_events(&h.engine, &id);
    let a = NodeId::from("a");
    let b = NodeId::from("b");
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::NodeCompleted { node_id, .. } if node_id == &a)));
    assert!(!events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::NodeStarted { node_id, .. } if node_id == &b)));

    // Only the condtrue edge carried a token.
    assert!(events.iter().all(|e| match &e.kind {
        EventKind::TokenPublished { edge_id, .. } => edge_id.as_str() != "e4",
        _ => true,
    }));

    // The inactive branch target ends up skipped on the terminal sweep.
    let snapshot = h.engine.ui_snapshot(&id).unwrap();
    let b_status = snapshot
        .nodes
        .iter()
        .find(|n| n.node_id == b)
        .unwrap()
        .status;
    assert_eq!(b_status, NodeStatus::Skipped);
}

#[tokio::test]
async fn s4_sub_diagram_batch_pure_list() {
    let h = harness();
    let child = compiled(&worker_child_diagram());
    h.engine.register_diagram("worker_diagram", child);
    let parent = compiled(&batch_parent_diagram());

    let id = h.engine.start(
        parent,
        Some(json!({"items": [{"v": 1}, {"v": 2}, {"v": 3}]})),
    );
    let outcome = h.engine.wait(&id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed, "{:?}", outcome.reason);

    let sub = NodeId::from("sub");
    let record = outcome
        .history
        .iter()
        .rev()
        .find(|r| r.node_id == sub)
        .unwrap();
    let envelope = record.output.as_ref().unwrap();
    assert_eq!(
        envelope.body_json(),
        json!([{"out": 2}, {"out": 4}, {"out": 6}])
    );
    assert_eq!(envelope.meta().get("total_items"), Some(&json!(3)));
    assert_eq!(envelope.meta().get("failed"), Some(&json!(0)));
}

#[tokio::test]
async fn s5_strict_envelopes_do_not_wrap_lists() {
    let h = harness();
    let diagram = compiled(&list_into_person_diagram());
    let outcome = h.engine.run(diagram, None).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let prompts = h.llm.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0], "data: {\"default\":[1,2,3]}");
}

#[tokio::test]
async fn s5_legacy_mode_wraps_lists() {
    let mut config = EngineConfig::default();
    config.strict_envelopes = false;
    let h = harness_with(config);
    let diagram = compiled(&list_into_person_diagram());
    let outcome = h.engine.run(diagram, None).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let prompts = h.llm.prompts.lock().unwrap().clone();
    assert_eq!(prompts[0], "data: {\"results\":[1,2,3]}");
}

#[tokio::test]
async fn s6_subscriber_replays_after_reconnect() {
    let h = harness();
    let diagram = compiled(&linear_person_diagram());
    let id = h.engine.start(diagram, None);
    h.engine.wait(&id).await.unwrap();

    let all = drain_events(&h.engine, &id);
    assert!(all.len() > 8);

    // Reattach from seq 7: events 8..=max arrive in order, exactly once.
    let mut sub = h.engine.subscribe(&id, Some(7)).unwrap();
    let mut replayed = Vec::new();
    while let Some(event) = sub.try_recv() {
        replayed.push(event.seq);
    }
    let expected: Vec<u64> = (8..=all.len() as u64).collect();
    assert_eq!(replayed, expected);
}

#[tokio::test]
async fn acyclic_runs_are_deterministic_modulo_timestamps() {
    let diagram = compiled(&branch_diagram());

    let mut sequences = Vec::new();
    for _ in 0..2 {
        let h = harness();
        let id = h.engine.start(diagram.clone(), None);
        h.engine.wait(&id).await.unwrap();
        sequences.push(event_names(&drain_events(&h.engine, &id)));
    }
    assert_eq!(sequences[0], sequences[1]);
}

#[tokio::test]
async fn final_outputs_carry_endpoint_inputs() {
    let h = harness();
    let diagram = compiled(&branch_diagram());
    let outcome = h.engine.run(diagram, None).await.unwrap();
    let end = NodeId::from("end");
    assert_eq!(
        outcome.final_outputs.get(&end),
        Some(&json!({"default": {"took": "a"}}))
    );
}

#[tokio::test]
async fn transient_api_failures_are_retried() {
    let mut config = EngineConfig::default();
    config.retry_backoff_base = Duration::from_millis(10);
    let h = harness_with(config);
    // Two 500s, then success.
    *h.http.script.lock().unwrap() = vec![500, 500, 200];

    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let api = d.add_node(
        "api",
        NodeType::ApiJob,
        data(json!({"url": "https://example.test/x", "method": "GET"})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));
    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let a_in = d.add_handle(&api, "default", HandleDirection::Input, None);
    let a_out = d.add_handle(&api, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, a_in, data(json!({})));
    d.connect("e2", a_out, e_in, data(json!({})));

    let outcome = h.engine.run(compiled(&d), None).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed, "{:?}", outcome.reason);
    assert_eq!(h.http.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn permanent_failure_terminates_the_execution() {
    let h = harness();

    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    // FakeCode fails on non-JSON code.
    let code = d.add_node(
        "code",
        NodeType::CodeJob,
        data(json!({"language": "python", "code": "not json at all"})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));
    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let c_in = d.add_handle(&code, "default", HandleDirection::Input, None);
    let c_out = d.add_handle(&code, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, c_in, data(json!({})));
    d.connect("e2", c_out, e_in, data(json!({})));

    let id = h.engine.start(compiled(&d), None);
    let outcome = h.engine.wait(&id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.reason.unwrap().contains("code"));

    let events = drain_events(&h.engine, &id);
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::NodeFailed { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::ExecutionFailed { .. })));
}

#[tokio::test]
async fn cancellation_ends_with_cancelled_status() {
    let h = harness();

    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let ask = d.add_node(
        "ask",
        NodeType::UserResponse,
        data(json!({"prompt": "continue?", "timeout_s": 60})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));
    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let a_in = d.add_handle(&ask, "default", HandleDirection::Input, None);
    let a_out = d.add_handle(&ask, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, a_in, data(json!({})));
    d.connect("e2", a_out, e_in, data(json!({})));

    let id = h.engine.start(compiled(&d), None);

    // Wait until the interaction is raised, then cancel.
    for _ in 0..100 {
        if !h.engine.pending_interactions(&id).unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.engine.cancel(&id).unwrap();

    let outcome = h.engine.wait(&id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Cancelled);
    assert_eq!(outcome.reason.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn user_response_answer_flows_through() {
    let h = harness();

    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let ask = d.add_node(
        "ask",
        NodeType::UserResponse,
        data(json!({"prompt": "name?", "timeout_s": 60})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));
    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let a_in = d.add_handle(&ask, "default", HandleDirection::Input, None);
    let a_out = d.add_handle(&ask, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, a_in, data(json!({})));
    d.connect("e2", a_out, e_in, data(json!({})));

    let id = h.engine.start(compiled(&d), None);
    let ask_node = NodeId::from("ask");
    for _ in 0..100 {
        if !h.engine.pending_interactions(&id).unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.engine.respond(&id, &ask_node, "ada").unwrap();

    let outcome = h.engine.wait(&id).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(
        outcome.final_outputs.get(&NodeId::from("end")),
        Some(&json!({"default": "ada"}))
    );
}

#[tokio::test]
async fn diff_patch_applies_against_a_real_file() {
    let files = Arc::new(DiskFiles::new());
    std::fs::write(files.path("f.txt"), "one\ntwo\nthree\n").unwrap();
    let ports = Ports {
        llm: Arc::new(FakeLlm::default()),
        files: files.clone(),
        http: Arc::new(FakeHttp::default()),
        code: Arc::new(FakeCode),
    };
    let engine = Engine::new(EngineConfig::default(), ports);

    let diff = "\
--- a/f.txt
+++ b/f.txt
@@ -1,3 +1,3 @@
 one
-two
+TWO
 three
";

    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let tpl = d.add_node(
        "tpl",
        NodeType::TemplateJob,
        data(json!({"template": diff})),
    );
    let patch = d.add_node(
        "patch",
        NodeType::DiffPatch,
        data(json!({"target_path": "f.txt", "mode": "normal"})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));

    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let t_in = d.add_handle(&tpl, "default", HandleDirection::Input, None);
    let t_out = d.add_handle(&tpl, "default", HandleDirection::Output, None);
    let p_in = d.add_handle(&patch, "default", HandleDirection::Input, None);
    let p_res = d.add_handle(&patch, "results", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, t_in, data(json!({})));
    d.connect("e2", t_out, p_in, data(json!({})));
    d.connect("e3", p_res, e_in, data(json!({})));

    let outcome = engine.run(compiled(&d), None).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed, "{:?}", outcome.reason);

    let patched = std::fs::read_to_string(files.path("f.txt")).unwrap();
    assert_eq!(patched, "one\nTWO\nthree\n");
    assert_eq!(
        outcome.final_outputs.get(&NodeId::from("end")).unwrap()["default"]["applied_hunks"],
        json!(1)
    );
}

#[tokio::test]
async fn endpoint_save_to_file_writes_through_the_port() {
    let h = harness();

    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({"custom_data": {"k": 1}})));
    let end = d.add_node(
        "end",
        NodeType::Endpoint,
        data(json!({"save_to_file": true, "file_path": "out.json"})),
    );
    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);
    d.connect("e1", s_out, e_in, data(json!({})));

    let outcome = h.engine.run(compiled(&d), None).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let written = h.files.files.lock().unwrap().get("out.json").cloned().unwrap();
    let value: Value = serde_json::from_slice(&written).unwrap();
    assert_eq!(value, json!({"k": 1}));
}
