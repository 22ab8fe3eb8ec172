//! Compiler pipeline tests over small hand-built diagrams.

use pretty_assertions::assert_eq;
use serde_json::json;

use crate::compile::{compile, CompilePhase};
use crate::domain::{
    DomainDiagram, EdgeKind, HandleDirection, NodeKind, NodeType, PersonConfig,
};
use crate::ports::LlmConfig;
use crate::types::{NodeId, PersonId};

fn data(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn person(label: &str) -> PersonConfig {
    PersonConfig {
        label: label.to_string(),
        llm_config: LlmConfig {
            service: "test".into(),
            model: "test-model".into(),
            api_key_id: None,
            system_prompt: None,
            temperature: None,
        },
    }
}

/// start -> code -> end
fn linear_diagram() -> DomainDiagram {
    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let code = d.add_node(
        "code",
        NodeType::CodeJob,
        data(json!({"language": "python", "code": "result = {}"})),
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

/// start -> worker -> cond; condfalse -> worker, condtrue -> end
fn loop_diagram() -> DomainDiagram {
    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let worker = d.add_node(
        "worker",
        NodeType::PersonJob,
        data(json!({"person": "p1", "max_iteration": 3, "first_only_prompt": "go"})),
    );
    let cond = d.add_node(
        "cond",
        NodeType::Condition,
        data(json!({"condition_type": "detect_max_iterations"})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));
    d.persons.insert(PersonId::from("p1"), person("P"));

    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let w_first = d.add_handle(&worker, "first", HandleDirection::Input, None);
    let w_in = d.add_handle(&worker, "default", HandleDirection::Input, None);
    let w_out = d.add_handle(&worker, "default", HandleDirection::Output, None);
    let c_in = d.add_handle(&cond, "default", HandleDirection::Input, None);
    let c_true = d.add_handle(&cond, "condtrue", HandleDirection::Output, None);
    let c_false = d.add_handle(&cond, "condfalse", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);

    d.connect("e_start", s_out, w_first, data(json!({})));
    d.connect("e_work", w_out, c_in, data(json!({})));
    d.connect("e_loop", c_false, w_in, data(json!({})));
    d.connect("e_done", c_true, e_in, data(json!({})));
    d
}

#[test]
fn linear_diagram_compiles() {
    let result = compile(&linear_diagram());
    assert!(result.is_ok(), "errors: {:?}", result.errors);
    let diagram = result.diagram.unwrap();

    assert_eq!(diagram.nodes.len(), 3);
    assert_eq!(diagram.edges.len(), 2);
    assert_eq!(diagram.start_nodes, vec![NodeId::from("start")]);
    assert_eq!(diagram.endpoint_nodes, vec![NodeId::from("end")]);
    assert!(diagram.cycles.is_empty());

    // Topological hint orders the pipeline.
    let rank = |n: &str| diagram.rank(&NodeId::from(n));
    assert!(rank("start") < rank("code"));
    assert!(rank("code") < rank("end"));
}

#[test]
fn compilation_is_deterministic() {
    let d = loop_diagram();
    let first = compile(&d).diagram.unwrap();
    let second = compile(&d).diagram.unwrap();
    assert_eq!(first.as_ref(), second.as_ref());
}

#[test]
fn loop_is_recorded_with_loopback_edge() {
    let result = compile(&loop_diagram());
    assert!(result.is_ok(), "errors: {:?}", result.errors);
    let diagram = result.diagram.unwrap();

    assert_eq!(diagram.cycles.len(), 1);
    assert_eq!(
        diagram.cycles[0],
        vec![NodeId::from("cond"), NodeId::from("worker")]
    );

    let loop_edge = diagram.edge(&"e_loop".into()).unwrap();
    assert!(loop_edge.is_loopback);
    assert_eq!(loop_edge.kind, EdgeKind::ConditionFalse);
    let done_edge = diagram.edge(&"e_done".into()).unwrap();
    assert!(!done_edge.is_loopback);
}

#[test]
fn cycle_without_condition_exit_is_rejected() {
    let mut d = DomainDiagram::new();
    let start = d.add_node("start", NodeType::Start, data(json!({})));
    let a = d.add_node(
        "a",
        NodeType::CodeJob,
        data(json!({"language": "python", "code": "x"})),
    );
    let b = d.add_node(
        "b",
        NodeType::CodeJob,
        data(json!({"language": "python", "code": "y"})),
    );
    let end = d.add_node("end", NodeType::Endpoint, data(json!({})));

    let s_out = d.add_handle(&start, "default", HandleDirection::Output, None);
    let a_in = d.add_handle(&a, "default", HandleDirection::Input, None);
    let a_out = d.add_handle(&a, "default", HandleDirection::Output, None);
    let b_in = d.add_handle(&b, "default", HandleDirection::Input, None);
    let b_out = d.add_handle(&b, "default", HandleDirection::Output, None);
    let e_in = d.add_handle(&end, "default", HandleDirection::Input, None);

    d.connect("e1", s_out, a_in.clone(), data(json!({})));
    d.connect("e2", a_out.clone(), b_in, data(json!({})));
    d.connect("e3", b_out.clone(), a_in, data(json!({})));
    d.connect("e4", b_out, e_in, data(json!({})));

    let result = compile(&d);
    assert!(!result.is_ok());
    assert!(result
        .errors
        .iter()
        .any(|e| e.phase == CompilePhase::Optimization));
}

#[test]
fn condition_requires_both_branches() {
    let mut d = loop_diagram();
    // Drop the condfalse arrow.
    d.arrows.retain(|a| a.id.as_str() != "e_loop");
    let result = compile(&d);
    assert!(!result.is_ok());
    assert!(result.errors.iter().any(|e| {
        e.phase == CompilePhase::Validation && e.node_id == Some(NodeId::from("cond"))
    }));
}

#[test]
fn missing_start_or_endpoint_is_rejected() {
    let mut d = linear_diagram();
    d.nodes.remove(&NodeId::from("start"));
    d.arrows.retain(|a| a.id.as_str() != "e1");
    let result = compile(&d);
    assert!(result
        .errors
        .iter()
        .any(|e| e.message.contains("no start node")));
}

#[test]
fn unresolved_handle_reference_is_rejected() {
    let mut d = linear_diagram();
    d.arrows[0].source = "ghost_default_output".into();
    let result = compile(&d);
    assert!(!result.is_ok());
    assert!(result.errors.iter().any(|e| {
        e.phase == CompilePhase::Validation && e.edge_id == Some("e1".into())
    }));
}

#[test]
fn endpoint_rejects_outgoing_edges() {
    let mut d = linear_diagram();
    let end = NodeId::from("end");
    let code = NodeId::from("code");
    let bad_out = d.add_handle(&end, "default", HandleDirection::Output, None);
    let c_in2 = d.add_handle(&code, "extra", HandleDirection::Input, None);
    d.connect("e_bad", bad_out, c_in2, data(json!({})));
    let result = compile(&d);
    assert!(!result.is_ok());
}

#[test]
fn field_renames_apply_during_transformation() {
    let mut d = loop_diagram();
    // Use legacy field names on the worker node.
    let worker = d.nodes.get_mut(&NodeId::from("worker")).unwrap();
    worker.data = data(json!({"person": "p1", "max_iterations": 5, "first_prompt": "hello"}));

    let diagram = compile(&d).diagram.unwrap();
    let worker = diagram.node(&NodeId::from("worker")).unwrap();
    match &worker.kind {
        NodeKind::PersonJob(p) => {
            assert_eq!(p.max_iteration, 5);
            assert_eq!(p.first_only_prompt.as_deref(), Some("hello"));
        }
        other => panic!("unexpected kind {other:?}"),
    }
}

#[test]
fn invalid_expression_fails_node_transformation() {
    let mut d = loop_diagram();
    let cond = d.nodes.get_mut(&NodeId::from("cond")).unwrap();
    cond.data = data(json!({"condition_type": "custom_expression", "expression": "x &&"}));

    let result = compile(&d);
    assert!(result.errors.iter().any(|e| {
        e.phase == CompilePhase::NodeTransformation && e.node_id == Some(NodeId::from("cond"))
    }));
}

#[test]
fn spread_edge_requires_object_producer() {
    let mut d = linear_diagram();
    // template_job emits raw_text; spreading it is rejected.
    let tpl = d.add_node(
        "tpl",
        NodeType::TemplateJob,
        data(json!({"template": "hi"})),
    );
    let end2 = d.add_node("end2", NodeType::Endpoint, data(json!({})));
    let t_in = d.add_handle(&tpl, "default", HandleDirection::Input, None);
    let t_out = d.add_handle(&tpl, "default", HandleDirection::Output, None);
    let e2_in = d.add_handle(&end2, "default", HandleDirection::Input, None);
    let code = NodeId::from("code");
    let c_out2 = d.add_handle(&code, "error", HandleDirection::Output, None);

    d.connect("e_t1", c_out2, t_in, data(json!({})));
    d.connect("e_t2", t_out, e2_in, data(json!({"packing": "spread"})));

    let result = compile(&d);
    assert!(!result.is_ok());
    assert!(result.errors.iter().any(|e| {
        e.phase == CompilePhase::EdgeBuilding && e.edge_id == Some("e_t2".into())
    }));
}

#[test]
fn object_to_text_coercion_is_attached() {
    use crate::domain::TransformRule;
    use crate::types::HandleId;
    let mut d = linear_diagram();
    // diff_patch declares a raw_text default input; the code node's object
    // output coerces via JSON serialization.
    let patch = d.add_node(
        "patch",
        NodeType::DiffPatch,
        data(json!({"target_path": "f.txt"})),
    );
    let p_in = d.add_handle(&patch, "default", HandleDirection::Input, None);
    d.connect(
        "e_patch",
        HandleId::from("code_default_output"),
        p_in,
        data(json!({})),
    );

    let result = compile(&d);
    assert!(result.is_ok(), "errors: {:?}", result.errors);
    let diagram = result.diagram.unwrap();
    let edge = diagram.edge(&"e_patch".into()).unwrap();
    assert_eq!(edge.transforms, vec![TransformRule::Serialize]);
}

#[test]
fn arrow_transform_rules_are_carried_in_order() {
    use crate::domain::TransformRule;
    let mut d = linear_diagram();
    d.arrows[1].data = data(json!({
        "transforms": [{"extract": "a"}, {"wrap": "b"}]
    }));
    let diagram = compile(&d).diagram.unwrap();
    let edge = diagram.edge(&"e2".into()).unwrap();
    assert_eq!(
        edge.transforms,
        vec![
            TransformRule::Extract("a".into()),
            TransformRule::Wrap("b".into()),
        ]
    );
}
