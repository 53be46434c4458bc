//! Workflow graph validation
//!
//! Stages run in a fixed order and the first failure wins:
//!
//! 0. Document shape (non-empty sections, unique identifier-safe node ids)
//! 1. Edge endpoints exist
//! 2. Node outputs name state fields
//! 3. Output schemas agree with outputs
//! 4. Output types match state field types
//! 5. Placeholders and route conditions resolve
//! 6. State field types parse
//! 7. Execution-mode structure (edge kinds, one edge per node, cycles)
//! 8. Reachability from START and to END

mod error;
mod graph;
mod pipeline;

pub use error::ValidationError;
pub use pipeline::{GraphValidator, validate};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkflowSpec;
    use serde_json::json;

    fn node(id: &str, prompt: &str, output: &str) -> serde_json::Value {
        json!({
            "id": id,
            "prompt": prompt,
            "outputs": [output],
            "output_schema": {"type": "str"}
        })
    }

    fn doc(nodes: serde_json::Value, edges: serde_json::Value) -> WorkflowSpec {
        serde_json::from_value(json!({
            "flow": {"name": "test"},
            "state": {"fields": {
                "topic": {"type": "str", "required": true},
                "summary": {"type": "str"},
                "draft": {"type": "str"},
                "score": {"type": "int"}
            }},
            "nodes": nodes,
            "edges": edges
        }))
        .unwrap()
    }

    fn chain() -> WorkflowSpec {
        doc(
            json!([node("summarize", "Summarize {topic}", "summary")]),
            json!([
                {"from": "START", "to": "summarize"},
                {"from": "summarize", "to": "END"}
            ]),
        )
    }

    #[test]
    fn test_valid_chain() {
        assert!(validate(&chain()).is_ok());
    }

    #[test]
    fn test_validation_is_idempotent() {
        let spec = chain();
        assert_eq!(validate(&spec), validate(&spec));

        let mut broken = chain();
        broken.nodes[0].outputs = vec!["sumary".into()];
        let first = validate(&broken).unwrap_err();
        let second = validate(&broken).unwrap_err();
        assert_eq!(first, second);
        assert_eq!(first.stage, "outputs");
        assert_eq!(first.suggestion.as_deref(), Some("summary"));
    }

    #[test]
    fn test_cycle_reported_in_order() {
        let spec = doc(
            json!([
                node("A", "{topic}", "summary"),
                node("B", "{summary}", "draft"),
                node("C", "{draft}", "summary")
            ]),
            json!([
                {"from": "START", "to": "A"},
                {"from": "A", "to": "B"},
                {"from": "B", "to": "C"},
                {"from": "C", "to": "A"}
            ]),
        );
        let err = validate(&spec).unwrap_err();
        assert_eq!(err.stage, "structure");
        assert!(err.message.contains("A -> B -> C -> A"), "{}", err.message);
        assert_eq!(err.location, "A -> B -> C -> A");
    }

    #[test]
    fn test_unreachable_node_named() {
        let spec = doc(
            json!([
                node("summarize", "{topic}", "summary"),
                node("orphan", "{topic}", "draft")
            ]),
            json!([
                {"from": "START", "to": "summarize"},
                {"from": "summarize", "to": "END"},
                {"from": "orphan", "to": "END"}
            ]),
        );
        let err = validate(&spec).unwrap_err();
        assert_eq!(err.stage, "reachability");
        assert!(err.message.contains("'orphan'"));
        assert!(err.message.contains("not reachable from START"));
    }

    #[test]
    fn test_dead_end_node_named() {
        let spec = doc(
            json!([
                node("summarize", "{topic}", "summary"),
                node("stuck", "{topic}", "draft")
            ]),
            json!([
                {"from": "START", "to": "summarize"},
                {"from": "summarize", "to": "stuck"}
            ]),
        );
        let err = validate(&spec).unwrap_err();
        assert!(err.message.contains("'summarize' has no path to END"), "{}", err.message);
    }

    #[test]
    fn test_unknown_edge_target_suggests() {
        let spec = doc(
            json!([node("summarize", "{topic}", "summary")]),
            json!([
                {"from": "START", "to": "sumarize"},
                {"from": "summarize", "to": "END"}
            ]),
        );
        let err = validate(&spec).unwrap_err();
        assert_eq!(err.stage, "edge_endpoints");
        assert_eq!(err.suggestion.as_deref(), Some("summarize"));
    }

    #[test]
    fn test_output_type_mismatch() {
        let mut spec = chain();
        spec.nodes[0].outputs = vec!["score".into()];
        let err = validate(&spec).unwrap_err();
        assert_eq!(err.stage, "output_types");
    }

    #[test]
    fn test_object_schema_must_match_outputs() {
        let spec = doc(
            json!([{
                "id": "split",
                "prompt": "{topic}",
                "outputs": ["summary", "draft"],
                "output_schema": {"type": "object", "fields": {"summary": {"type": "str"}}}
            }]),
            json!([
                {"from": "START", "to": "split"},
                {"from": "split", "to": "END"}
            ]),
        );
        let err = validate(&spec).unwrap_err();
        assert_eq!(err.stage, "output_schema");
        assert!(err.message.contains("missing: [draft]"));
    }

    #[test]
    fn test_unknown_placeholder() {
        let spec = doc(
            json!([node("summarize", "Summarize {tpoic}", "summary")]),
            json!([
                {"from": "START", "to": "summarize"},
                {"from": "summarize", "to": "END"}
            ]),
        );
        let err = validate(&spec).unwrap_err();
        assert_eq!(err.stage, "placeholders");
        assert_eq!(err.suggestion.as_deref(), Some("topic"));
    }

    #[test]
    fn test_prompt_may_use_local_inputs() {
        let spec = doc(
            json!([{
                "id": "summarize",
                "inputs": {"subject": "{state.topic}"},
                "prompt": "Summarize {subject}",
                "outputs": ["summary"],
                "output_schema": {"type": "str"}
            }]),
            json!([
                {"from": "START", "to": "summarize"},
                {"from": "summarize", "to": "END"}
            ]),
        );
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn test_linear_mode_rejects_routes() {
        let spec = doc(
            json!([node("summarize", "{topic}", "summary")]),
            json!([
                {"from": "START", "to": "summarize"},
                {"from": "summarize", "routes": [{"condition": "", "to": "END"}]}
            ]),
        );
        let err = validate(&spec).unwrap_err();
        assert_eq!(err.stage, "structure");
        assert!(err.message.contains("extended"));
    }

    #[test]
    fn test_extended_mode_allows_loop_reentry() {
        let mut spec: WorkflowSpec = serde_json::from_value(json!({
            "flow": {"name": "loop"},
            "state": {"fields": {
                "topic": {"type": "str"},
                "draft": {"type": "str"},
                "needs_work": {"type": "bool", "default": true}
            }},
            "nodes": [{
                "id": "write",
                "prompt": "{topic}",
                "outputs": ["draft", "needs_work"],
                "output_schema": {"type": "object", "fields": {
                    "draft": {"type": "str"},
                    "needs_work": {"type": "bool"}
                }}
            }],
            "edges": [
                {"from": "START", "to": "write"},
                {"from": "write", "loop": {"condition_field": "needs_work", "max_iterations": 3, "exit_to": "END"}}
            ],
            "config": {"execution": {"mode": "extended"}}
        }))
        .unwrap();
        assert!(validate(&spec).is_ok());

        spec.config.execution.mode = None;
        assert_eq!(validate(&spec).unwrap_err().stage, "structure");
    }

    #[test]
    fn test_parallel_target_may_use_item() {
        let spec: WorkflowSpec = serde_json::from_value(json!({
            "flow": {"name": "fanout"},
            "state": {"fields": {
                "docs": {"type": "list[str]", "required": true},
                "summary": {"type": "str"},
                "summaries": {"type": "list"}
            }},
            "nodes": [
                {"id": "prepare", "prompt": "List {docs}", "outputs": ["docs"], "output_schema": {"type": "list[str]"}},
                {"id": "summarize", "inputs": {"doc": "{item}"}, "prompt": "Summarize {doc}", "outputs": ["summary"], "output_schema": {"type": "str"}}
            ],
            "edges": [
                {"from": "START", "to": "prepare"},
                {"from": "prepare", "parallel": {"items_field": "docs", "target_node": "summarize", "collect_field": "summaries"}},
                {"from": "summarize", "to": "END"}
            ],
            "config": {"execution": {"mode": "extended"}}
        }))
        .unwrap();
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn test_parallel_target_prompt_may_use_item_and_index() {
        let fanout: WorkflowSpec = serde_json::from_value(json!({
            "flow": {"name": "fanout"},
            "state": {"fields": {
                "docs": {"type": "list[str]", "required": true},
                "summary": {"type": "str"},
                "summaries": {"type": "list"}
            }},
            "nodes": [
                {"id": "prepare", "prompt": "List {docs}", "outputs": ["docs"], "output_schema": {"type": "list[str]"}},
                {"id": "summarize", "prompt": "Summarize {item} (#{index})", "outputs": ["summary"], "output_schema": {"type": "str"}}
            ],
            "edges": [
                {"from": "START", "to": "prepare"},
                {"from": "prepare", "parallel": {"items_field": "docs", "target_node": "summarize", "collect_field": "summaries"}},
                {"from": "summarize", "to": "END"}
            ],
            "config": {"execution": {"mode": "extended"}}
        }))
        .unwrap();
        assert!(validate(&fanout).is_ok());

        // Outside a parallel edge `item` is just an unknown name
        let spec = doc(
            json!([node("summarize", "Summarize {item}", "summary")]),
            json!([
                {"from": "START", "to": "summarize"},
                {"from": "summarize", "to": "END"}
            ]),
        );
        let err = validate(&spec).unwrap_err();
        assert_eq!(err.stage, "placeholders");
        assert!(err.message.contains("'item'"));
    }

    #[test]
    fn test_reserved_and_duplicate_ids() {
        let spec = doc(
            json!([node("END", "{topic}", "summary")]),
            json!([{"from": "START", "to": "END"}]),
        );
        assert!(validate(&spec).unwrap_err().message.contains("reserved"));

        let spec = doc(
            json!([node("a", "{topic}", "summary"), node("a", "{topic}", "draft")]),
            json!([{"from": "START", "to": "a"}, {"from": "a", "to": "END"}]),
        );
        assert!(validate(&spec).unwrap_err().message.contains("duplicate"));
    }

    #[test]
    fn test_invalid_state_type() {
        let spec: WorkflowSpec = serde_json::from_value(json!({
            "flow": {"name": "t"},
            "state": {"fields": {
                "topic": {"type": "str"},
                "summary": {"type": "str"},
                "extra": {"type": "lst[int]"}
            }},
            "nodes": [node("summarize", "{topic}", "summary")],
            "edges": [
                {"from": "START", "to": "summarize"},
                {"from": "summarize", "to": "END"}
            ]
        }))
        .unwrap();
        let err = validate(&spec).unwrap_err();
        assert_eq!(err.stage, "state_types");
        assert_eq!(err.location, "state.fields.extra");
    }
}
