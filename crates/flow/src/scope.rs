//! Reusable sub-graph scopes: nesting-aware discovery of the nodes belonging
//! to a definition, extraction as a standalone workflow, and call-site
//! splicing before execution.

use std::collections::HashSet;

use tracing::debug;

use autoflow_core_types::{Edge, FlowError, Node, NodeId, Workflow};

pub const REUSABLE_KIND: &str = "reusable";
pub const TERMINATOR_KIND: &str = "reusableEnd";
pub const CALL_KIND: &str = "callReusable";

/// Upper bound on call-site expansions per workflow. A well-formed graph
/// stays far below this; hitting it means a recursive call chain.
const MAX_SPLICES: usize = 64;

struct ScopeWalk {
    nodes: HashSet<NodeId>,
    terminator: Option<NodeId>,
}

/// Walk driver edges from the definition entry, tracking nested definitions
/// with a depth counter. A terminator at depth zero ends the scope and is
/// itself part of it; terminators of nested definitions decrement the
/// counter and the walk continues past them.
fn walk_scope(workflow: &Workflow, entry: &NodeId) -> Result<ScopeWalk, FlowError> {
    let mut walk = ScopeWalk {
        nodes: HashSet::new(),
        terminator: None,
    };
    let mut stack: Vec<(NodeId, u32)> = workflow
        .driver_edges_from(entry)
        .map(|edge| (edge.target.clone(), 0))
        .collect();
    while let Some((id, depth)) = stack.pop() {
        if walk.nodes.contains(&id) {
            continue;
        }
        let node = workflow
            .node(&id)
            .ok_or_else(|| FlowError::config(format!("edge references unknown node {id}")))?;
        walk.nodes.insert(id.clone());
        let next_depth = match node.kind.as_str() {
            REUSABLE_KIND => depth + 1,
            TERMINATOR_KIND if depth == 0 => {
                walk.terminator = Some(id);
                continue;
            }
            TERMINATOR_KIND => depth - 1,
            _ => depth,
        };
        for edge in workflow.driver_edges_from(&id) {
            stack.push((edge.target.clone(), next_depth));
        }
    }
    Ok(walk)
}

/// The set of nodes belonging to the definition rooted at `entry`. The entry
/// itself is not part of its own scope.
pub fn scope_nodes(workflow: &Workflow, entry: &NodeId) -> Result<HashSet<NodeId>, FlowError> {
    Ok(walk_scope(workflow, entry)?.nodes)
}

/// The depth-zero terminator of the definition rooted at `entry`, if the
/// scope has one.
pub fn scope_terminator(workflow: &Workflow, entry: &NodeId) -> Result<Option<NodeId>, FlowError> {
    Ok(walk_scope(workflow, entry)?.terminator)
}

/// Extract the definition rooted at `entry` as a standalone workflow. Node
/// order follows the parent workflow; an edge survives when its target lies
/// in scope, which keeps externally-sourced property wiring intact.
pub fn extract(workflow: &Workflow, entry: &NodeId) -> Result<Workflow, FlowError> {
    let entry_node = workflow
        .node(entry)
        .ok_or_else(|| FlowError::config(format!("unknown reusable entry {entry}")))?;
    if entry_node.kind != REUSABLE_KIND {
        return Err(FlowError::config(format!(
            "node {entry} is not a reusable definition"
        )));
    }
    let scope = scope_nodes(workflow, entry)?;
    let mut nodes = vec![entry_node.clone()];
    nodes.extend(
        workflow
            .nodes
            .iter()
            .filter(|node| scope.contains(&node.id))
            .cloned(),
    );
    let edges: Vec<Edge> = workflow
        .edges
        .iter()
        .filter(|edge| scope.contains(&edge.target))
        .cloned()
        .collect();
    let name = entry_node
        .data
        .get("name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or(&entry.0)
        .to_string();
    Ok(Workflow::new(format!("{}::{entry}", workflow.id), nodes, edges).with_name(name))
}

/// Replace every call node with a prefixed copy of the definition it names.
/// Definitions stay in place; the executor steps over them at the top level.
pub fn flatten_calls(workflow: &Workflow) -> Result<Workflow, FlowError> {
    let mut flattened = workflow.clone();
    for _ in 0..MAX_SPLICES {
        let Some(call) = flattened
            .nodes
            .iter()
            .find(|node| node.kind == CALL_KIND)
            .cloned()
        else {
            return Ok(flattened);
        };
        flattened = splice_call(&flattened, &call)?;
    }
    Err(FlowError::config(
        "reusable call expansion did not terminate (recursive call chain?)",
    ))
}

fn reusable_entry<'a>(workflow: &'a Workflow, target: &str) -> Result<&'a Node, FlowError> {
    workflow
        .nodes
        .iter()
        .find(|node| {
            node.kind == REUSABLE_KIND
                && (node.id.0 == target
                    || node.data.get("name").and_then(serde_json::Value::as_str) == Some(target))
        })
        .ok_or_else(|| FlowError::config(format!("call references unknown reusable `{target}`")))
}

fn splice_call(workflow: &Workflow, call: &Node) -> Result<Workflow, FlowError> {
    let target = call
        .data
        .get("reusable")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| FlowError::config(format!("call node {} names no reusable", call.id)))?;
    let entry = reusable_entry(workflow, target)?.id.clone();
    let walk = walk_scope(workflow, &entry)?;
    let prefixed = |id: &NodeId| NodeId::new(format!("{}::{id}", call.id));
    debug!(
        target: "flow",
        call = %call.id, reusable = target, nodes = walk.nodes.len(),
        "splicing reusable call"
    );

    // Where control enters the copy, and where the call pointed next.
    let head = workflow
        .driver_edges_from(&entry)
        .map(|edge| edge.target.clone())
        .find(|id| walk.nodes.contains(id));
    let passthrough = workflow
        .driver_edges_from(&call.id)
        .next()
        .map(|edge| edge.target.clone());

    let mut nodes: Vec<Node> = workflow
        .nodes
        .iter()
        .filter(|node| node.id != call.id)
        .cloned()
        .collect();
    for node in workflow.nodes.iter().filter(|n| walk.nodes.contains(&n.id)) {
        let mut copy = node.clone();
        copy.id = prefixed(&node.id);
        nodes.push(copy);
    }

    let mut edges: Vec<Edge> = Vec::new();
    for edge in &workflow.edges {
        if edge.target == call.id && edge.is_driver() {
            let rewired_target = match (&head, &passthrough) {
                (Some(head), _) => Some(prefixed(head)),
                // Empty definition body: the call is a pass-through.
                (None, Some(next)) => Some(next.clone()),
                (None, None) => None,
            };
            if let Some(target) = rewired_target {
                let mut rewired = edge.clone();
                rewired.target = target;
                edges.push(rewired);
            }
            continue;
        }
        if edge.source == call.id || edge.target == call.id {
            // Remaining wiring into the call has no meaning once spliced.
            continue;
        }
        edges.push(edge.clone());
    }

    // Copy in-scope edges with prefixed endpoints. Sources outside the scope
    // are external property wiring and keep their original id.
    for edge in workflow.edges.iter().filter(|e| walk.nodes.contains(&e.target)) {
        if edge.source == entry {
            continue;
        }
        let mut copy = edge.clone();
        copy.target = prefixed(&edge.target);
        if walk.nodes.contains(&edge.source) {
            copy.source = prefixed(&edge.source);
        }
        edges.push(copy);
    }

    // The copy's terminator continues where the call pointed.
    if let Some(terminator) = &walk.terminator {
        if head.is_some() {
            for edge in workflow.driver_edges_from(&call.id) {
                let mut rewired = edge.clone();
                rewired.source = prefixed(terminator);
                edges.push(rewired);
            }
        }
    }

    Ok(Workflow::new(workflow.id.clone(), nodes, edges).with_name(workflow.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, kind: &str) -> Node {
        Node::new(id, kind)
    }

    fn nested_workflow() -> Workflow {
        // r1 -> a -> r2 -> b -> end2 -> c -> end1 -> d
        Workflow::new(
            "wf",
            vec![
                node("r1", REUSABLE_KIND).with_data(json!({"name": "outer"})),
                node("a", "click"),
                node("r2", REUSABLE_KIND),
                node("b", "click"),
                node("end2", TERMINATOR_KIND),
                node("c", "click"),
                node("end1", TERMINATOR_KIND),
                node("d", "click"),
            ],
            vec![
                Edge::driver("r1", "a"),
                Edge::driver("a", "r2"),
                Edge::driver("r2", "b"),
                Edge::driver("b", "end2"),
                Edge::driver("end2", "c"),
                Edge::driver("c", "end1"),
                Edge::driver("end1", "d"),
            ],
        )
    }

    #[test]
    fn nested_definitions_stay_inside_the_outer_scope() {
        let workflow = nested_workflow();
        let scope = scope_nodes(&workflow, &NodeId::new("r1")).unwrap();
        for id in ["a", "r2", "b", "end2", "c", "end1"] {
            assert!(scope.contains(&NodeId::new(id)), "missing {id}");
        }
        assert!(!scope.contains(&NodeId::new("d")));
        assert_eq!(
            scope_terminator(&workflow, &NodeId::new("r1")).unwrap(),
            Some(NodeId::new("end1"))
        );
    }

    #[test]
    fn extract_keeps_external_property_wiring() {
        let mut workflow = nested_workflow();
        // An out-of-scope node feeding a value into `b`.
        workflow.nodes.push(node("config", "setVariable"));
        workflow
            .edges
            .push(Edge::driver("config", "b").with_target_handle("value"));

        let extracted = extract(&workflow, &NodeId::new("r1")).unwrap();
        assert_eq!(extracted.name, "outer");
        assert!(extracted.node(&NodeId::new("b")).is_some());
        assert!(extracted.node(&NodeId::new("d")).is_none());
        assert!(extracted
            .edges
            .iter()
            .any(|e| e.source == NodeId::new("config") && e.target == NodeId::new("b")));
    }

    #[test]
    fn flatten_splices_the_named_definition() {
        let workflow = Workflow::new(
            "wf",
            vec![
                node("start", "start"),
                node("call1", CALL_KIND).with_data(json!({"reusable": "login"})),
                node("after", "click"),
                node("rdef", REUSABLE_KIND).with_data(json!({"name": "login"})),
                node("s1", "click"),
                node("rend", TERMINATOR_KIND),
            ],
            vec![
                Edge::driver("start", "call1"),
                Edge::driver("call1", "after"),
                Edge::driver("rdef", "s1"),
                Edge::driver("s1", "rend"),
            ],
        );
        let flattened = flatten_calls(&workflow).unwrap();

        // The call node is gone, replaced with a prefixed copy of the body.
        assert!(flattened.node(&NodeId::new("call1")).is_none());
        assert!(flattened.node(&NodeId::new("call1::s1")).is_some());
        assert!(flattened
            .edges
            .iter()
            .any(|e| e.source == NodeId::new("start") && e.target == NodeId::new("call1::s1")));
        assert!(flattened
            .edges
            .iter()
            .any(|e| e.source == NodeId::new("call1::rend") && e.target == NodeId::new("after")));
        // The definition itself stays in place.
        assert!(flattened.node(&NodeId::new("rdef")).is_some());
    }

    #[test]
    fn recursive_calls_are_rejected() {
        let workflow = Workflow::new(
            "wf",
            vec![
                node("start", "start"),
                node("call1", CALL_KIND).with_data(json!({"reusable": "loop"})),
                node("rdef", REUSABLE_KIND).with_data(json!({"name": "loop"})),
                node("inner", CALL_KIND).with_data(json!({"reusable": "loop"})),
                node("rend", TERMINATOR_KIND),
            ],
            vec![
                Edge::driver("start", "call1"),
                Edge::driver("rdef", "inner"),
                Edge::driver("inner", "rend"),
            ],
        );
        assert!(matches!(
            flatten_calls(&workflow),
            Err(FlowError::Config(_))
        ));
    }
}
