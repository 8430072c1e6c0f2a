//! Property tests for the task graph.

use proptest::prelude::*;

use braid::core::{TaskGraph, TaskId, TaskNode};
use braid::error::StructuralError;
use braid::Error;

fn id(i: usize) -> TaskId {
    TaskId::from(format!("t{}", i))
}

proptest! {
    /// Whatever edges are requested, the graph stays acyclic: accepted edges
    /// respect a topological order and their reverse is always refused.
    #[test]
    fn prop_dependencies_never_form_cycles(
        n in 2usize..12,
        edges in prop::collection::vec((0usize..12, 0usize..12), 0..40),
    ) {
        let mut graph = TaskGraph::new("prop", "main");
        for i in 0..n {
            graph.add_task(TaskNode::new(id(i), "node"), None).unwrap();
        }

        let mut accepted = Vec::new();
        for (a, b) in edges {
            let (a, b) = (a % n, b % n);
            match graph.add_dependency(&id(a), &id(b)) {
                Ok(()) => accepted.push((a, b)),
                Err(Error::Structural(StructuralError::Cycle { .. })) => {}
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }
        }

        let order: Vec<TaskId> = graph
            .topological_order()
            .unwrap()
            .into_iter()
            .map(|node| node.id.clone())
            .collect();
        prop_assert_eq!(order.len(), n);
        for &(task, dependency) in &accepted {
            let task_pos = order.iter().position(|t| t == &id(task)).unwrap();
            let dep_pos = order.iter().position(|t| t == &id(dependency)).unwrap();
            prop_assert!(dep_pos < task_pos);

            let reverse = graph.add_dependency(&id(dependency), &id(task));
            prop_assert!(
                matches!(reverse, Err(Error::Structural(StructuralError::Cycle { .. }))),
                "reverse of accepted edge must be refused"
            );
        }
    }

    /// A rejected insertion leaves the graph exactly as it was.
    #[test]
    fn prop_rejected_add_task_changes_nothing(n in 1usize..8, missing in 8usize..16) {
        let mut graph = TaskGraph::new("prop", "main");
        for i in 0..n {
            let mut node = TaskNode::new(id(i), "node");
            if i > 0 {
                node = node.depends_on(id(i - 1));
            }
            graph.add_task(node, None).unwrap();
        }
        let before = graph.snapshot().nodes;

        let bad = TaskNode::new("bad", "bad").depends_on(id(0)).depends_on(id(missing));
        prop_assert!(graph.add_task(bad, None).unwrap_err().is_structural());
        prop_assert!(!graph.contains(&TaskId::from("bad")));
        prop_assert_eq!(graph.snapshot().nodes, before);
    }
}
