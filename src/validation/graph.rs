//! Graph traversal helpers: successor lists, cycle search, reachability

use crate::config::{END, EdgeTarget, START, WorkflowSpec};
use std::collections::{HashMap, HashSet, VecDeque};

/// Adjacency built from edge declarations, in declaration order
pub struct Adjacency<'a> {
    /// All targets, including loop re-entries
    pub all: HashMap<&'a str, Vec<&'a str>>,
    /// Targets excluding loop re-entries (the graph that must be acyclic)
    pub forward: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> Adjacency<'a> {
    pub fn build(spec: &'a WorkflowSpec) -> Self {
        let mut all: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut forward: HashMap<&str, Vec<&str>> = HashMap::new();

        for edge in &spec.edges {
            let from = edge.from.as_str();
            let (targets, reentry): (Vec<&str>, Option<&str>) = match &edge.target {
                EdgeTarget::To(to) => (vec![to.as_str()], None),
                EdgeTarget::Routes(routes) => (routes.iter().map(|r| r.to.as_str()).collect(), None),
                EdgeTarget::Loop(spec) => (
                    vec![spec.exit_to.as_str()],
                    Some(spec.reenter.as_deref().unwrap_or(from)),
                ),
                EdgeTarget::Parallel(spec) => (vec![spec.target_node.as_str()], None),
            };

            let fwd = forward.entry(from).or_default();
            for t in &targets {
                if !fwd.contains(t) {
                    fwd.push(t);
                }
            }
            let every = all.entry(from).or_default();
            for t in targets.into_iter().chain(reentry) {
                if !every.contains(&t) {
                    every.push(t);
                }
            }
        }

        Self { all, forward }
    }
}

/// Depth-first search with an explicit recursion stack. Returns the first
/// cycle found as `[a, b, c, a]`. Roots are visited in `roots` order.
pub fn find_cycle<'a>(
    successors: &HashMap<&'a str, Vec<&'a str>>,
    roots: &[&'a str],
) -> Option<Vec<String>> {
    const ON_STACK: u8 = 1;
    const DONE: u8 = 2;

    let mut color: HashMap<&str, u8> = HashMap::new();
    let empty: Vec<&str> = Vec::new();

    for &root in roots {
        if color.contains_key(root) {
            continue;
        }

        let mut path: Vec<&str> = vec![root];
        let mut cursor: Vec<usize> = vec![0];
        color.insert(root, ON_STACK);

        while let Some(&node) = path.last() {
            let next_index = cursor.last().copied().unwrap_or(0);
            let next = successors.get(node).unwrap_or(&empty).get(next_index).copied();

            match next {
                Some(next) => {
                    if let Some(c) = cursor.last_mut() {
                        *c += 1;
                    }
                    match color.get(next).copied() {
                        Some(ON_STACK) => {
                            let start = path.iter().position(|n| *n == next).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|n| n.to_string()).collect();
                            cycle.push(next.to_string());
                            return Some(cycle);
                        }
                        Some(_) => {}
                        None => {
                            color.insert(next, ON_STACK);
                            path.push(next);
                            cursor.push(0);
                        }
                    }
                }
                None => {
                    color.insert(node, DONE);
                    path.pop();
                    cursor.pop();
                }
            }
        }
    }

    None
}

/// Breadth-first reachability from `start`
pub fn reachable<'a>(
    successors: &HashMap<&'a str, Vec<&'a str>>,
    start: &'a str,
) -> HashSet<&'a str> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    seen.insert(start);
    queue.push_back(start);

    while let Some(node) = queue.pop_front() {
        if let Some(nexts) = successors.get(node) {
            for &next in nexts {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }

    seen
}

/// Reverse every edge
pub fn reversed<'a>(successors: &HashMap<&'a str, Vec<&'a str>>) -> HashMap<&'a str, Vec<&'a str>> {
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for (&from, targets) in successors {
        for &to in targets {
            reverse.entry(to).or_default().push(from);
        }
    }
    reverse
}

/// Roots for cycle search: START first, then nodes in declaration order
pub fn search_roots(spec: &WorkflowSpec) -> Vec<&str> {
    std::iter::once(START)
        .chain(spec.nodes.iter().map(|n| n.id.as_str()))
        .chain(std::iter::once(END))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph<'a>(edges: &[(&'a str, &'a str)]) -> HashMap<&'a str, Vec<&'a str>> {
        let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, to) in edges {
            map.entry(*from).or_default().push(*to);
        }
        map
    }

    #[test]
    fn test_find_cycle_reports_path() {
        let g = graph(&[("START", "A"), ("A", "B"), ("B", "C"), ("C", "A")]);
        let cycle = find_cycle(&g, &["START", "A", "B", "C"]).unwrap();
        assert_eq!(cycle, vec!["A", "B", "C", "A"]);
    }

    #[test]
    fn test_find_cycle_none_for_dag() {
        let g = graph(&[("START", "A"), ("A", "B"), ("A", "C"), ("B", "END"), ("C", "END")]);
        assert!(find_cycle(&g, &["START", "A", "B", "C", "END"]).is_none());
    }

    #[test]
    fn test_self_loop() {
        let g = graph(&[("START", "A"), ("A", "A")]);
        assert_eq!(find_cycle(&g, &["START"]).unwrap(), vec!["A", "A"]);
    }

    #[test]
    fn test_reachability_forward_and_reverse() {
        let g = graph(&[("START", "A"), ("A", "END"), ("B", "END"), ("C", "D")]);
        let forward = reachable(&g, "START");
        assert!(forward.contains("A"));
        assert!(!forward.contains("B"));

        let back = reachable(&reversed(&g), "END");
        assert!(back.contains("B"));
        assert!(!back.contains("C"));
    }
}
