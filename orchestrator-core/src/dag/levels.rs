//! Level computation — Kahn's algorithm over `depends_on`, plus advisory
//! file-conflict detection within a level.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

use super::issue::Issue;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("cycle detected among issues: {0:?}")]
    Cycle(Vec<String>),
    #[error("issue {0} depends on unknown issue {1}")]
    DanglingDependency(String, String),
}

/// A pair of issues in the same level whose touched-file sets intersect.
/// Advisory only — never blocks scheduling (§4.4, Open Questions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConflict {
    pub level_index: usize,
    pub issue_a: String,
    pub issue_b: String,
    pub files: BTreeSet<String>,
}

/// Compute execution levels by Kahn's algorithm over the `depends_on` relation
/// restricted to `issues`. Dependencies pointing outside `issues` are treated
/// as already satisfied (this is how completed issues drop out of releveling).
///
/// Ordering within a level is stable by `sequence_number` (ties by name) to
/// satisfy the round-trip idempotence property in §8.
pub fn compute_levels(issues: &BTreeMap<String, Issue>) -> Result<Vec<Vec<String>>, DagError> {
    let names: BTreeSet<&String> = issues.keys().collect();

    // in-degree counts only dependencies that are present in this issue set.
    let mut indegree: BTreeMap<String, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, issue) in issues {
        let deg = issue
            .depends_on
            .iter()
            .filter(|dep| names.contains(dep))
            .count();
        indegree.insert(name.clone(), deg);
        for dep in &issue.depends_on {
            if names.contains(dep) {
                dependents.entry(dep.clone()).or_default().push(name.clone());
            }
        }
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut remaining = indegree.clone();
    let mut processed = 0usize;

    loop {
        let mut ready: Vec<String> = remaining
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(name, _)| name.clone())
            .collect();
        if ready.is_empty() {
            break;
        }
        ready.sort_by_key(|name| (issues[name].sequence_number, name.clone()));
        for name in &ready {
            remaining.remove(name);
        }

        let mut queue: VecDeque<String> = ready.iter().cloned().collect();
        while let Some(name) = queue.pop_front() {
            if let Some(deps) = dependents.get(&name) {
                for dep in deps {
                    if let Some(d) = remaining.get_mut(dep) {
                        *d -= 1;
                    }
                }
            }
        }

        processed += ready.len();
        levels.push(ready);
    }

    if processed != issues.len() {
        let cycle_members: Vec<String> = remaining.keys().cloned().collect();
        return Err(DagError::Cycle(cycle_members));
    }

    Ok(levels)
}

/// Pairwise intersection of `files_touched()` within each level.
pub fn detect_file_conflicts(issues: &BTreeMap<String, Issue>, levels: &[Vec<String>]) -> Vec<FileConflict> {
    let mut conflicts = Vec::new();
    for (level_index, level) in levels.iter().enumerate() {
        for i in 0..level.len() {
            for j in (i + 1)..level.len() {
                let a = &issues[&level[i]];
                let b = &issues[&level[j]];
                let files_a = a.files_touched();
                let files_b = b.files_touched();
                let overlap: BTreeSet<String> = files_a.intersection(&files_b).cloned().collect();
                if !overlap.is_empty() {
                    conflicts.push(FileConflict {
                        level_index,
                        issue_a: a.name.clone(),
                        issue_b: b.name.clone(),
                        files: overlap,
                    });
                }
            }
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(name: &str, seq: u32, deps: &[&str]) -> Issue {
        let mut i = Issue::new(name, name, seq);
        i.depends_on = deps.iter().map(|d| d.to_string()).collect();
        i
    }

    #[test]
    fn independent_issues_single_level() {
        let mut issues = BTreeMap::new();
        for (n, s) in [("a", 1), ("b", 2), ("c", 3)] {
            issues.insert(n.to_string(), issue(n, s, &[]));
        }
        let levels = compute_levels(&issues).unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0], vec!["a", "b", "c"]);
    }

    #[test]
    fn chain_produces_n_levels() {
        let mut issues = BTreeMap::new();
        issues.insert("a".into(), issue("a", 1, &[]));
        issues.insert("b".into(), issue("b", 2, &["a"]));
        issues.insert("c".into(), issue("c", 3, &["b"]));
        let levels = compute_levels(&issues).unwrap();
        assert_eq!(levels, vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]);
    }

    #[test]
    fn root_with_two_children_single_second_level() {
        let mut issues = BTreeMap::new();
        issues.insert("root".into(), issue("root", 1, &[]));
        issues.insert("b".into(), issue("b", 2, &["root"]));
        issues.insert("c".into(), issue("c", 3, &["root"]));
        let levels = compute_levels(&issues).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], vec!["root".to_string()]);
        assert_eq!(levels[1], vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut issues = BTreeMap::new();
        issues.insert("a".into(), issue("a", 1, &["b"]));
        issues.insert("b".into(), issue("b", 2, &["a"]));
        let err = compute_levels(&issues).unwrap_err();
        match err {
            DagError::Cycle(mut members) => {
                members.sort();
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            _ => panic!("expected cycle error"),
        }
    }

    #[test]
    fn dependency_outside_set_treated_as_satisfied() {
        // "a" depended on "root" which is not part of this (remaining) issue set —
        // models a completed issue dropping out of releveling.
        let mut issues = BTreeMap::new();
        issues.insert("a".into(), issue("a", 1, &["root"]));
        let levels = compute_levels(&issues).unwrap();
        assert_eq!(levels, vec![vec!["a".to_string()]]);
    }

    #[test]
    fn recompute_is_stable_over_unchanged_graph() {
        let mut issues = BTreeMap::new();
        issues.insert("b".into(), issue("b", 2, &["a"]));
        issues.insert("a".into(), issue("a", 1, &[]));
        let levels1 = compute_levels(&issues).unwrap();
        let levels2 = compute_levels(&issues).unwrap();
        assert_eq!(levels1, levels2);
    }

    #[test]
    fn file_conflicts_are_advisory_pairwise() {
        let mut issues = BTreeMap::new();
        let mut a = issue("a", 1, &[]);
        a.files_to_modify.insert("shared.rs".into());
        let mut b = issue("b", 2, &[]);
        b.files_to_modify.insert("shared.rs".into());
        issues.insert("a".into(), a);
        issues.insert("b".into(), b);
        let levels = vec![vec!["a".to_string(), "b".to_string()]];
        let conflicts = detect_file_conflicts(&issues, &levels);
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].files.contains("shared.rs"));
    }
}
