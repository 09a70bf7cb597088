use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::MetadataCommand;

/// A package and the crates it must never reach, directly or transitively.
struct Rule {
    package: &'static str,
    forbidden: &'static [&'static str],
}

const RULES: &[Rule] = &[
    Rule {
        package: "gatehouse-auth",
        forbidden: &["gatehouse-gateway", "gatehouse-policy"],
    },
    Rule {
        package: "gatehouse-policy",
        forbidden: &["gatehouse-gateway", "gatehouse-auth"],
    },
    Rule {
        package: "gatehouse-contracts",
        forbidden: &["gatehouse-gateway", "gatehouse-auth", "gatehouse-policy"],
    },
];

type DependencyGraph = HashMap<String, Vec<String>>;

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let id_to_name: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.to_string()))
        .collect();

    let graph: DependencyGraph = resolve
        .nodes
        .iter()
        .filter_map(|node| {
            let name = id_to_name.get(&node.id)?.clone();
            let deps = node
                .deps
                .iter()
                .filter_map(|dep| id_to_name.get(&dep.pkg).cloned())
                .collect();
            Some((name, deps))
        })
        .collect();

    let mut failed = false;
    for rule in RULES {
        if !graph.contains_key(rule.package) {
            anyhow::bail!("package `{}` not found in workspace", rule.package);
        }

        let violations = forbidden_reachable(&graph, rule);
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                rule.package,
                rule.forbidden.join(", ")
            );
        } else {
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                rule.package,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn forbidden_reachable(graph: &DependencyGraph, rule: &Rule) -> Vec<String> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(rule.package);
    visited.insert(rule.package);

    let mut violations = Vec::new();
    while let Some(current) = queue.pop_front() {
        let Some(deps) = graph.get(current) else {
            continue;
        };

        for dep in deps {
            if !visited.insert(dep.as_str()) {
                continue;
            }
            if rule.forbidden.contains(&dep.as_str()) {
                violations.push(dep.clone());
            }
            queue.push_back(dep.as_str());
        }
    }

    violations.sort();
    violations
}
