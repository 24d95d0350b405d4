//! Pipeline graph extraction.
//!
//! Builds the producer/consumer structure the grouping engine operates
//! on: a deterministic realization order of the environment and the
//! child relation between function stages.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::function::{FStage, PipelineEnv};

/// Topological realization order of the environment, producers first.
/// Ties are broken by name so the order is total and reproducible.
pub fn realization_order(env: &PipelineEnv) -> Vec<String> {
    let mut producers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut consumers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for id in env.func_ids() {
        let f = env.func(id);
        let name = f.name().to_string();
        producers.entry(name.clone()).or_default();
        for s in 0..f.num_stages() {
            for callee in f.stage_callees(s) {
                if callee != name && env.contains(&callee) {
                    producers.entry(name.clone()).or_default().insert(callee.clone());
                    consumers.entry(callee).or_default().insert(name.clone());
                }
            }
        }
    }

    let mut ready: BTreeSet<String> = producers
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(n, _)| n.clone())
        .collect();
    let mut order = Vec::with_capacity(producers.len());

    while let Some(name) = ready.iter().next().cloned() {
        ready.remove(&name);
        order.push(name.clone());
        if let Some(cons) = consumers.get(&name) {
            for c in cons.clone() {
                let deps = producers.get_mut(&c).expect("consumer is in environment");
                deps.remove(&name);
                if deps.is_empty() {
                    ready.insert(c);
                }
            }
        }
        producers.remove(&name);
    }

    assert!(
        producers.is_empty(),
        "cycle in pipeline call graph: {:?}",
        producers.keys().collect::<Vec<_>>()
    );
    order
}

/// The child stages of every stage: consumers of the values a stage
/// computes. A consumer depends only on the final stage of a
/// multi-stage producer; stage `s` of a function additionally consumes
/// stage `s - 1`. Calls to pipeline inputs contribute no edges.
pub fn build_children(env: &PipelineEnv) -> BTreeMap<FStage, BTreeSet<FStage>> {
    let mut children: BTreeMap<FStage, BTreeSet<FStage>> = BTreeMap::new();
    for id in env.func_ids() {
        let f = env.func(id);
        for s in 0..f.num_stages() {
            let cons_stage = FStage::new(id, s);
            for callee in f.stage_callees(s) {
                if callee == f.name() {
                    continue;
                }
                if let Some(prod_id) = env.lookup(&callee) {
                    let prod_stage = env.final_stage(prod_id);
                    children.entry(prod_stage).or_default().insert(cons_stage);
                }
            }
            if s > 0 {
                children
                    .entry(FStage::new(id, s - 1))
                    .or_default()
                    .insert(cons_stage);
            }
        }
    }
    children
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::function::{ElemType, Function, Pipeline};
    use crate::ir::Expr;

    fn chain_pipeline() -> Pipeline {
        let f = Function::new("f", &["x"], ElemType::Int32).define(Expr::var("x"));
        let g = Function::new("g", &["x"], ElemType::Int32)
            .define(Expr::call("f", vec![Expr::var("x")]));
        let h = Function::new("h", &["x"], ElemType::Int32)
            .define(Expr::call("g", vec![Expr::var("x")]));
        Pipeline::new(vec![f, g, h], vec![], &["h"]).unwrap()
    }

    #[test]
    fn test_realization_order_producers_first() {
        let p = chain_pipeline();
        let order = realization_order(p.env());
        assert_eq!(order, vec!["f", "g", "h"]);
    }

    #[test]
    fn test_children_chain() {
        let p = chain_pipeline();
        let children = build_children(p.env());
        let f = p.env().lookup("f").unwrap();
        let g = p.env().lookup("g").unwrap();
        let h = p.env().lookup("h").unwrap();
        let f_children = &children[&FStage::new(f, 0)];
        assert!(f_children.contains(&FStage::new(g, 0)));
        let g_children = &children[&FStage::new(g, 0)];
        assert!(g_children.contains(&FStage::new(h, 0)));
        assert!(!children.contains_key(&FStage::new(h, 0)));
    }

    #[test]
    fn test_children_update_stage_edge() {
        let s = Function::new("s", &["x"], ElemType::Int32)
            .define(Expr::Const(0))
            .update(
                vec![Expr::var("x")],
                Expr::call("s", vec![Expr::var("x")]) + Expr::Const(1),
                vec![crate::ir::function::RVar::new("r", 0, 16)],
            );
        let p = Pipeline::new(vec![s], vec![], &["s"]).unwrap();
        let children = build_children(p.env());
        let s_id = p.env().lookup("s").unwrap();
        // Stage 0 feeds stage 1.
        assert!(children[&FStage::new(s_id, 0)].contains(&FStage::new(s_id, 1)));
    }
}
