mod common;

use std::collections::BTreeSet;

use common::Harness;
use lubrikit_engine::PipelineBuilder;
use proptest::prelude::*;

/// YAML for `reader -> p0 -> ... -> p{k-1} -> writer` plus `extra` edges
/// between processors.
fn pipeline_yaml(processors: usize, extra: &[(usize, usize)], ordered: bool, workers: usize) -> String {
    let mut stages = String::from(
        "  - name: reader\n    type: sequence\n  - name: writer\n    type: recorder\n",
    );
    for i in 0..processors {
        stages.push_str(&format!(
            "  - name: p{i}\n    type: passthrough\n    concurrency: {workers}\n"
        ));
    }

    let mut edges = String::from("  - from: reader\n    to: p0\n");
    for i in 1..processors {
        edges.push_str(&format!("  - from: p{}\n    to: p{i}\n", i - 1));
    }
    edges.push_str(&format!("  - from: p{}\n    to: writer\n", processors - 1));
    for (from, to) in extra {
        edges.push_str(&format!("  - from: p{from}\n    to: p{to}\n"));
    }

    format!(
        r#"
version: "1.0"
pipeline: prop_graph
ordered: {ordered}
stages:
{stages}edges:
{edges}"#
    )
}

/// Forward edges between processors that are not already on the chain.
fn forward_extras(processors: usize, raw: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
    raw.into_iter()
        .map(|(a, b)| (a % processors, b % processors))
        .filter(|(a, b)| a + 1 < *b)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

proptest! {
    #[test]
    fn forward_graphs_build_in_topological_order(
        processors in 1_usize..6,
        raw in prop::collection::vec((0_usize..6, 0_usize..6), 0..8),
    ) {
        let extra = forward_extras(processors, raw);
        let yaml = pipeline_yaml(processors, &extra, false, 1);
        let registry = Harness::new().registry();

        let pipeline = PipelineBuilder::from_yaml_str(&yaml)
            .expect("generated yaml must parse")
            .registry(&registry)
            .build();
        prop_assert!(pipeline.is_ok(), "{:?}", pipeline.err());
        let pipeline = pipeline.unwrap();

        let order = pipeline.topological_order();
        prop_assert_eq!(order.len(), processors + 2);
        let position = |idx: usize| order.iter().position(|s| s.index() == idx).unwrap();
        for edge in pipeline.edges() {
            prop_assert!(position(edge.from.index()) < position(edge.to.index()));
        }
    }

    #[test]
    fn back_edges_are_reported_as_cycles(
        processors in 2_usize..6,
        from in 0_usize..6,
        to in 0_usize..6,
    ) {
        let from = from % processors;
        let to = to % processors;
        prop_assume!(to < from);
        let yaml = pipeline_yaml(processors, &[(from, to)], false, 1);
        let registry = Harness::new().registry();

        let err = PipelineBuilder::from_yaml_str(&yaml)
            .expect("generated yaml must parse")
            .registry(&registry)
            .build()
            .unwrap_err();

        let problems = err.as_configuration().expect("configuration error");
        prop_assert!(problems.mentions("cycle detected"));
        let cycle_node = format!("p{to}");
        prop_assert!(problems.mentions(&cycle_node));
    }

    #[test]
    fn ordered_pipelines_reject_parallel_workers(workers in 1_usize..5) {
        let yaml = pipeline_yaml(2, &[], true, workers);
        let registry = Harness::new().registry();

        let result = PipelineBuilder::from_yaml_str(&yaml)
            .expect("generated yaml must parse")
            .registry(&registry)
            .build();

        if workers == 1 {
            prop_assert!(result.is_ok());
        } else {
            let err = result.unwrap_err();
            prop_assert!(err
                .as_configuration()
                .is_some_and(|p| p.mentions("ordered pipelines require concurrency 1")));
        }
    }

    #[test]
    fn sinks_cannot_feed_other_stages(processors in 1_usize..4, target in 0_usize..4) {
        let target = target % processors;
        let mut yaml = pipeline_yaml(processors, &[], false, 1);
        yaml.push_str(&format!("  - from: writer\n    to: p{target}\n"));
        let registry = Harness::new().registry();

        let err = PipelineBuilder::from_yaml_str(&yaml)
            .expect("generated yaml must parse")
            .registry(&registry)
            .build()
            .unwrap_err();

        let problems = err.as_configuration().expect("configuration error");
        prop_assert!(problems.mentions("stage 'writer': sink must not have outbound edges"));
    }
}
