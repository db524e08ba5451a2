//! Validated pipeline graph.
//!
//! A [`Pipeline`] is an arena of [`StageNode`]s indexed by [`StageIdx`] with
//! edges stored as index pairs, so neither stages nor edges own each other.
//! It is validated once when assembled and is immutable afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use lubrikit_sdk::{StageDescriptor, StageFactory, StageInstance};
use lubrikit_types::{OverflowPolicy, StageRole};

use crate::config::types::{
    PipelineConfig, RetryConfig, StageConfig, StateConfig, DEFAULT_BUFFER_SIZE,
};
use crate::config::validator::pipeline_problems;
use crate::errors::{ConfigurationError, PipelineError};
use crate::registry::Registry;

/// Index of a stage in [`Pipeline::stages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageIdx(usize);

impl StageIdx {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Index of an edge in [`Pipeline::edges`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeIdx(usize);

impl EdgeIdx {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Runtime policy of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePolicy {
    pub concurrency: usize,
    pub batch_size: Option<usize>,
    pub batch_linger: Option<Duration>,
    pub timeout: Option<Duration>,
    pub retry: RetryConfig,
}

impl StagePolicy {
    fn from_config(stage: &StageConfig) -> Self {
        Self {
            concurrency: stage.concurrency,
            batch_size: stage.batch_size,
            batch_linger: stage.batch_linger_ms.map(Duration::from_millis),
            timeout: stage.timeout_ms.map(Duration::from_millis),
            retry: stage.retry.clone(),
        }
    }
}

/// One stage: identity, effective descriptor, policy, and constructor.
pub struct StageNode {
    name: String,
    stage_type: String,
    descriptor: StageDescriptor,
    policy: StagePolicy,
    config: serde_json::Value,
    factory: StageFactory,
    inbound: Vec<EdgeIdx>,
    outbound: Vec<EdgeIdx>,
}

impl StageNode {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stage_type(&self) -> &str {
        &self.stage_type
    }

    #[must_use]
    pub fn role(&self) -> StageRole {
        self.descriptor.role
    }

    /// Registration descriptor with per-stage overrides applied.
    #[must_use]
    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    #[must_use]
    pub fn inbound(&self) -> &[EdgeIdx] {
        &self.inbound
    }

    #[must_use]
    pub fn outbound(&self) -> &[EdgeIdx] {
        &self.outbound
    }

    /// Build a fresh instance for one worker.
    pub(crate) fn instantiate(&self) -> Result<StageInstance, PipelineError> {
        let instance = (self.factory)(&self.config).map_err(|e| {
            PipelineError::configuration(format!(
                "stage '{}': constructor for type '{}' failed: {e}",
                self.name, self.stage_type
            ))
        })?;
        if instance.role() != self.descriptor.role {
            return Err(PipelineError::configuration(format!(
                "stage '{}': type '{}' is registered as {} but constructed a {}",
                self.name,
                self.stage_type,
                self.descriptor.role,
                instance.role()
            )));
        }
        Ok(instance)
    }
}

impl std::fmt::Debug for StageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageNode")
            .field("name", &self.name)
            .field("stage_type", &self.stage_type)
            .field("role", &self.descriptor.role)
            .field("policy", &self.policy)
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

/// Directed, bounded connection between two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from: StageIdx,
    pub to: StageIdx,
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

/// Pipeline-wide execution settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub ordered: bool,
    pub dead_letter: bool,
    pub checkpoint_interval: u64,
    pub state: StateConfig,
}

/// Validated DAG of stages.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    settings: PipelineSettings,
    stages: Vec<StageNode>,
    edges: Vec<Edge>,
    topo_order: Vec<StageIdx>,
}

impl Pipeline {
    /// Validate `config`, resolve stage types against `registry` and
    /// validate the graph.
    ///
    /// Every problem found is collected; nothing is returned unless the whole
    /// pipeline is valid.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Configuration`] listing all problems.
    pub fn assemble(config: &PipelineConfig, registry: &Registry) -> Result<Self, PipelineError> {
        let mut problems = pipeline_problems(config);
        let mut stages: Vec<StageNode> = Vec::with_capacity(config.stages.len());
        let mut by_name: HashMap<&str, StageIdx> = HashMap::new();
        let mut declared: HashSet<&str> = HashSet::new();
        let mut stage_configs: Vec<&StageConfig> = Vec::new();

        for stage in &config.stages {
            if !declared.insert(stage.name.as_str()) {
                problems.push(format!("duplicate stage name '{}'", stage.name));
                continue;
            }
            let Some(registration) = registry.get(&stage.stage_type) else {
                problems.push(format!(
                    "stage '{}': unknown stage type '{}' (no registration found)",
                    stage.name, stage.stage_type
                ));
                continue;
            };

            let registered = registration.descriptor();
            if let Some(role) = stage.role {
                if role != registered.role {
                    problems.push(format!(
                        "stage '{}': declared role {role} but type '{}' is registered as {}",
                        stage.name, stage.stage_type, registered.role
                    ));
                    continue;
                }
            }

            let descriptor = StageDescriptor {
                role: registered.role,
                input_schema: stage
                    .input_schema
                    .clone()
                    .or_else(|| registered.input_schema.clone()),
                output_schema: stage
                    .output_schema
                    .clone()
                    .or_else(|| registered.output_schema.clone()),
                idempotent: stage.idempotent.unwrap_or(registered.idempotent),
            };

            by_name.insert(stage.name.as_str(), StageIdx(stages.len()));
            stage_configs.push(stage);
            stages.push(StageNode {
                name: stage.name.clone(),
                stage_type: stage.stage_type.clone(),
                descriptor,
                policy: StagePolicy::from_config(stage),
                config: stage.config.clone(),
                factory: registration.factory().clone(),
                inbound: Vec::new(),
                outbound: Vec::new(),
            });
        }

        let mut edges: Vec<Edge> = Vec::with_capacity(config.edges.len());
        let mut seen_edges: HashSet<(StageIdx, StageIdx)> = HashSet::new();
        for edge in &config.edges {
            let label = format!("edge '{}' -> '{}'", edge.from, edge.to);
            let from = by_name.get(edge.from.as_str()).copied();
            let to = by_name.get(edge.to.as_str()).copied();
            for (endpoint, resolved) in [(&edge.from, from), (&edge.to, to)] {
                // Declared-but-unresolved stages were already reported above.
                if resolved.is_none() && !declared.contains(endpoint.as_str()) {
                    problems.push(format!("{label}: unknown stage '{endpoint}'"));
                }
            }
            let (Some(from), Some(to)) = (from, to) else {
                continue;
            };
            if from == to {
                problems.push(format!("{label}: self-loop"));
                continue;
            }
            if !seen_edges.insert((from, to)) {
                problems.push(format!("{label}: duplicate edge"));
                continue;
            }

            let consumer = stage_configs[to.0];
            let idx = EdgeIdx(edges.len());
            edges.push(Edge {
                from,
                to,
                capacity: edge
                    .capacity
                    .or(consumer.buffer_size)
                    .unwrap_or(DEFAULT_BUFFER_SIZE),
                overflow: edge.overflow.unwrap_or(consumer.overflow),
            });
            stages[from.0].outbound.push(idx);
            stages[to.0].inbound.push(idx);
        }

        for node in &stages {
            check_roles(node, &mut problems);
            if config.ordered && node.policy.concurrency > 1 {
                problems.push(format!(
                    "stage '{}': ordered pipelines require concurrency 1 (got {})",
                    node.name, node.policy.concurrency
                ));
            }
            if node.role() == StageRole::Collector && node.policy.concurrency > 1 {
                problems.push(format!(
                    "stage '{}': collectors run a single worker (got concurrency {})",
                    node.name, node.policy.concurrency
                ));
            }
            if node.role() == StageRole::Collector && node.policy.batch_size.is_some() {
                problems.push(format!(
                    "stage '{}': batch_size applies only to processors and sinks",
                    node.name
                ));
            }
        }

        for edge in &edges {
            let upstream = &stages[edge.from.0];
            let downstream = &stages[edge.to.0];
            if let (Some(produced), Some(wanted)) = (
                &upstream.descriptor.output_schema,
                &downstream.descriptor.input_schema,
            ) {
                if let Err(mismatches) = produced.check_feeds(wanted) {
                    for mismatch in mismatches {
                        problems.push(format!(
                            "edge '{}' -> '{}': {mismatch}",
                            upstream.name, downstream.name
                        ));
                    }
                }
            }
        }

        let topo_order = match topological_order(&stages, &edges) {
            Ok(order) => order,
            Err(cycle) => {
                problems.push(format!(
                    "cycle detected among stages: {}",
                    cycle.join(", ")
                ));
                Vec::new()
            }
        };

        if !problems.is_empty() {
            return Err(ConfigurationError::new(problems).into());
        }

        Ok(Self {
            name: config.pipeline.clone(),
            settings: PipelineSettings {
                ordered: config.ordered,
                dead_letter: config.dead_letter.enabled,
                checkpoint_interval: config.checkpoint_interval,
                state: config.state.clone(),
            },
            stages,
            edges,
            topo_order,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    #[must_use]
    pub fn stages(&self) -> &[StageNode] {
        &self.stages
    }

    #[must_use]
    pub fn stage(&self, idx: StageIdx) -> &StageNode {
        &self.stages[idx.0]
    }

    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[must_use]
    pub fn edge(&self, idx: EdgeIdx) -> &Edge {
        &self.edges[idx.0]
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<StageIdx> {
        self.stages
            .iter()
            .position(|s| s.name == name)
            .map(StageIdx)
    }

    /// Stages in an order where every edge points forward.
    #[must_use]
    pub fn topological_order(&self) -> &[StageIdx] {
        &self.topo_order
    }

    pub fn stage_indices(&self) -> impl Iterator<Item = StageIdx> + '_ {
        (0..self.stages.len()).map(StageIdx)
    }

    pub fn collectors(&self) -> impl Iterator<Item = (StageIdx, &StageNode)> + '_ {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.role() == StageRole::Collector)
            .map(|(i, s)| (StageIdx(i), s))
    }
}

fn check_roles(node: &StageNode, problems: &mut Vec<String>) {
    let role = node.role();
    match role {
        StageRole::Collector if !node.inbound.is_empty() => problems.push(format!(
            "stage '{}': collector must not have inbound edges",
            node.name
        )),
        StageRole::Sink if !node.outbound.is_empty() => problems.push(format!(
            "stage '{}': sink must not have outbound edges",
            node.name
        )),
        _ => {}
    }
    if role != StageRole::Collector && node.inbound.is_empty() {
        problems.push(format!(
            "stage '{}': {role} has no upstream edge",
            node.name
        ));
    }
    if role != StageRole::Sink && node.outbound.is_empty() {
        problems.push(format!(
            "stage '{}': {role} has no downstream edge",
            node.name
        ));
    }
}

/// Kahn's algorithm. On a cycle, returns the names of the stages that could
/// not be ordered (every cycle member plus anything downstream of one).
fn topological_order(stages: &[StageNode], edges: &[Edge]) -> Result<Vec<StageIdx>, Vec<String>> {
    let mut in_degree: Vec<usize> = stages.iter().map(|s| s.inbound.len()).collect();
    let mut ready: VecDeque<StageIdx> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| StageIdx(i))
        .collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(idx) = ready.pop_front() {
        order.push(idx);
        for edge_idx in &stages[idx.0].outbound {
            let to = edges[edge_idx.0].to;
            in_degree[to.0] -= 1;
            if in_degree[to.0] == 0 {
                ready.push_back(to);
            }
        }
    }

    if order.len() == stages.len() {
        return Ok(order);
    }
    let mut leftover: Vec<String> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d > 0)
        .map(|(i, _)| stages[i].name.clone())
        .collect();
    leftover.sort();
    Err(leftover)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::EdgeConfig;
    use crate::test_support::test_registry;
    use lubrikit_types::{FieldSpec, FieldType, Schema};

    fn config(stages: Vec<StageConfig>, edges: Vec<(&str, &str)>) -> PipelineConfig {
        let mut config = PipelineConfig::new("test");
        config.stages = stages;
        config.edges = edges
            .into_iter()
            .map(|(from, to)| EdgeConfig::new(from, to))
            .collect();
        config
    }

    fn linear() -> PipelineConfig {
        config(
            vec![
                StageConfig::new("reader", "numbers"),
                StageConfig::new("double", "double"),
                StageConfig::new("writer", "collect").with_buffer(2, OverflowPolicy::Block),
            ],
            vec![("reader", "double"), ("double", "writer")],
        )
    }

    fn problems(config: &PipelineConfig) -> ConfigurationError {
        Pipeline::assemble(config, &test_registry())
            .unwrap_err()
            .as_configuration()
            .cloned()
            .expect("configuration error")
    }

    #[test]
    fn linear_pipeline_assembles() {
        let pipeline = Pipeline::assemble(&linear(), &test_registry()).unwrap();
        assert_eq!(pipeline.stages().len(), 3);
        assert_eq!(pipeline.edges().len(), 2);

        let names: Vec<&str> = pipeline
            .topological_order()
            .iter()
            .map(|i| pipeline.stage(*i).name())
            .collect();
        assert_eq!(names, vec!["reader", "double", "writer"]);

        let writer = pipeline.find("writer").unwrap();
        let inbound = pipeline.edge(pipeline.stage(writer).inbound()[0]);
        assert_eq!(inbound.capacity, 2);
        assert_eq!(pipeline.collectors().count(), 1);
    }

    #[test]
    fn edge_capacity_defaults_to_64() {
        let mut cfg = linear();
        cfg.stages[2].buffer_size = None;
        let pipeline = Pipeline::assemble(&cfg, &test_registry()).unwrap();
        assert!(pipeline.edges().iter().all(|e| e.capacity == DEFAULT_BUFFER_SIZE));
    }

    #[test]
    fn edge_settings_override_consumer() {
        let mut cfg = linear();
        cfg.edges[1] = EdgeConfig::new("double", "writer")
            .with_capacity(7)
            .with_overflow(OverflowPolicy::DropOldest);
        let pipeline = Pipeline::assemble(&cfg, &test_registry()).unwrap();
        assert_eq!(pipeline.edges()[1].capacity, 7);
        assert_eq!(pipeline.edges()[1].overflow, OverflowPolicy::DropOldest);
    }

    #[test]
    fn unknown_type_names_missing_registration() {
        let mut cfg = linear();
        cfg.stages[1].stage_type = "triple".into();
        let err = problems(&cfg);
        assert!(err.mentions("unknown stage type 'triple'"));
    }

    #[test]
    fn cycle_is_rejected() {
        let cfg = config(
            vec![
                StageConfig::new("reader", "numbers"),
                StageConfig::new("a", "double"),
                StageConfig::new("b", "double"),
                StageConfig::new("writer", "collect"),
            ],
            vec![("reader", "a"), ("a", "b"), ("b", "a"), ("b", "writer")],
        );
        let err = problems(&cfg);
        assert!(err.mentions("cycle detected among stages: a, b, writer"));
    }

    #[test]
    fn role_mismatched_edges_are_rejected() {
        let cfg = config(
            vec![
                StageConfig::new("reader", "numbers"),
                StageConfig::new("writer", "collect"),
                StageConfig::new("other", "numbers"),
            ],
            vec![("reader", "writer"), ("writer", "other")],
        );
        let err = problems(&cfg);
        assert!(err.mentions("'writer': sink must not have outbound edges"));
        assert!(err.mentions("'other': collector must not have inbound edges"));
    }

    #[test]
    fn dangling_stages_are_rejected() {
        let cfg = config(
            vec![
                StageConfig::new("reader", "numbers"),
                StageConfig::new("double", "double"),
            ],
            vec![],
        );
        let err = problems(&cfg);
        assert!(err.mentions("'reader': collector has no downstream edge"));
        assert!(err.mentions("'double': processor has no upstream edge"));
        assert!(err.mentions("'double': processor has no downstream edge"));
    }

    #[test]
    fn declared_role_must_match_registration() {
        let mut cfg = linear();
        cfg.stages[2].role = Some(StageRole::Processor);
        let err = problems(&cfg);
        assert!(err.mentions("declared role processor but type 'collect' is registered as sink"));
    }

    #[test]
    fn unknown_edge_endpoint_and_self_loop() {
        let mut cfg = linear();
        cfg.edges.push(EdgeConfig::new("double", "ghost"));
        cfg.edges.push(EdgeConfig::new("double", "double"));
        cfg.edges.push(EdgeConfig::new("reader", "double"));
        let err = problems(&cfg);
        assert!(err.mentions("unknown stage 'ghost'"));
        assert!(err.mentions("self-loop"));
        assert!(err.mentions("duplicate edge"));
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let mut cfg = linear();
        cfg.stages.push(StageConfig::new("double", "double"));
        assert!(problems(&cfg).mentions("duplicate stage name 'double'"));
    }

    #[test]
    fn ordered_pipeline_rejects_parallel_stage() {
        let mut cfg = linear();
        cfg.ordered = true;
        cfg.stages[1].concurrency = 4;
        assert!(problems(&cfg).mentions("ordered pipelines require concurrency 1 (got 4)"));
    }

    #[test]
    fn assembling_directly_still_validates_values() {
        let mut cfg = linear();
        cfg.stages[2].concurrency = 0;
        cfg.checkpoint_interval = 0;
        let err = problems(&cfg);
        assert!(err.mentions("stage 'writer': concurrency must be at least 1"));
        assert!(err.mentions("checkpoint_interval must be at least 1"));
    }

    #[test]
    fn collector_runs_a_single_worker() {
        let mut cfg = linear();
        cfg.stages[0].concurrency = 2;
        assert!(problems(&cfg).mentions("stage 'reader': collectors run a single worker (got concurrency 2)"));

        cfg.stages[0].concurrency = 1;
        cfg.stages[1].concurrency = 3;
        assert!(Pipeline::assemble(&cfg, &test_registry()).is_ok());
    }

    #[test]
    fn incompatible_schemas_are_rejected() {
        let mut cfg = linear();
        cfg.stages[1].output_schema =
            Some(Schema::new().field("n", FieldSpec::required(FieldType::String)));
        cfg.stages[2].input_schema = Some(
            Schema::new()
                .field("n", FieldSpec::required(FieldType::Int))
                .field("label", FieldSpec::required(FieldType::String)),
        );
        let err = problems(&cfg);
        assert!(err.mentions("edge 'double' -> 'writer': field 'n' is string upstream but int is expected"));
        assert!(err.mentions("field 'label' is not produced upstream"));
    }

    #[test]
    fn compatible_schemas_pass() {
        let mut cfg = linear();
        cfg.stages[1].output_schema = Some(
            Schema::new()
                .field("n", FieldSpec::required(FieldType::Int))
                .field("extra", FieldSpec::nullable(FieldType::Bool)),
        );
        cfg.stages[2].input_schema =
            Some(Schema::new().field("n", FieldSpec::required(FieldType::Any)));
        assert!(Pipeline::assemble(&cfg, &test_registry()).is_ok());
    }

    #[test]
    fn overrides_apply_to_descriptor() {
        let mut cfg = linear();
        cfg.stages[2].idempotent = Some(false);
        let pipeline = Pipeline::assemble(&cfg, &test_registry()).unwrap();
        let writer = pipeline.stage(pipeline.find("writer").unwrap());
        assert!(!writer.descriptor().idempotent);
        assert!(writer.instantiate().is_ok());
    }

    #[test]
    fn all_problems_reported_together() {
        let mut cfg = linear();
        cfg.stages[1].stage_type = "triple".into();
        cfg.edges.push(EdgeConfig::new("writer", "reader"));
        let err = problems(&cfg);
        assert!(err.problems.len() >= 3, "got: {:?}", err.problems);
    }
}
