//! Task graph with expansion over iteration sources and keyed joins
//!
//! Graphs are declared through [`GraphBuilder`] and instantiated once by
//! [`GraphBuilder::build`]: every replica of every node exists before anything
//! runs, and the resulting [`TaskGraph`] is never mutated.
//!
//! Edges between scopes resolve as follows:
//! - same scope: the replica with the same key
//! - global node: its single instance, visible to every replica
//! - ancestor expansion: the ancestor replica whose key prefixes the consumer's
//! - descendant to ancestor (or to global): only through a join

use async_trait::async_trait;
use scanflow_common::{IterationKey, Keyed, Result, ScanflowError};
use scanflow_core::{IdentityResolver, ResourceCost};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Output values of one node instance, by slot name
pub type NodeOutputs = BTreeMap<String, Value>;

/// Output slot every join exposes
pub const JOIN_OUTPUT: &str = "items";

/// Serialize a node value
pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| ScanflowError::TaskFailed(format!("cannot serialize node value: {e}")))
}

/// Inputs delivered to one node instance
#[derive(Debug, Clone)]
pub struct NodeInputs {
    key: Option<IterationKey>,
    values: BTreeMap<String, Value>,
}

impl NodeInputs {
    pub fn new(key: Option<IterationKey>, values: BTreeMap<String, Value>) -> Self {
        Self { key, values }
    }

    /// Replica key, `None` for global nodes
    #[must_use]
    pub fn key(&self) -> Option<&IterationKey> {
        self.key.as_ref()
    }

    pub fn require_key(&self) -> Result<&IterationKey> {
        self.key
            .as_ref()
            .ok_or_else(|| ScanflowError::TaskFailed("node needs a replica key".to_string()))
    }

    pub fn raw(&self, slot: &str) -> Option<&Value> {
        self.values.get(slot)
    }

    /// Deserialize the value delivered on `slot`
    pub fn get<T: DeserializeOwned>(&self, slot: &str) -> Result<T> {
        let value = self
            .values
            .get(slot)
            .ok_or_else(|| ScanflowError::TaskFailed(format!("missing input '{slot}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| ScanflowError::TaskFailed(format!("invalid input '{slot}': {e}")))
    }

    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

/// One computation in the graph
#[async_trait]
pub trait Task: Send + Sync {
    /// Required input slots
    fn inputs(&self) -> Vec<&str>;

    /// Output slots the task fills
    fn outputs(&self) -> Vec<&str>;

    /// Parameters that change the result (part of the cache fingerprint)
    fn params(&self) -> Value {
        Value::Null
    }

    /// Whether results may be reused for identical inputs
    fn cacheable(&self) -> bool {
        true
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs>;
}

type BoxedRun = Box<
    dyn Fn(NodeInputs) -> std::pin::Pin<Box<dyn Future<Output = Result<NodeOutputs>> + Send>>
        + Send
        + Sync,
>;

/// A [`Task`] backed by a closure
pub struct FnTask {
    inputs: Vec<String>,
    outputs: Vec<String>,
    params: Value,
    cacheable: bool,
    run: BoxedRun,
}

impl FnTask {
    pub fn new<F, Fut>(inputs: &[&str], outputs: &[&str], run: F) -> Self
    where
        F: Fn(NodeInputs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeOutputs>> + Send + 'static,
    {
        Self {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            params: Value::Null,
            cacheable: true,
            run: Box::new(move |inputs| Box::pin(run(inputs))),
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

#[async_trait]
impl Task for FnTask {
    fn inputs(&self) -> Vec<&str> {
        self.inputs.iter().map(String::as_str).collect()
    }

    fn outputs(&self) -> Vec<&str> {
        self.outputs.iter().map(String::as_str).collect()
    }

    fn params(&self) -> Value {
        self.params.clone()
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    async fn run(&self, inputs: NodeInputs) -> Result<NodeOutputs> {
        (self.run)(inputs).await
    }
}

/// Where a node lives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// One instance for the whole run
    Global,
    /// One instance per replica of the named expansion
    Expansion(String),
}

impl Scope {
    pub fn expansion(name: impl Into<String>) -> Self {
        Self::Expansion(name.into())
    }
}

struct SourceDef {
    name: String,
    items: Vec<Keyed<Value>>,
}

struct ExpansionDef {
    name: String,
    sources: Vec<String>,
    synchronized: bool,
    parent: Option<String>,
}

enum NodeDefKind {
    Task(Arc<dyn Task>),
    Join { from: String, output: String },
}

struct NodeDef {
    name: String,
    scope: Scope,
    kind: NodeDefKind,
    cost: ResourceCost,
}

struct EdgeDef {
    from: String,
    output: String,
    to: String,
    input: String,
}

/// Declarative graph construction
#[derive(Default)]
pub struct GraphBuilder {
    sources: Vec<SourceDef>,
    expansions: Vec<ExpansionDef>,
    nodes: Vec<NodeDef>,
    edges: Vec<EdgeDef>,
    outputs: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an iteration source. Each item is injected into its replica
    /// as an input slot named after the source.
    pub fn source<T: Serialize>(&mut self, name: &str, items: &[Keyed<T>]) -> Result<&mut Self> {
        let items = items
            .iter()
            .map(|item| {
                serde_json::to_value(&item.value)
                    .map(|value| Keyed::new(item.key.clone(), value))
                    .map_err(|e| {
                        ScanflowError::Configuration(format!("source '{name}' item {}: {e}", item.key))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        self.sources.push(SourceDef {
            name: name.to_string(),
            items,
        });
        Ok(self)
    }

    /// Top-level expansion over one source, or over several sources walked
    /// in lockstep when `synchronized`
    pub fn expansion(&mut self, name: &str, sources: &[&str], synchronized: bool) -> &mut Self {
        self.expansions.push(ExpansionDef {
            name: name.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            synchronized,
            parent: None,
        });
        self
    }

    /// Expansion that fans out inside each replica of `parent`; every key of
    /// `source` must be prefixed by a parent replica key
    pub fn nested_expansion(&mut self, name: &str, parent: &str, source: &str) -> &mut Self {
        self.expansions.push(ExpansionDef {
            name: name.to_string(),
            sources: vec![source.to_string()],
            synchronized: false,
            parent: Some(parent.to_string()),
        });
        self
    }

    pub fn node(
        &mut self,
        name: &str,
        scope: Scope,
        task: Arc<dyn Task>,
        cost: ResourceCost,
    ) -> &mut Self {
        self.nodes.push(NodeDef {
            name: name.to_string(),
            scope,
            kind: NodeDefKind::Task(task),
            cost,
        });
        self
    }

    /// Route `from.output` into `to.input`
    pub fn connect(&mut self, from: &str, output: &str, to: &str, input: &str) -> &mut Self {
        self.edges.push(EdgeDef {
            from: from.to_string(),
            output: output.to_string(),
            to: to.to_string(),
            input: input.to_string(),
        });
        self
    }

    /// Collect `from.output` from every replica of `from`'s expansion into a
    /// keyed collection, one per replica of `scope` (or one for
    /// [`Scope::Global`]). The collection is exposed on [`JOIN_OUTPUT`].
    pub fn join(&mut self, name: &str, from: &str, output: &str, scope: Scope) -> &mut Self {
        self.nodes.push(NodeDef {
            name: name.to_string(),
            scope,
            kind: NodeDefKind::Join {
                from: from.to_string(),
                output: output.to_string(),
            },
            cost: ResourceCost::default(),
        });
        self
    }

    /// Mark a node whose instances are the run's top-level outputs
    pub fn output(&mut self, node: &str) -> &mut Self {
        self.outputs.push(node.to_string());
        self
    }

    /// Validate the declaration and instantiate every replica
    pub fn build(self) -> Result<TaskGraph> {
        Instantiator::new(self)?.run()
    }
}

/// How an instance receives one input slot
#[derive(Debug, Clone)]
pub(crate) enum Binding {
    Edge {
        input: String,
        upstream: usize,
        output: String,
    },
    Source {
        input: String,
        value: Value,
    },
    Gather {
        upstream: Vec<usize>,
        output: String,
    },
}

#[derive(Clone)]
pub(crate) enum NodeKind {
    Task(Arc<dyn Task>),
    Join,
}

pub(crate) struct NodeSpec {
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) cost: ResourceCost,
    pub(crate) is_output: bool,
}

pub(crate) struct Instance {
    pub(crate) node: usize,
    pub(crate) key: Option<IterationKey>,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) upstream: Vec<usize>,
}

/// An instantiated, immutable task graph
pub struct TaskGraph {
    pub(crate) nodes: Vec<NodeSpec>,
    pub(crate) instances: Vec<Instance>,
    pub(crate) dependents: Vec<Vec<usize>>,
}

impl TaskGraph {
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Replica keys of a node, in execution order
    #[must_use]
    pub fn replicas_of(&self, node: &str) -> Vec<Option<IterationKey>> {
        self.instances
            .iter()
            .filter(|i| self.nodes[i.node].name == node)
            .map(|i| i.key.clone())
            .collect()
    }

    /// Node names in execution order
    #[must_use]
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub(crate) fn label(&self, instance: usize) -> String {
        let inst = &self.instances[instance];
        match &inst.key {
            Some(key) => format!("{}[{}]", self.nodes[inst.node].name, key),
            None => self.nodes[inst.node].name.clone(),
        }
    }
}

struct ExpansionInfo {
    parent: Option<usize>,
    sources: Vec<String>,
    replicas: Vec<IterationKey>,
    items: HashMap<IterationKey, BTreeMap<String, Value>>,
}

struct Instantiator {
    def: GraphBuilder,
    expansions: Vec<ExpansionInfo>,
    expansion_index: HashMap<String, usize>,
    node_index: HashMap<String, usize>,
}

fn config_err(msg: String) -> ScanflowError {
    ScanflowError::Configuration(msg)
}

impl Instantiator {
    fn new(def: GraphBuilder) -> Result<Self> {
        let mut this = Self {
            def,
            expansions: Vec::new(),
            expansion_index: HashMap::new(),
            node_index: HashMap::new(),
        };
        this.index_nodes()?;
        this.expand()?;
        Ok(this)
    }

    fn index_nodes(&mut self) -> Result<()> {
        for (i, node) in self.def.nodes.iter().enumerate() {
            if self.node_index.insert(node.name.clone(), i).is_some() {
                return Err(config_err(format!("duplicate node '{}'", node.name)));
            }
        }
        let mut seen = HashSet::new();
        for source in &self.def.sources {
            if !seen.insert(source.name.as_str()) {
                return Err(config_err(format!("duplicate source '{}'", source.name)));
            }
            IdentityResolver::ensure_unique(&source.items)?;
        }
        Ok(())
    }

    fn source_items(&self, name: &str) -> Result<&[Keyed<Value>]> {
        self.def
            .sources
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.items.as_slice())
            .ok_or_else(|| config_err(format!("unknown source '{name}'")))
    }

    /// Resolve every expansion's replica keys and injected items
    fn expand(&mut self) -> Result<()> {
        for def in &self.def.expansions {
            if self.expansion_index.contains_key(&def.name) {
                return Err(config_err(format!("duplicate expansion '{}'", def.name)));
            }
            if def.sources.is_empty() {
                return Err(config_err(format!("expansion '{}' has no source", def.name)));
            }
            if def.sources.len() > 1 && !def.synchronized {
                return Err(config_err(format!(
                    "expansion '{}' iterates {} unsynchronized sources",
                    def.name,
                    def.sources.len()
                )));
            }

            let lead = self.source_items(&def.sources[0])?;
            let lead_keys: Vec<&IterationKey> = lead.iter().map(|i| &i.key).collect();
            let mut items: HashMap<IterationKey, BTreeMap<String, Value>> = HashMap::new();
            for source in &def.sources {
                let source_items = self.source_items(source)?;
                let keys: Vec<&IterationKey> = source_items.iter().map(|i| &i.key).collect();
                if keys != lead_keys {
                    return Err(ScanflowError::JoinMismatch(format!(
                        "expansion '{}': source '{}' has {} keys but '{}' has {} (or a different order)",
                        def.name,
                        source,
                        keys.len(),
                        def.sources[0],
                        lead_keys.len()
                    )));
                }
                for item in source_items {
                    items
                        .entry(item.key.clone())
                        .or_default()
                        .insert(source.clone(), item.value.clone());
                }
            }

            let parent = match &def.parent {
                Some(parent) => {
                    let idx = *self.expansion_index.get(parent).ok_or_else(|| {
                        config_err(format!(
                            "expansion '{}' nests under unknown expansion '{parent}'",
                            def.name
                        ))
                    })?;
                    for key in &lead_keys {
                        if find_prefix(&self.expansions[idx].replicas, key).is_none() {
                            return Err(ScanflowError::JoinMismatch(format!(
                                "expansion '{}': key {} has no parent replica in '{}'",
                                def.name, key, parent
                            )));
                        }
                    }
                    Some(idx)
                }
                None => None,
            };

            let mut replicas: Vec<IterationKey> = lead_keys.into_iter().cloned().collect();
            replicas.sort();
            debug!("Expansion '{}' has {} replicas", def.name, replicas.len());

            self.expansion_index
                .insert(def.name.clone(), self.expansions.len());
            self.expansions.push(ExpansionInfo {
                parent,
                sources: def.sources.clone(),
                replicas,
                items,
            });
        }
        Ok(())
    }

    fn scope_of(&self, scope: &Scope) -> Result<Option<usize>> {
        match scope {
            Scope::Global => Ok(None),
            Scope::Expansion(name) => self
                .expansion_index
                .get(name)
                .copied()
                .map(Some)
                .ok_or_else(|| config_err(format!("unknown expansion '{name}'"))),
        }
    }

    /// True when `ancestor` strictly encloses `expansion`
    fn encloses(&self, ancestor: usize, expansion: usize) -> bool {
        let mut current = self.expansions[expansion].parent;
        while let Some(e) = current {
            if e == ancestor {
                return true;
            }
            current = self.expansions[e].parent;
        }
        false
    }

    fn node_outputs(&self, node: &NodeDef) -> Vec<String> {
        match &node.kind {
            NodeDefKind::Task(task) => task.outputs().into_iter().map(str::to_string).collect(),
            NodeDefKind::Join { .. } => vec![JOIN_OUTPUT.to_string()],
        }
    }

    fn run(self) -> Result<TaskGraph> {
        let node_count = self.def.nodes.len();
        let mut scopes = Vec::with_capacity(node_count);
        for node in &self.def.nodes {
            scopes.push(self.scope_of(&node.scope)?);
        }

        // Node-level dependencies, validating edges and joins on the way
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); node_count];
        let mut bound: Vec<HashSet<String>> = vec![HashSet::new(); node_count];
        for edge in &self.def.edges {
            let from = self.lookup(&edge.from)?;
            let to = self.lookup(&edge.to)?;
            if !self.node_outputs(&self.def.nodes[from]).contains(&edge.output) {
                return Err(config_err(format!(
                    "node '{}' has no output '{}'",
                    edge.from, edge.output
                )));
            }
            match &self.def.nodes[to].kind {
                NodeDefKind::Task(task) => {
                    if !task.inputs().contains(&edge.input.as_str()) {
                        return Err(config_err(format!(
                            "node '{}' has no input '{}'",
                            edge.to, edge.input
                        )));
                    }
                }
                NodeDefKind::Join { .. } => {
                    return Err(config_err(format!(
                        "join '{}' takes no edges; it gathers from its source node",
                        edge.to
                    )));
                }
            }
            if !bound[to].insert(edge.input.clone()) {
                return Err(config_err(format!(
                    "input '{}' of node '{}' is connected twice",
                    edge.input, edge.to
                )));
            }
            self.check_edge_scopes(&edge.from, scopes[from], &edge.to, scopes[to])?;
            deps[to].push(from);
        }

        for (i, node) in self.def.nodes.iter().enumerate() {
            match &node.kind {
                NodeDefKind::Join { from, output } => {
                    let source = self.lookup(from)?;
                    if !self.node_outputs(&self.def.nodes[source]).contains(output) {
                        return Err(config_err(format!(
                            "join '{}': node '{from}' has no output '{output}'",
                            node.name
                        )));
                    }
                    let Some(inner) = scopes[source] else {
                        return Err(config_err(format!(
                            "join '{}' gathers from global node '{from}'",
                            node.name
                        )));
                    };
                    if let Some(outer) = scopes[i] {
                        if !self.encloses(outer, inner) {
                            return Err(config_err(format!(
                                "join '{}' must be scoped above the expansion of '{from}'",
                                node.name
                            )));
                        }
                    }
                    deps[i].push(source);
                }
                NodeDefKind::Task(task) => {
                    for input in task.inputs() {
                        if bound[i].contains(input) {
                            continue;
                        }
                        if self.source_for(scopes[i], input).is_none() {
                            return Err(config_err(format!(
                                "input '{input}' of node '{}' is not connected",
                                node.name
                            )));
                        }
                    }
                }
            }
        }

        for name in &self.def.outputs {
            self.lookup(name)?;
        }

        let order = self.topological_order(&deps)?;
        self.instantiate(&order, &scopes)
    }

    fn lookup(&self, name: &str) -> Result<usize> {
        self.node_index
            .get(name)
            .copied()
            .ok_or_else(|| config_err(format!("unknown node '{name}'")))
    }

    fn check_edge_scopes(
        &self,
        from_name: &str,
        from: Option<usize>,
        to_name: &str,
        to: Option<usize>,
    ) -> Result<()> {
        let allowed = match (from, to) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a == b || self.encloses(a, b),
        };
        if allowed {
            Ok(())
        } else {
            Err(config_err(format!(
                "edge '{from_name}' -> '{to_name}' leaves its expansion; use a join"
            )))
        }
    }

    /// Expansion (the node's own or an ancestor) providing a source slot
    fn source_for(&self, scope: Option<usize>, slot: &str) -> Option<usize> {
        let mut current = scope;
        while let Some(e) = current {
            if self.expansions[e].sources.iter().any(|s| s == slot) {
                return Some(e);
            }
            current = self.expansions[e].parent;
        }
        None
    }

    /// Deterministic topological order (declaration order among ready nodes)
    fn topological_order(&self, deps: &[Vec<usize>]) -> Result<Vec<usize>> {
        let n = deps.len();
        let mut visited = HashSet::with_capacity(n);
        let mut stack = HashSet::with_capacity(n);
        for node in 0..n {
            if has_cycle(node, deps, &mut visited, &mut stack) {
                return Err(config_err(format!(
                    "task graph contains a cycle through '{}'",
                    self.def.nodes[node].name
                )));
            }
        }

        let mut remaining: Vec<usize> = deps
            .iter()
            .map(|d| d.iter().collect::<HashSet<_>>().len())
            .collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (node, ds) in deps.iter().enumerate() {
            let unique: HashSet<usize> = ds.iter().copied().collect();
            for d in unique {
                dependents[d].push(node);
            }
        }
        let mut ready: std::collections::BTreeSet<usize> =
            (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &d in &dependents[node] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    ready.insert(d);
                }
            }
        }
        Ok(order)
    }

    fn instantiate(self, order: &[usize], scopes: &[Option<usize>]) -> Result<TaskGraph> {
        let mut instances: Vec<Instance> = Vec::new();
        let mut by_node: Vec<HashMap<Option<IterationKey>, usize>> =
            vec![HashMap::new(); self.def.nodes.len()];

        for &node in order {
            let def = &self.def.nodes[node];
            let keys: Vec<Option<IterationKey>> = match scopes[node] {
                None => vec![None],
                Some(e) => self.expansions[e].replicas.iter().cloned().map(Some).collect(),
            };

            for key in keys {
                let mut bindings = Vec::new();
                match &def.kind {
                    NodeDefKind::Join { from, output } => {
                        let source = self.lookup(from)?;
                        let mut upstream: Vec<(IterationKey, usize)> = by_node[source]
                            .iter()
                            .filter_map(|(k, idx)| {
                                let k = k.as_ref()?;
                                let in_scope = key.as_ref().map_or(true, |outer| outer.is_prefix_of(k));
                                in_scope.then(|| (k.clone(), *idx))
                            })
                            .collect();
                        upstream.sort();
                        bindings.push(Binding::Gather {
                            upstream: upstream.into_iter().map(|(_, idx)| idx).collect(),
                            output: output.clone(),
                        });
                    }
                    NodeDefKind::Task(task) => {
                        for edge in self.def.edges.iter().filter(|e| e.to == def.name) {
                            let from = self.lookup(&edge.from)?;
                            let upstream = resolve_upstream(&by_node[from], key.as_ref())
                                .ok_or_else(|| {
                                    config_err(format!(
                                        "no instance of '{}' feeds '{}'{}",
                                        edge.from,
                                        def.name,
                                        key.as_ref().map(|k| format!(" [{k}]")).unwrap_or_default()
                                    ))
                                })?;
                            bindings.push(Binding::Edge {
                                input: edge.input.clone(),
                                upstream,
                                output: edge.output.clone(),
                            });
                        }
                        let connected: HashSet<&str> = self
                            .def
                            .edges
                            .iter()
                            .filter(|e| e.to == def.name)
                            .map(|e| e.input.as_str())
                            .collect();
                        for input in task.inputs() {
                            if connected.contains(input) {
                                continue;
                            }
                            let value = self.source_value(scopes[node], key.as_ref(), input)?;
                            bindings.push(Binding::Source {
                                input: input.to_string(),
                                value,
                            });
                        }
                    }
                }

                let mut upstream: Vec<usize> = bindings
                    .iter()
                    .flat_map(|b| match b {
                        Binding::Edge { upstream, .. } => vec![*upstream],
                        Binding::Gather { upstream, .. } => upstream.clone(),
                        Binding::Source { .. } => Vec::new(),
                    })
                    .collect();
                upstream.sort_unstable();
                upstream.dedup();

                by_node[node].insert(key.clone(), instances.len());
                instances.push(Instance {
                    node,
                    key,
                    bindings,
                    upstream,
                });
            }
        }

        let mut dependents = vec![Vec::new(); instances.len()];
        for (idx, instance) in instances.iter().enumerate() {
            for &up in &instance.upstream {
                dependents[up].push(idx);
            }
        }

        let outputs: HashSet<&str> = self.def.outputs.iter().map(String::as_str).collect();
        let nodes = self
            .def
            .nodes
            .iter()
            .map(|def| NodeSpec {
                name: def.name.clone(),
                kind: match &def.kind {
                    NodeDefKind::Task(task) => NodeKind::Task(task.clone()),
                    NodeDefKind::Join { .. } => NodeKind::Join,
                },
                cost: def.cost,
                is_output: outputs.contains(def.name.as_str()),
            })
            .collect();

        debug!("Instantiated {} node instances", instances.len());
        Ok(TaskGraph {
            nodes,
            instances,
            dependents,
        })
    }

    fn source_value(
        &self,
        scope: Option<usize>,
        key: Option<&IterationKey>,
        slot: &str,
    ) -> Result<Value> {
        let expansion = self
            .source_for(scope, slot)
            .ok_or_else(|| config_err(format!("input '{slot}' is not connected")))?;
        let key = key.ok_or_else(|| config_err(format!("global node reads source '{slot}'")))?;
        let info = &self.expansions[expansion];
        let replica = find_prefix(&info.replicas, key)
            .ok_or_else(|| ScanflowError::JoinMismatch(format!("no '{slot}' item for {key}")))?;
        info.items
            .get(replica)
            .and_then(|values| values.get(slot))
            .cloned()
            .ok_or_else(|| ScanflowError::JoinMismatch(format!("no '{slot}' item for {key}")))
    }
}

/// The replica key among `replicas` that equals or encloses `key`
fn find_prefix<'a>(replicas: &'a [IterationKey], key: &IterationKey) -> Option<&'a IterationKey> {
    let mut current = Some(key.clone());
    while let Some(candidate) = current {
        if let Ok(pos) = replicas.binary_search(&candidate) {
            return Some(&replicas[pos]);
        }
        current = candidate.parent();
    }
    None
}

/// Upstream instance for a consumer keyed `key`: global, same key, or the
/// nearest enclosing replica
fn resolve_upstream(
    instances: &HashMap<Option<IterationKey>, usize>,
    key: Option<&IterationKey>,
) -> Option<usize> {
    if let Some(&idx) = instances.get(&None) {
        return Some(idx);
    }
    let mut current = key.cloned();
    while let Some(candidate) = current {
        if let Some(&idx) = instances.get(&Some(candidate.clone())) {
            return Some(idx);
        }
        current = candidate.parent();
    }
    None
}

fn has_cycle(
    node: usize,
    deps: &[Vec<usize>],
    visited: &mut HashSet<usize>,
    stack: &mut HashSet<usize>,
) -> bool {
    if stack.contains(&node) {
        return true;
    }
    if !visited.insert(node) {
        return false;
    }
    stack.insert(node);
    for &dep in &deps[node] {
        if has_cycle(dep, deps, visited, stack) {
            return true;
        }
    }
    stack.remove(&node);
    false
}
