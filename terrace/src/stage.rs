//! Stage façade and DAG registry.
//!
//! A stage owns its name, its producer, the comparators, and the adapters it
//! persists through. `update` is the pure single-stage transition: open the
//! prior version, run the production into scratch streams, upload the result
//! under the next version. Stages assemble into a DAG through [`StageGraph`],
//! which owns every node and tracks relations as index lookups.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;

use crate::codec::{read_rows, RowWriter};
use crate::config::ProductionConfig;
use crate::cursor::Cursor;
use crate::engine::execute::{
    execute_content_instructions, execute_mapping_instructions, DeltaSink,
};
use crate::engine::generate::generate_instructions;
use crate::engine::sources::{merge_sources, UpdateSource};
use crate::model::{
    content_instruction_order, mapping_instruction_order, ContentRecord, Key, Row,
    SourceUpdate, Value,
};
use crate::order::{natural, Comparator};
use crate::store::{StreamKind, StreamStore, TempStreams};
use crate::{ensure_active, Result, TerraceError};

pub use crate::engine::execute::PreserveHook;
pub use crate::engine::generate::{ProducedRows, Producer, SourceValues};

/// Monotonically increasing snapshot number; 0 means "no prior state".
pub type Version = u64;

/// Per-stage configuration: comparators, value preservation, sizing.
pub struct StageOptions<SK, TK, TV> {
    pub source_cmp: Comparator<SK>,
    pub target_cmp: Comparator<TK>,
    pub preserve: Option<PreserveHook<TV>>,
    pub production: ProductionConfig,
}

impl<SK: Ord + 'static, TK: Ord + 'static, TV> Default for StageOptions<SK, TK, TV> {
    fn default() -> Self {
        Self {
            source_cmp: natural(),
            target_cmp: natural(),
            preserve: None,
            production: ProductionConfig::default(),
        }
    }
}

impl<SK, TK, TV> StageOptions<SK, TK, TV> {
    pub fn with_source_cmp(mut self, cmp: Comparator<SK>) -> Self {
        self.source_cmp = cmp;
        self
    }

    pub fn with_target_cmp(mut self, cmp: Comparator<TK>) -> Self {
        self.target_cmp = cmp;
        self
    }

    pub fn with_preserve(mut self, hook: PreserveHook<TV>) -> Self {
        self.preserve = Some(hook);
        self
    }

    pub fn with_production(mut self, production: ProductionConfig) -> Self {
        self.production = production;
        self
    }
}

struct StageInner<SK: Key, SV: Value, TK: Key, TV: Value> {
    name: String,
    producer: Box<dyn Producer<SK, SV, TK, TV>>,
    store: Arc<dyn StreamStore>,
    temps: Arc<dyn TempStreams>,
    opts: StageOptions<SK, TK, TV>,
}

/// One materializing node of the DAG.
pub struct Stage<SK: Key, SV: Value, TK: Key, TV: Value> {
    inner: Arc<StageInner<SK, SV, TK, TV>>,
}

impl<SK: Key, SV: Value, TK: Key, TV: Value> Clone for Stage<SK, SV, TK, TV> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<SK: Key, SV: Value, TK: Key, TV: Value> Stage<SK, SV, TK, TV> {
    pub fn new(
        name: impl Into<String>,
        producer: Box<dyn Producer<SK, SV, TK, TV>>,
        store: Arc<dyn StreamStore>,
        temps: Arc<dyn TempStreams>,
        opts: StageOptions<SK, TK, TV>,
    ) -> Self {
        Self {
            inner: Arc::new(StageInner {
                name: name.into(),
                producer,
                store,
                temps,
                opts,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Run one production: version `based_on` plus `source` becomes version
    /// `based_on + 1`. Nothing is uploaded unless the whole production
    /// succeeds.
    pub async fn update(
        &self,
        source: BoxStream<'static, Result<SourceUpdate<SK, SV>>>,
        based_on: Version,
        cancel: &CancellationToken,
    ) -> Result<Version> {
        self.inner.run_production(source, based_on, cancel).await
    }

    /// Stream the delta this stage published at `version`.
    pub async fn read_updates(
        &self,
        version: Version,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'static, Result<SourceUpdate<TK, TV>>>> {
        ensure_active(cancel)?;
        self.inner.open_rows(StreamKind::Updates, version).await
    }
}

impl<SK: Key, SV: Value, TK: Key, TV: Value> StageInner<SK, SV, TK, TV> {
    async fn open_rows<T: Row>(
        &self,
        kind: StreamKind,
        version: Version,
    ) -> Result<BoxStream<'static, Result<T>>> {
        let stream = self.store.open_read(&self.name, kind, version).await?;
        Ok(read_rows(stream))
    }

    async fn run_production(
        &self,
        source: BoxStream<'static, Result<SourceUpdate<SK, SV>>>,
        based_on: Version,
        cancel: &CancellationToken,
    ) -> Result<Version> {
        ensure_active(cancel)?;
        let next = based_on + 1;
        log::info!(
            "stage {}: producing version {} from {}",
            self.name,
            next,
            based_on
        );
        let opts = &self.opts;

        let mut content_sorter = crate::sort::MergeSorter::new(
            format!("{}.content-instructions", self.name),
            content_instruction_order::<TK, SK, TV>(&opts.target_cmp, &opts.source_cmp),
            &opts.production,
            Arc::clone(&self.temps),
        );
        let mut mapping_sorter = crate::sort::MergeSorter::new(
            format!("{}.mapping-instructions", self.name),
            mapping_instruction_order::<SK, TK>(&opts.source_cmp, &opts.target_cmp),
            &opts.production,
            Arc::clone(&self.temps),
        );
        {
            let mut mappings =
                Cursor::new(self.open_rows(StreamKind::KeyMappings, based_on).await?).await?;
            let mut updates = Cursor::new(source).await?;
            generate_instructions(
                self.producer.as_ref(),
                &mut mappings,
                &mut updates,
                &opts.source_cmp,
                &mut content_sorter,
                &mut mapping_sorter,
                cancel,
            )
            .await?;
        }
        let mut mapping_ins = Cursor::new(mapping_sorter.finish(cancel).await?).await?;
        let mut content_ins = Cursor::new(content_sorter.finish(cancel).await?).await?;

        let mapping_scratch = self
            .temps
            .scratch(&format!("{}.key-mappings", self.name))
            .await?;
        {
            let mut writer = RowWriter::new(mapping_scratch.stream()?, opts.production.rows_per_group);
            let mut prior =
                Cursor::new(self.open_rows(StreamKind::KeyMappings, based_on).await?).await?;
            let rows = execute_mapping_instructions(
                &mut prior,
                &mut mapping_ins,
                &opts.source_cmp,
                &opts.target_cmp,
                &mut writer,
                cancel,
            )
            .await?;
            writer.finish(cancel).await?;
            log::debug!("stage {}: {} key mappings at version {}", self.name, rows, next);
        }

        let content_scratch = self.temps.scratch(&format!("{}.content", self.name)).await?;
        let updates_scratch = self.temps.scratch(&format!("{}.updates", self.name)).await?;
        {
            let mut writer = RowWriter::new(content_scratch.stream()?, opts.production.rows_per_group);
            let delta_writer =
                RowWriter::new(updates_scratch.stream()?, opts.production.rows_per_group);
            let mut sink = DeltaSink::new(Arc::clone(&opts.target_cmp), Some(delta_writer));
            let mut prior =
                Cursor::new(self.open_rows(StreamKind::Content, based_on).await?).await?;
            let rows = execute_content_instructions(
                &mut prior,
                &mut content_ins,
                &opts.target_cmp,
                &opts.source_cmp,
                &mut writer,
                &mut sink,
                opts.preserve.as_ref(),
                cancel,
            )
            .await?;
            writer.finish(cancel).await?;
            let deltas = sink.finish(cancel).await?;
            log::debug!(
                "stage {}: {} content rows, {} delta rows at version {}",
                self.name,
                rows,
                deltas,
                next
            );
        }

        self.store
            .upload(
                &self.name,
                StreamKind::Content,
                next,
                content_scratch.stream()?,
                cancel,
            )
            .await?;
        self.store
            .upload(
                &self.name,
                StreamKind::KeyMappings,
                next,
                mapping_scratch.stream()?,
                cancel,
            )
            .await?;
        self.store
            .upload(
                &self.name,
                StreamKind::Updates,
                next,
                updates_scratch.stream()?,
                cancel,
            )
            .await?;
        Ok(next)
    }
}

#[async_trait]
impl<SK: Key, SV: Value, TK: Key, TV: Value> UpdateSource<TK, TV>
    for StageInner<SK, SV, TK, TV>
{
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn update_stream(
        &self,
        version: Version,
    ) -> Result<BoxStream<'static, Result<SourceUpdate<TK, TV>>>> {
        self.open_rows(StreamKind::Updates, version).await
    }

    async fn content_pairs(
        &self,
        version: Version,
    ) -> Result<BoxStream<'static, Result<(TK, TV)>>> {
        let rows: BoxStream<'static, Result<ContentRecord<TK, SK, TV>>> =
            self.open_rows(StreamKind::Content, version).await?;
        Ok(Box::pin(rows.map_ok(|r| (r.target_key, r.value))))
    }
}

/// Type-erased node behaviour the graph drives.
#[async_trait]
trait StageNode: Send + Sync {
    fn node_name(&self) -> &str;

    async fn update_from_sources(
        &self,
        ports: Vec<&(dyn Any + Send + Sync)>,
        based_on: Version,
        cancel: &CancellationToken,
    ) -> Result<Version>;
}

#[async_trait]
impl<SK: Key, SV: Value, TK: Key, TV: Value> StageNode for StageInner<SK, SV, TK, TV> {
    fn node_name(&self) -> &str {
        &self.name
    }

    async fn update_from_sources(
        &self,
        ports: Vec<&(dyn Any + Send + Sync)>,
        based_on: Version,
        cancel: &CancellationToken,
    ) -> Result<Version> {
        let mut feeders: Vec<Arc<dyn UpdateSource<SK, SV>>> = Vec::with_capacity(ports.len());
        for port in ports {
            let feeder = port
                .downcast_ref::<Arc<dyn UpdateSource<SK, SV>>>()
                .ok_or_else(|| {
                    TerraceError::Graph(format!(
                        "feeder key types do not match stage {}",
                        self.name
                    ))
                })?;
            feeders.push(Arc::clone(feeder));
        }
        // running in topological order, every feeder has already produced
        // version based_on + 1 by the time this stage runs
        let merged = merge_sources(
            &feeders,
            based_on + 1,
            &self.opts.source_cmp,
            &self.opts.production,
            &self.temps,
            cancel,
        )
        .await?;
        self.run_production(merged, based_on, cancel).await
    }
}

pub type StageId = usize;

/// Handle to a registered stage, typed by the stage's target key and value
/// so connections are checked at compile time.
#[derive(Debug)]
pub struct StageHandle<K, V> {
    id: StageId,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for StageHandle<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for StageHandle<K, V> {}

impl<K, V> StageHandle<K, V> {
    pub fn id(&self) -> StageId {
        self.id
    }
}

struct GraphNode {
    name: String,
    node: Arc<dyn StageNode>,
    /// `Arc<dyn UpdateSource<TK, TV>>` behind `Any`; recovered with the
    /// types the typed handles guarantee
    port: Box<dyn Any + Send + Sync>,
    upstream: Vec<StageId>,
    downstream: Vec<StageId>,
}

/// Owning registry of stages and their relations.
#[derive(Default)]
pub struct StageGraph {
    nodes: Vec<GraphNode>,
    names: HashMap<String, StageId>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage fed by `sources`. Source handles must carry the
    /// stage's source key and value types.
    pub fn add_stage<SK: Key, SV: Value, TK: Key, TV: Value>(
        &mut self,
        stage: &Stage<SK, SV, TK, TV>,
        sources: &[StageHandle<SK, SV>],
    ) -> Result<StageHandle<TK, TV>> {
        let name = stage.name().to_string();
        if self.names.contains_key(&name) {
            return Err(TerraceError::StageExists(name));
        }
        for source in sources {
            if source.id >= self.nodes.len() {
                return Err(TerraceError::Graph(format!(
                    "unknown source handle {} for stage {}",
                    source.id, name
                )));
            }
        }
        let id = self.nodes.len();
        for source in sources {
            self.nodes[source.id].downstream.push(id);
        }
        let node: Arc<dyn StageNode> = stage.inner.clone();
        let port: Arc<dyn UpdateSource<TK, TV>> = stage.inner.clone();
        self.nodes.push(GraphNode {
            name: name.clone(),
            node,
            port: Box::new(port),
            upstream: sources.iter().map(|s| s.id).collect(),
            downstream: Vec::new(),
        });
        self.names.insert(name, id);
        Ok(StageHandle {
            id,
            _types: PhantomData,
        })
    }

    pub fn stage_id(&self, name: &str) -> Result<StageId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| TerraceError::StageNotFound(name.to_string()))
    }

    pub fn stage_name(&self, id: StageId) -> Option<&str> {
        self.nodes.get(id).map(|n| n.name.as_str())
    }

    /// Update every transitive downstream of `of` in topological order,
    /// each one reading its feeders' freshly produced version
    /// `based_on + 1` streams.
    pub async fn update_targets<K, V>(
        &self,
        of: StageHandle<K, V>,
        based_on: Version,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for id in self.topo_downstream(of.id) {
            ensure_active(cancel)?;
            let node = &self.nodes[id];
            let ports: Vec<&(dyn Any + Send + Sync)> = node
                .upstream
                .iter()
                .map(|u| self.nodes[*u].port.as_ref())
                .collect();
            log::debug!("updating target stage {}", node.node.node_name());
            node.node.update_from_sources(ports, based_on, cancel).await?;
        }
        Ok(())
    }

    /// Transitive downstream closure of `root` (excluded), dependencies
    /// before dependents, stable per call.
    fn topo_downstream(&self, root: StageId) -> Vec<StageId> {
        let mut affected = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            for &d in &self.nodes[n].downstream {
                if affected.insert(d) {
                    stack.push(d);
                }
            }
        }
        let mut order = Vec::with_capacity(affected.len());
        let mut visited = BTreeSet::new();
        for &id in &affected {
            self.visit(id, &affected, &mut visited, &mut order);
        }
        order
    }

    fn visit(
        &self,
        id: StageId,
        affected: &BTreeSet<StageId>,
        visited: &mut BTreeSet<StageId>,
        order: &mut Vec<StageId>,
    ) {
        if !affected.contains(&id) || !visited.insert(id) {
            return;
        }
        for &u in &self.nodes[id].upstream {
            self.visit(u, affected, visited, order);
        }
        order.push(id);
    }
}
