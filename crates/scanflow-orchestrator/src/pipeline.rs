//! Preprocessing pipeline assembly
//!
//! Discovery and planning happen first and produce a static key list; the
//! graph is then declared for the selected topology and instantiated once.
//!
//! Flat topology, one replica per functional run:
//!
//! ```text
//! load ─┬─> [join] ─┬─> resample_atlas (reference, atlas)
//!       │           └─> template ─┬─> commonspace ─────────────┐
//!       │                         v                             v
//!       └────────────────> native_to_template ─> to_commonspace ─> atlas ─> sink
//! ```
//!
//! `resample_atlas` feeds its reference and atlas images to every node that
//! registers or resamples against them.
//!
//! Paired topology runs the same chain over anatomical scans per session and
//! nests functional runs below it. Each run is registered onto its session's
//! scan (`run_to_anat`, masked by the propagated brain mask), resampled through
//! run → anatomy → template → commonspace and joined back into the session's
//! sink.

use crate::graph::{GraphBuilder, Scope, TaskGraph, JOIN_OUTPUT};
use crate::report::RunReport;
use crate::scheduler::Scheduler;
use crate::tasks::{
    registers_per_replica, BuildTemplate, CommonspaceRegistration, LoadScan, NativeToTemplate,
    PropagateAtlas, ResampleAtlas, RunToAnatomy, ToCommonspace, WriteOutputs,
};
use scanflow_common::{Result, ScanflowError};
use scanflow_core::{
    CommandImageIo, GroupTemplateBuilder, ImageIo, IterationPlan, IterationPlanner,
    OutputLayout, PipelineConfig, RegistrationAdapter, ResourceCost, ResultCache, ScanInventory,
    ScanSource, ScriptRegistration, Topology, TransformChainComposer,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Expansion names
const RUN: &str = "run";
const SESSION: &str = "session";

/// Iteration source names (also the input slot each replica reads)
const FUNCTIONAL: &str = "bold";
const ANATOMICAL: &str = "anat";

pub struct Pipeline {
    config: PipelineConfig,
    registration: Arc<dyn RegistrationAdapter>,
    io: Arc<dyn ImageIo>,
    cache: Option<ResultCache>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registration: Arc<dyn RegistrationAdapter>,
        io: Arc<dyn ImageIo>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registration,
            io,
            cache: None,
        })
    }

    /// Pipeline driving the external registration script and ANTs tools
    pub fn with_external_tools(config: PipelineConfig) -> Result<Self> {
        let script = config.registration_script.clone().ok_or_else(|| {
            ScanflowError::Configuration("no registration script configured".to_string())
        })?;
        Self::new(
            config,
            Arc::new(ScriptRegistration::new(script)),
            Arc::new(CommandImageIo::new()),
        )
    }

    /// Share a result cache across runs (otherwise one is created from
    /// `cache_dir`, or kept in memory)
    pub fn with_cache(mut self, cache: ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Discover scans and plan the fan-out
    pub fn plan(&self, source: &dyn ScanSource) -> Result<IterationPlan> {
        let inventory = ScanInventory::discover(source)?;
        IterationPlanner::new(self.config.topology).plan(&inventory)
    }

    /// Declare and instantiate the task graph for `plan`
    pub fn build_graph(&self, plan: &IterationPlan, layout: &OutputLayout) -> Result<TaskGraph> {
        if plan.topology != self.config.topology {
            return Err(ScanflowError::Configuration(format!(
                "plan was made for the {} topology but the pipeline is {}",
                plan.topology, self.config.topology
            )));
        }

        let reference = self.config.atlas_reference()?;
        let costs = &self.config.costs;
        let composer = TransformChainComposer::new(self.io.clone());
        let (top, top_source) = match self.config.topology {
            Topology::Flat => (RUN, FUNCTIONAL),
            Topology::Paired => (SESSION, ANATOMICAL),
        };
        let replica = || Scope::expansion(top);

        let workers = self.config.template_workers(plan.replica_count());
        let builder = GroupTemplateBuilder::new(
            self.registration.clone(),
            self.io.clone(),
            self.config.template.clone(),
            layout.template_dir(),
        )
        .with_max_workers(workers);
        let template_cost = if registers_per_replica(&self.config.template) {
            costs.resample()
        } else {
            costs.template(workers)
        };

        let mut graph = GraphBuilder::new();
        graph.source(top_source, &plan.top_level)?;
        graph
            .expansion(top, &[top_source], false)
            .node(
                "load",
                replica(),
                Arc::new(LoadScan::new(self.io.clone(), top_source)),
                costs.load(),
            )
            .join("native_images", "load", "image", Scope::Global)
            .node(
                "resample_atlas",
                Scope::Global,
                Arc::new(ResampleAtlas::new(
                    self.io.clone(),
                    reference,
                    self.config.atlas.images(),
                    self.config.atlas.resampling,
                    layout.template_dir().join("atlas"),
                )),
                costs.resample(),
            )
            .connect("native_images", JOIN_OUTPUT, "resample_atlas", "images")
            .node(
                "template",
                Scope::Global,
                Arc::new(BuildTemplate::new(builder.clone())),
                template_cost,
            )
            .connect("native_images", JOIN_OUTPUT, "template", "images")
            .connect("resample_atlas", "reference", "template", "reference")
            .connect("resample_atlas", "atlas", "template", "atlas")
            .node(
                "native_to_template",
                replica(),
                Arc::new(NativeToTemplate::new(builder)),
                costs.registration(),
            )
            .connect("load", "image", "native_to_template", "image")
            .connect("template", "template", "native_to_template", "template")
            .connect("template", "chains", "native_to_template", "chains")
            .connect("resample_atlas", "atlas", "native_to_template", "atlas")
            .node(
                "commonspace",
                Scope::Global,
                Arc::new(CommonspaceRegistration::new(
                    self.registration.clone(),
                    layout.template_dir().join("commonspace"),
                )),
                costs.registration(),
            )
            .connect("template", "template", "commonspace", "template")
            .connect("resample_atlas", "reference", "commonspace", "reference")
            .connect("resample_atlas", "atlas", "commonspace", "atlas")
            .node(
                "to_commonspace",
                replica(),
                Arc::new(ToCommonspace::new(
                    composer.clone(),
                    layout.clone(),
                    "to_commonspace",
                    &["native_chain", "common_chain"],
                )),
                costs.resample(),
            )
            .connect("load", "image", "to_commonspace", "image")
            .connect("resample_atlas", "reference", "to_commonspace", "reference")
            .connect("native_to_template", "chain", "to_commonspace", "native_chain")
            .connect("commonspace", "chain", "to_commonspace", "common_chain")
            .node(
                "atlas",
                replica(),
                Arc::new(PropagateAtlas::new(composer.clone(), layout.clone(), "atlas")),
                costs.resample(),
            )
            .connect("load", "image", "atlas", "image")
            .connect("to_commonspace", "chain", "atlas", "chain")
            .connect("resample_atlas", "atlas", "atlas", "atlas");

        let mut sink = WriteOutputs::new(self.io.clone(), layout.clone());
        if self.config.topology == Topology::Paired {
            sink = sink.with_runs();
            graph.source(FUNCTIONAL, &plan.runs)?;
            graph
                .nested_expansion(RUN, SESSION, FUNCTIONAL)
                .node(
                    "load_run",
                    Scope::expansion(RUN),
                    Arc::new(LoadScan::new(self.io.clone(), FUNCTIONAL)),
                    costs.load(),
                )
                .node(
                    "run_to_anat",
                    Scope::expansion(RUN),
                    Arc::new(RunToAnatomy::new(
                        self.registration.clone(),
                        layout.clone(),
                        "run_to_anat",
                    )),
                    costs.registration(),
                )
                .connect("load_run", "image", "run_to_anat", "image")
                .connect("load", "image", "run_to_anat", "anatomy")
                .connect("atlas", "masks", "run_to_anat", "masks")
                .node(
                    "run_to_commonspace",
                    Scope::expansion(RUN),
                    Arc::new(ToCommonspace::new(
                        composer,
                        layout.clone(),
                        "run_to_commonspace",
                        &["run_chain", "session_chain"],
                    )),
                    costs.resample(),
                )
                .connect("load_run", "image", "run_to_commonspace", "image")
                .connect("resample_atlas", "reference", "run_to_commonspace", "reference")
                .connect("run_to_anat", "chain", "run_to_commonspace", "run_chain")
                .connect("to_commonspace", "chain", "run_to_commonspace", "session_chain")
                .join("session_runs", "run_to_commonspace", "image", replica())
                .connect("session_runs", JOIN_OUTPUT, "sink", "runs");
        }

        graph
            .node("sink", replica(), Arc::new(sink), ResourceCost::new(1, 0))
            .connect("to_commonspace", "image", "sink", "image")
            .connect("atlas", "masks", "sink", "masks")
            .connect("to_commonspace", "chain", "sink", "chain")
            .output("sink");

        graph.build()
    }

    fn scheduler(&self) -> Result<Scheduler> {
        let cache = match (&self.cache, &self.config.cache_dir) {
            (Some(cache), _) => cache.clone(),
            (None, Some(dir)) => ResultCache::with_dir(dir)?,
            (None, None) => ResultCache::new(),
        };
        Ok(Scheduler::new(self.config.budget)
            .with_node_timeout(self.config.node_timeout())
            .with_cache(cache))
    }

    /// Discover, plan, build and execute, then write `run_report.json` under
    /// `output_dir`.
    ///
    /// Build-time errors (configuration, discovery, join mismatches) are
    /// returned before anything runs. Node failures are recorded in the
    /// report instead.
    pub async fn run(&self, source: &dyn ScanSource, output_dir: &Path) -> Result<RunReport> {
        let plan = self.plan(source)?;
        info!(
            "Planned {} {} replicas ({} topology, {} template)",
            plan.replica_count(),
            match plan.topology {
                Topology::Flat => RUN,
                Topology::Paired => SESSION,
            },
            self.config.topology,
            self.config.template.name()
        );

        let layout = OutputLayout::new(output_dir);
        let graph = self.build_graph(&plan, &layout)?;
        let report = self.scheduler()?.run(&graph).await;
        report.write_json(&layout.report_path()).await?;
        Ok(report)
    }
}
