//! Scanflow Core - groupwise imaging preprocessing building blocks
//!
//! Discovery, fan-out planning, identity resolution, transform chains and
//! group template construction. Registration and image handling stay behind
//! the adapter traits in [`adapter`].

pub mod adapter;
pub mod cache;
pub mod command;
pub mod config;
pub mod error;
pub mod identity;
pub mod inventory;
pub mod layout;
pub mod planner;
pub mod template;
pub mod transform;

pub use adapter::{
    ImageHandle, ImageIo, Interpolation, RegistrationAdapter, RegistrationOutput,
    RegistrationRequest,
};
pub use cache::{CacheKey, CacheStats, ResultCache};
pub use command::{CommandImageIo, ScriptRegistration};
pub use config::{
    parse_spacing, AtlasConfig, AtlasResampling, DirectTarget, NodeCosts, PipelineConfig,
    ResourceBudget, ResourceCost, SingleInputPolicy, TemplateStrategy, Topology,
};
pub use error::AdapterError;
pub use identity::IdentityResolver;
pub use inventory::{parse_scan_name, FilesystemSource, ScanInventory, ScanSource};
pub use layout::{Manifest, OutputLayout};
pub use planner::{IterationPlan, IterationPlanner, DEFAULT_RUN};
pub use template::{GroupTemplate, GroupTemplateBuilder};
pub use transform::{
    compose, NamedImage, Space, Transform, TransformChain, TransformChainComposer, TransformKind,
    TransformStep,
};
