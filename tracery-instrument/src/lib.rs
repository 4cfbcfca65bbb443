//! Structural instrumentor.
//!
//! Consumes compiled units together with their control-flow graphs and
//! rewrites method bodies so that probe calls fire at block or branch-edge
//! granularity. The rewriter preserves branch targets, exception-handler
//! regions, and stack balance; the runtime behavior of the probes themselves
//! lives in the `tracery-probe` crate.
//!
//! The CFG is an input, not something this crate builds: the external builder
//! hands over units and graphs as JSON and the instrumentor only reads them.

pub mod cfg;
pub mod descriptors;
pub mod error;
pub mod ir;
pub mod rewrite;
pub mod unit;

pub use cfg::{Cfg, CfgBlock, CfgEdge, CfgSet, EdgeLabel};
pub use error::InstrumentError;
pub use ir::{BranchKind, CallSite, ExceptionEntry, Insn, InsnId, MethodBody, MethodEditor};
pub use rewrite::{
    instrument_units, GlobalIndexTable, InstrumentOptions, Instrumentor, JobReport, UnitReport,
};
pub use unit::{Method, MethodAccess, Unit, UnitKind};
