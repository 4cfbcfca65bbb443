//! Control-flow graphs, as consumed.
//!
//! The graph arrives fully built: blocks carry their type, subtype, and the
//! offset range they span in the original body; edges carry literal labels
//! and per-edge branch ids. Blocks and edges reference each other through
//! plain indices into the arenas, so cycles need no special handling — the
//! instrumentor visits blocks once in id order and never walks edges
//! transitively.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracery_wire::{BlockSubType, BlockType, BranchType, ObjectType};

use crate::error::InstrumentError;

/// A basic block. Ids are 1-based and unique within a method; offsets index
/// instructions of the original body. Virtual blocks (entry, exit) carry the
/// offsets of the code they bracket.
#[derive(Debug, Clone, Deserialize)]
pub struct CfgBlock {
    pub id: u32,
    pub block_type: BlockType,
    pub subtype: BlockSubType,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Indices into the block arena, not block ids.
    #[serde(default)]
    pub successors: Vec<usize>,
    #[serde(default)]
    pub predecessors: Vec<usize>,
}

/// A CFG edge with its literal label and the branch ids riding on it.
#[derive(Debug, Clone, Deserialize)]
pub struct CfgEdge {
    pub from_block: usize,
    pub to_block: usize,
    pub label: String,
    #[serde(default)]
    pub branch_ids: Vec<(BranchType, u32)>,
}

impl CfgEdge {
    pub fn label(&self) -> EdgeLabel {
        EdgeLabel::parse(&self.label)
    }

    /// The id this edge carries for a given branch kind, if any.
    pub fn branch_id(&self, kind: BranchType) -> Option<u32> {
        self.branch_ids
            .iter()
            .find(|(t, _)| *t == kind)
            .map(|(_, id)| *id)
    }
}

/// Parsed form of the literal edge labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeLabel {
    /// `"<r>"`: normal return from a call.
    NormalReturn,
    /// `"<any>"`: catch-all exception edge.
    AnyException,
    /// `"default"`: switch default.
    Default,
    /// A decimal integer: switch case value.
    Case(i32),
    /// `"t"`: if-true.
    IfTrue,
    /// `"f"`: if-false.
    IfFalse,
    /// Anything else names an exception type.
    Exception(String),
}

impl EdgeLabel {
    pub fn parse(raw: &str) -> EdgeLabel {
        match raw {
            "<r>" => EdgeLabel::NormalReturn,
            "<any>" => EdgeLabel::AnyException,
            "default" => EdgeLabel::Default,
            "t" => EdgeLabel::IfTrue,
            "f" => EdgeLabel::IfFalse,
            other => match other.parse::<i32>() {
                Ok(value) => EdgeLabel::Case(value),
                Err(_) => EdgeLabel::Exception(other.to_owned()),
            },
        }
    }

    /// True for labels that represent a thrown exception reaching the edge.
    pub fn is_exceptional(&self) -> bool {
        matches!(self, EdgeLabel::AnyException | EdgeLabel::Exception(_))
    }
}

/// The control-flow graph of one method.
#[derive(Debug, Clone, Deserialize)]
pub struct Cfg {
    pub signature: String,
    pub highest_block_id: u32,
    pub blocks: Vec<CfgBlock>,
    pub edges: Vec<CfgEdge>,
}

impl Cfg {
    /// Blocks in id order, the only traversal order the instrumentor uses.
    pub fn blocks_in_id_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.blocks.len()).collect();
        order.sort_by_key(|&i| self.blocks[i].id);
        order
    }

    pub fn block(&self, index: usize) -> &CfgBlock {
        &self.blocks[index]
    }

    /// Outgoing edges of a block, in arena order.
    pub fn edges_from(&self, block_index: usize) -> impl Iterator<Item = &CfgEdge> {
        self.edges.iter().filter(move |e| e.from_block == block_index)
    }

    pub fn edge_between(&self, from: usize, to: usize) -> Option<&CfgEdge> {
        self.edges
            .iter()
            .find(|e| e.from_block == from && e.to_block == to)
    }

    /// Number of structural entities a coverage array for this method needs.
    pub fn entity_count(&self, object_type: ObjectType) -> u32 {
        match object_type {
            ObjectType::Block => self.highest_block_id,
            ObjectType::Branch => self
                .edges
                .iter()
                .flat_map(|e| e.branch_ids.iter().map(|(_, id)| *id))
                .max()
                .unwrap_or(0),
        }
    }

    /// The summary exit block, when the graph models one.
    pub fn summary_exit_block(&self) -> Option<&CfgBlock> {
        self.blocks
            .iter()
            .find(|b| b.block_type == BlockType::Exit && b.subtype == BlockSubType::SummaryThrow)
    }

    /// The branch id of the summary edge, when the graph models one.
    pub fn summary_branch_id(&self) -> Option<u32> {
        self.edges
            .iter()
            .find_map(|e| e.branch_id(BranchType::Summary))
    }
}

/// All CFGs available for a rewrite job, keyed by method signature.
#[derive(Debug, Default)]
pub struct CfgSet {
    graphs: HashMap<String, Cfg>,
}

impl CfgSet {
    pub fn new() -> Self {
        CfgSet::default()
    }

    pub fn insert(&mut self, cfg: Cfg) {
        self.graphs.insert(cfg.signature.clone(), cfg);
    }

    pub fn get(&self, signature: &str) -> Result<&Cfg, InstrumentError> {
        self.graphs
            .get(signature)
            .ok_or_else(|| InstrumentError::MissingCfg {
                signature: signature.to_owned(),
            })
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Load a JSON array of CFGs, as emitted by the graph builder.
    pub fn load(path: &Path) -> Result<Self, InstrumentError> {
        let raw = std::fs::read_to_string(path).map_err(|source| InstrumentError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let graphs: Vec<Cfg> =
            serde_json::from_str(&raw).map_err(|source| InstrumentError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        let mut set = CfgSet::new();
        for cfg in graphs {
            set.insert(cfg);
        }
        Ok(set)
    }
}
