//! Structural type codes.
//!
//! The numeric values are wire constants: they appear in packed identifiers,
//! coverage-array bytes, and trace-file headers, and must never be renumbered.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Kind of structural entity a stream observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    Block,
    Branch,
}

impl ObjectType {
    pub fn code(self) -> i32 {
        match self {
            ObjectType::Block => 1,
            ObjectType::Branch => 2,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, WireError> {
        match code {
            1 => Ok(ObjectType::Block),
            2 => Ok(ObjectType::Branch),
            _ => Err(WireError::BadCode {
                kind: "object_type",
                code,
            }),
        }
    }
}

/// Instrumentation mode negotiated in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstMode {
    /// One message per event, full signature attached.
    Compatible,
    /// Per-thread coverage arrays, shipped in batches.
    OptNormal,
    /// Ordered sequence buffer with interned signatures.
    OptSequence,
    /// In-subject fingerprint hashing; nothing crosses the wire per event.
    TraceHashing,
}

impl InstMode {
    pub fn code(self) -> i32 {
        match self {
            InstMode::Compatible => 1,
            InstMode::OptNormal => 2,
            InstMode::OptSequence => 3,
            InstMode::TraceHashing => 4,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, WireError> {
        match code {
            1 => Ok(InstMode::Compatible),
            2 => Ok(InstMode::OptNormal),
            3 => Ok(InstMode::OptSequence),
            4 => Ok(InstMode::TraceHashing),
            _ => Err(WireError::BadCode {
                kind: "inst_mode",
                code,
            }),
        }
    }
}

/// Basic-block kinds. The code doubles as the packed-id type tag and as the
/// witnessed byte written into coverage arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    Code,
    Entry,
    Exit,
    Call,
    Return,
}

impl BlockType {
    pub const ALL: [BlockType; 5] = [
        BlockType::Code,
        BlockType::Entry,
        BlockType::Exit,
        BlockType::Call,
        BlockType::Return,
    ];

    pub fn code(self) -> u8 {
        match self {
            BlockType::Code => 1,
            BlockType::Entry => 2,
            BlockType::Exit => 3,
            BlockType::Call => 4,
            BlockType::Return => 5,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        match code {
            1 => Ok(BlockType::Code),
            2 => Ok(BlockType::Entry),
            3 => Ok(BlockType::Exit),
            4 => Ok(BlockType::Call),
            5 => Ok(BlockType::Return),
            _ => Err(WireError::BadCode {
                kind: "block_type",
                code: code as i32,
            }),
        }
    }

    /// Name used in trace-file headers.
    pub fn name(self) -> &'static str {
        match self {
            BlockType::Code => "Basic",
            BlockType::Entry => "Entry",
            BlockType::Exit => "Exit",
            BlockType::Call => "Call",
            BlockType::Return => "Return",
        }
    }

    /// Command-line selector letter.
    pub fn letter(self) -> char {
        match self {
            BlockType::Code => 'B',
            BlockType::Entry => 'E',
            BlockType::Exit => 'X',
            BlockType::Call => 'C',
            BlockType::Return => 'R',
        }
    }
}

/// Refinement of a block's behavior, carried by the CFG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSubType {
    Other,
    /// Ends in an explicit throw with precisely modeled exception edges.
    Throw,
    /// Stands for any unchecked exceptional termination.
    SummaryThrow,
    Switch,
    If,
}

impl BlockSubType {
    pub fn code(self) -> u8 {
        match self {
            BlockSubType::Other => 0,
            BlockSubType::Throw => 1,
            BlockSubType::SummaryThrow => 2,
            BlockSubType::Switch => 3,
            BlockSubType::If => 4,
        }
    }
}

/// Branch-edge kinds. The code doubles as the packed-id type tag on branch
/// streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchType {
    If,
    Switch,
    Throw,
    Call,
    Entry,
    /// Summary edges and anything not precisely modeled.
    Summary,
}

impl BranchType {
    pub const ALL: [BranchType; 6] = [
        BranchType::If,
        BranchType::Switch,
        BranchType::Throw,
        BranchType::Call,
        BranchType::Entry,
        BranchType::Summary,
    ];

    pub fn code(self) -> u8 {
        match self {
            BranchType::If => 1,
            BranchType::Switch => 2,
            BranchType::Throw => 3,
            BranchType::Call => 4,
            BranchType::Entry => 5,
            BranchType::Summary => 6,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        match code {
            1 => Ok(BranchType::If),
            2 => Ok(BranchType::Switch),
            3 => Ok(BranchType::Throw),
            4 => Ok(BranchType::Call),
            5 => Ok(BranchType::Entry),
            6 => Ok(BranchType::Summary),
            _ => Err(WireError::BadCode {
                kind: "branch_type",
                code: code as i32,
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BranchType::If => "If",
            BranchType::Switch => "Switch",
            BranchType::Throw => "Throw",
            BranchType::Call => "Call",
            BranchType::Entry => "Entry",
            BranchType::Summary => "Other",
        }
    }

    pub fn letter(self) -> char {
        match self {
            BranchType::If => 'I',
            BranchType::Switch => 'S',
            BranchType::Throw => 'T',
            BranchType::Call => 'C',
            BranchType::Entry => 'E',
            BranchType::Summary => 'O',
        }
    }
}

/// Set of block kinds selected for probe emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockMask(u8);

impl BlockMask {
    pub fn empty() -> Self {
        BlockMask(0)
    }

    pub fn all() -> Self {
        let mut mask = BlockMask(0);
        for t in BlockType::ALL {
            mask.insert(t);
        }
        mask
    }

    pub fn insert(&mut self, t: BlockType) {
        self.0 |= 1 << t.code();
    }

    pub fn contains(self, t: BlockType) -> bool {
        self.0 & (1 << t.code()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = BlockType> {
        BlockType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl FromIterator<BlockType> for BlockMask {
    fn from_iter<I: IntoIterator<Item = BlockType>>(iter: I) -> Self {
        let mut mask = BlockMask::empty();
        for t in iter {
            mask.insert(t);
        }
        mask
    }
}

/// Set of branch kinds selected for probe emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BranchMask(u8);

impl BranchMask {
    pub fn empty() -> Self {
        BranchMask(0)
    }

    pub fn all() -> Self {
        let mut mask = BranchMask(0);
        for t in BranchType::ALL {
            mask.insert(t);
        }
        mask
    }

    pub fn insert(&mut self, t: BranchType) {
        self.0 |= 1 << t.code();
    }

    pub fn contains(self, t: BranchType) -> bool {
        self.0 & (1 << t.code()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = BranchType> {
        BranchType::ALL
            .into_iter()
            .filter(move |t| self.contains(*t))
    }
}

impl FromIterator<BranchType> for BranchMask {
    fn from_iter<I: IntoIterator<Item = BranchType>>(iter: I) -> Self {
        let mut mask = BranchMask::empty();
        for t in iter {
            mask.insert(t);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_survive_round_trip() {
        for t in BlockType::ALL {
            assert_eq!(BlockType::from_code(t.code()).unwrap(), t);
        }
        for t in BranchType::ALL {
            assert_eq!(BranchType::from_code(t.code()).unwrap(), t);
        }
        for m in [
            InstMode::Compatible,
            InstMode::OptNormal,
            InstMode::OptSequence,
            InstMode::TraceHashing,
        ] {
            assert_eq!(InstMode::from_code(m.code()).unwrap(), m);
        }
    }

    #[test]
    fn types_serialize_for_cfg_exchange() {
        assert_eq!(serde_json::to_string(&BlockType::Code).unwrap(), "\"Code\"");
        assert_eq!(
            serde_json::from_str::<BranchType>("\"Throw\"").unwrap(),
            BranchType::Throw
        );
        let mask: BlockMask = [BlockType::Code].into_iter().collect();
        let json = serde_json::to_string(&mask).unwrap();
        assert_eq!(serde_json::from_str::<BlockMask>(&json).unwrap(), mask);
    }

    #[test]
    fn masks_select_independently() {
        let mask: BlockMask = [BlockType::Code, BlockType::Exit].into_iter().collect();
        assert!(mask.contains(BlockType::Code));
        assert!(mask.contains(BlockType::Exit));
        assert!(!mask.contains(BlockType::Entry));
        assert_eq!(mask.iter().count(), 2);
        assert!(BlockMask::empty().is_empty());
        assert_eq!(BranchMask::all().iter().count(), 6);
    }
}
