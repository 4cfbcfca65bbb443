//! The structural rewriter.
//!
//! Splices probe calls into method bodies, block by block in id order. The
//! emission rules are mode- and granularity-specific, but every path funnels
//! through the same commit-sequence builder and the same dispatch-chain
//! construction, so the structural guarantees (target preservation, watched
//! regions, stack balance) are enforced in one place: the editor.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, warn};
use tracery_wire::{
    BlockMask, BlockSubType, BlockType, BranchMask, BranchType, InstMode, ObjectId, ObjectType,
};

use crate::cfg::{Cfg, CfgEdge, CfgSet, EdgeLabel};
use crate::descriptors;
use crate::error::InstrumentError;
use crate::ir::{BranchKind, ExceptionEntry, Insn, InsnId, MethodBody, MethodEditor};
use crate::unit::{Unit, UnitKind};

/// Value of the suppress local after a precise throw-site dispatch.
pub const SUMMARY_EXIT_FLAG: i32 = 1;

/// Value of the suppress local after a call-site dispatch.
pub const EXC_EXIT_CALL_FLAG: i32 = 2;

/// What to instrument and how.
#[derive(Debug, Clone)]
pub struct InstrumentOptions {
    pub mode: InstMode,
    pub object_type: ObjectType,
    pub blocks: BlockMask,
    pub branches: BranchMask,
    /// Changes the probe startup argument so the probe defers its connection
    /// until the test harness starts driving.
    pub target_junit: bool,
    /// Explicit startup-call request, used only when a unit has neither a
    /// class initializer nor a program entry point.
    pub startup_method: Option<String>,
}

impl InstrumentOptions {
    pub fn new(mode: InstMode, object_type: ObjectType) -> Self {
        InstrumentOptions {
            mode,
            object_type,
            blocks: BlockMask::empty(),
            branches: BranchMask::empty(),
            target_junit: false,
            startup_method: None,
        }
    }
}

/// Lazily assigned 1-based indices per `(signature, entity id)`, used by the
/// hashing commit sequence. Lives for the whole rewrite job and is serialized
/// next to the instrumented output.
#[derive(Debug, Default)]
pub struct GlobalIndexTable {
    map: HashMap<(String, u32), u32>,
    next: u32,
}

impl GlobalIndexTable {
    pub fn new() -> Self {
        GlobalIndexTable {
            map: HashMap::new(),
            next: 1,
        }
    }

    pub fn index_for(&mut self, signature: &str, id: u32) -> u32 {
        if let Some(&index) = self.map.get(&(signature.to_owned(), id)) {
            return index;
        }
        let index = self.next;
        assert!(index <= i32::MAX as u32, "global index table overflow");
        self.next += 1;
        self.map.insert((signature.to_owned(), id), index);
        index
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Write the mapping file: one JSON record per index, index order.
    pub fn save(&self, path: &Path) -> Result<(), InstrumentError> {
        #[derive(serde::Serialize)]
        struct Record<'a> {
            index: u32,
            signature: &'a str,
            id: u32,
        }
        let mut records: Vec<Record> = self
            .map
            .iter()
            .map(|((signature, id), index)| Record {
                index: *index,
                signature,
                id: *id,
            })
            .collect();
        records.sort_by_key(|r| r.index);
        let raw = serde_json::to_string_pretty(&records).map_err(|source| {
            InstrumentError::Parse {
                path: path.display().to_string(),
                source,
            }
        })?;
        std::fs::write(path, raw).map_err(|source| InstrumentError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Outcome for one unit.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub unit: String,
    pub methods_instrumented: usize,
    pub methods_skipped: usize,
}

/// Outcome for a whole rewrite job.
#[derive(Debug, Default)]
pub struct JobReport {
    pub units_ok: usize,
    pub units_failed: usize,
    pub reports: Vec<UnitReport>,
}

/// Per-method working state.
struct Scope<'c> {
    cfg: &'c Cfg,
    signature: String,
    twin: bool,
    /// Local holding the per-thread coverage array (OptNormal only).
    arr_local: Option<u16>,
    /// Local holding the in-flight exception during dispatch chains.
    exc_local: u16,
    /// Local holding the summary-suppress flag.
    suppress_local: u16,
    /// Set when any dispatch chain wrote the suppress flag.
    used_suppress: bool,
}

/// One arm of an exception dispatch chain.
struct DispatchArm {
    /// `None` matches any throwable.
    exc_type: Option<String>,
    commit: Vec<Insn>,
    suppress: Option<i32>,
}

pub struct Instrumentor<'a> {
    cfgs: &'a CfgSet,
    options: InstrumentOptions,
    hash_table: GlobalIndexTable,
}

impl<'a> Instrumentor<'a> {
    pub fn new(cfgs: &'a CfgSet, options: InstrumentOptions) -> Self {
        Instrumentor {
            cfgs,
            options,
            hash_table: GlobalIndexTable::new(),
        }
    }

    pub fn hash_table(&self) -> &GlobalIndexTable {
        &self.hash_table
    }

    pub fn into_hash_table(self) -> GlobalIndexTable {
        self.hash_table
    }

    /// Rewrite every executable method of `unit` in place. A failure aborts
    /// the whole unit: the caller keeps the original unit and moves on.
    pub fn instrument_unit(&mut self, unit: &mut Unit) -> Result<UnitReport, InstrumentError> {
        if unit.kind == UnitKind::Interface {
            return Err(InstrumentError::BadFileFormat {
                unit: unit.name.clone(),
                reason: "interfaces carry no executable code".into(),
            });
        }

        let twin = descriptors::is_probe_call(&unit.name) || unit.name.starts_with("tracery.probe");
        if twin {
            redirect_probe_calls_to_twin(unit);
        }

        let startup = self.pick_startup_method(unit);

        let mut rewritten = Vec::with_capacity(unit.methods.len());
        let mut instrumented = 0;
        let mut skipped = 0;
        for method in &unit.methods {
            let Some(body) = method.body.as_ref().filter(|_| method.is_executable()) else {
                skipped += 1;
                rewritten.push(None);
                continue;
            };
            if body.insns.is_empty() {
                skipped += 1;
                rewritten.push(None);
                continue;
            }
            let wants_startup = startup.as_deref() == Some(method.signature.as_str());
            let new_body = self.instrument_method(&method.signature, body, twin, wants_startup)?;
            instrumented += 1;
            rewritten.push(Some(new_body));
        }

        // Nothing failed: commit the rewritten bodies.
        for (method, body) in unit.methods.iter_mut().zip(rewritten) {
            if let Some(body) = body {
                method.body = Some(body);
            }
        }
        debug!(
            "instrumented {instrumented} method(s) in {} ({skipped} skipped)",
            unit.name
        );
        Ok(UnitReport {
            unit: unit.name.clone(),
            methods_instrumented: instrumented,
            methods_skipped: skipped,
        })
    }

    /// Startup-call placement: class initializer, else the entry point, else
    /// an explicitly requested method.
    fn pick_startup_method(&self, unit: &Unit) -> Option<String> {
        if let Some(m) = unit.methods.iter().find(|m| m.access.is_class_init) {
            return Some(m.signature.clone());
        }
        if let Some(m) = unit.methods.iter().find(|m| m.access.is_main) {
            return Some(m.signature.clone());
        }
        self.options
            .startup_method
            .as_ref()
            .filter(|sig| unit.methods.iter().any(|m| m.signature == **sig))
            .cloned()
    }

    fn instrument_method(
        &mut self,
        signature: &str,
        body: &MethodBody,
        twin: bool,
        wants_startup: bool,
    ) -> Result<MethodBody, InstrumentError> {
        let cfg = self.cfgs.get(signature)?;
        self.validate_ids(signature, cfg)?;

        let mut editor = MethodEditor::from_body(body)?;
        let mut scope = Scope {
            cfg,
            signature: signature.to_owned(),
            twin,
            arr_local: None,
            exc_local: 0,
            suppress_local: 0,
            used_suppress: false,
        };
        scope.exc_local = editor.alloc_local();
        scope.suppress_local = editor.alloc_local();

        // Method-entry prologue: the startup call strictly precedes every
        // other probe invocation.
        let mut prologue = Vec::new();
        if wants_startup {
            prologue.push(Insn::PushInt(self.options.target_junit as i32));
            prologue.push(Insn::Invoke(descriptors::START.call(twin)));
        }
        let count = cfg.entity_count(self.options.object_type) as i32;
        match self.options.mode {
            InstMode::Compatible => {
                prologue.push(Insn::PushStr(scope.signature.clone()));
                prologue.push(Insn::PushInt(count));
                prologue.push(Insn::Invoke(descriptors::OBJECT_COUNT.call(twin)));
            }
            InstMode::OptNormal => {
                let arr_local = editor.alloc_local();
                scope.arr_local = Some(arr_local);
                prologue.push(Insn::PushStr(scope.signature.clone()));
                prologue.push(Insn::PushInt(count));
                prologue.push(Insn::Invoke(descriptors::OBJECT_ARRAY.call(twin)));
                prologue.push(Insn::StoreLocal(arr_local));
            }
            InstMode::OptSequence => {
                prologue.push(Insn::PushStr(scope.signature.clone()));
                prologue.push(Insn::PushInt(count));
                prologue.push(Insn::Invoke(descriptors::SEQUENCE_ENTER.call(twin)));
            }
            InstMode::TraceHashing => {}
        }
        editor.insert_prologue(prologue);

        match self.options.object_type {
            ObjectType::Block => self.instrument_blocks(&mut editor, &mut scope)?,
            ObjectType::Branch => self.instrument_branches(&mut editor, &mut scope)?,
        }

        self.attach_summary_handler(&mut editor, &mut scope)?;
        if scope.used_suppress {
            // The dispatch chains read the flag, so give it a defined start.
            editor.insert_prologue(vec![
                Insn::PushInt(0),
                Insn::StoreLocal(scope.suppress_local),
            ]);
        }

        editor.assemble()
    }

    /// Packed-id validation up front, so a method either instruments fully
    /// or not at all.
    fn validate_ids(&self, signature: &str, cfg: &Cfg) -> Result<(), InstrumentError> {
        let wrap = |source| InstrumentError::IdOutOfRange {
            signature: signature.to_owned(),
            source,
        };
        match self.options.object_type {
            ObjectType::Block => {
                for block in &cfg.blocks {
                    ObjectId::pack(block.block_type.code() as u32, block.id).map_err(wrap)?;
                }
            }
            ObjectType::Branch => {
                for edge in &cfg.edges {
                    for (kind, id) in &edge.branch_ids {
                        ObjectId::pack(kind.code() as u32, *id).map_err(wrap)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The mode-specific commit sequence for one witnessed entity.
    fn commit_insns(
        &mut self,
        scope: &Scope<'_>,
        type_tag: u32,
        id: u32,
        witness: u8,
    ) -> Result<Vec<Insn>, InstrumentError> {
        let packed = ObjectId::pack(type_tag, id)
            .map_err(|source| InstrumentError::IdOutOfRange {
                signature: scope.signature.clone(),
                source,
            })?
            .raw() as i32;
        Ok(match self.options.mode {
            InstMode::Compatible => vec![
                Insn::PushInt(packed),
                Insn::PushStr(scope.signature.clone()),
                Insn::Invoke(descriptors::TRACE_EVENT.call(scope.twin)),
            ],
            InstMode::OptNormal => {
                let arr_local = scope.arr_local.ok_or_else(|| {
                    InstrumentError::Invariant("coverage array local was never reserved".into())
                })?;
                vec![
                    Insn::LoadLocal(arr_local),
                    Insn::PushInt((id - 1) as i32),
                    Insn::PushInt(witness as i32),
                    Insn::ByteStore,
                ]
            }
            InstMode::OptSequence => vec![
                Insn::PushInt(packed),
                Insn::Invoke(descriptors::SEQUENCE_APPEND.call(scope.twin)),
            ],
            InstMode::TraceHashing => {
                let index = self.hash_table.index_for(&scope.signature, id);
                vec![
                    Insn::PushInt(index as i32),
                    Insn::Invoke(descriptors::HASH_EVENT.call(scope.twin)),
                ]
            }
        })
    }

    fn exit_tracking(&self) -> bool {
        self.options.blocks.contains(BlockType::Exit) || self.options.mode == InstMode::OptSequence
    }

    // ----- block granularity -------------------------------------------------

    fn instrument_blocks(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
    ) -> Result<(), InstrumentError> {
        let mask = self.options.blocks;
        for bi in scope.cfg.blocks_in_id_order() {
            let block = scope.cfg.block(bi);
            match block.block_type {
                BlockType::Code => {
                    if mask.contains(BlockType::Code) {
                        let at = original_insn(editor, scope, block.start_offset)?;
                        let commit =
                            self.commit_insns(scope, BlockType::Code.code() as u32, block.id, BlockType::Code.code())?;
                        editor.insert_before(at, commit, true);
                    }
                    if block.subtype == BlockSubType::Throw && self.exit_tracking() {
                        self.block_throw_dispatch(editor, scope, bi)?;
                    }
                }
                BlockType::Entry => {
                    if mask.contains(BlockType::Entry) {
                        for &si in &block.successors {
                            let succ = scope.cfg.block(si);
                            let at = original_insn(editor, scope, succ.start_offset)?;
                            let commit = self.commit_insns(
                                scope,
                                BlockType::Entry.code() as u32,
                                block.id,
                                BlockType::Entry.code(),
                            )?;
                            // Entry probes never take over branch targeters:
                            // a jump to the successor is not a method entry.
                            editor.insert_before(at, commit, false);
                        }
                    }
                }
                BlockType::Exit => {
                    if block.subtype == BlockSubType::SummaryThrow {
                        // Handled by the whole-method summary wrapper.
                        continue;
                    }
                    if self.exit_tracking() {
                        for &pi in &block.predecessors {
                            let pred = scope.cfg.block(pi);
                            if matches!(
                                pred.subtype,
                                BlockSubType::Throw | BlockSubType::SummaryThrow
                            ) {
                                // Exceptional predecessors are covered by the
                                // throw dispatch and the summary wrapper.
                                continue;
                            }
                            if pred.block_type == BlockType::Call && pred.successors.len() >= 2 {
                                // The injected call handler marks these exits.
                                continue;
                            }
                            let at = original_insn(editor, scope, pred.end_offset)?;
                            let commit = self.commit_insns(
                                scope,
                                BlockType::Exit.code() as u32,
                                block.id,
                                BlockType::Exit.code(),
                            )?;
                            editor.insert_before(at, commit, true);
                        }
                    }
                }
                BlockType::Call => {
                    if mask.contains(BlockType::Call) {
                        let at = original_insn(editor, scope, block.start_offset)?;
                        let commit = self.commit_insns(
                            scope,
                            BlockType::Call.code() as u32,
                            block.id,
                            BlockType::Call.code(),
                        )?;
                        editor.insert_before(at, commit, true);
                    }
                    if self.exit_tracking() && block.successors.len() >= 2 {
                        let arms = self.block_call_arms(scope, bi)?;
                        if !arms.is_empty() {
                            let call = original_insn(editor, scope, block.end_offset)?;
                            self.attach_call_handler(editor, scope, call, arms)?;
                        }
                    }
                }
                BlockType::Return => {
                    if mask.contains(BlockType::Return) {
                        let at = original_insn(editor, scope, block.end_offset)?;
                        let commit = self.commit_insns(
                            scope,
                            BlockType::Return.code() as u32,
                            block.id,
                            BlockType::Return.code(),
                        )?;
                        // Targeter updates stay off for return blocks: the
                        // probe marks resumption, not the jump target.
                        editor.insert_after(at, commit);
                    }
                }
            }
        }
        Ok(())
    }

    /// Arms for a precise throw site: each exceptional edge commits the exit
    /// block it reaches.
    fn block_throw_dispatch(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
        block_index: usize,
    ) -> Result<(), InstrumentError> {
        let block = scope.cfg.block(block_index);
        let mut arms = Vec::new();
        for edge in ordered_exceptional_edges(scope.cfg, block_index) {
            let target = scope.cfg.block(edge.to_block);
            let commit = self.commit_insns(
                scope,
                target.block_type.code() as u32,
                target.id,
                target.block_type.code(),
            )?;
            arms.push(DispatchArm {
                exc_type: exception_type_of(&edge.label()),
                commit,
                suppress: Some(SUMMARY_EXIT_FLAG),
            });
        }
        if arms.is_empty() {
            return Ok(());
        }
        let throw_at = original_insn(editor, scope, block.end_offset)?;
        self.insert_throw_dispatch(editor, scope, throw_at, arms)
    }

    fn block_call_arms(
        &mut self,
        scope: &mut Scope<'_>,
        block_index: usize,
    ) -> Result<Vec<DispatchArm>, InstrumentError> {
        let mut arms = Vec::new();
        for edge in ordered_exceptional_edges(scope.cfg, block_index) {
            let target = scope.cfg.block(edge.to_block);
            let commit = self.commit_insns(
                scope,
                target.block_type.code() as u32,
                target.id,
                target.block_type.code(),
            )?;
            arms.push(DispatchArm {
                exc_type: exception_type_of(&edge.label()),
                commit,
                suppress: Some(EXC_EXIT_CALL_FLAG),
            });
        }
        Ok(arms)
    }

    // ----- branch granularity ------------------------------------------------

    fn instrument_branches(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
    ) -> Result<(), InstrumentError> {
        let mask = self.options.branches;
        for bi in scope.cfg.blocks_in_id_order() {
            let block = scope.cfg.block(bi);
            if block.block_type == BlockType::Entry {
                if mask.contains(BranchType::Entry) {
                    self.branch_entry_probe(editor, scope, bi)?;
                }
                continue;
            }
            if block.block_type == BlockType::Call {
                if mask.contains(BranchType::Call) {
                    self.branch_call_probes(editor, scope, bi)?;
                }
                continue;
            }
            match block.subtype {
                BlockSubType::If => {
                    if mask.contains(BranchType::If) {
                        self.branch_if_probe(editor, scope, bi)?;
                    }
                }
                BlockSubType::Switch => {
                    if mask.contains(BranchType::Switch) {
                        self.branch_switch_probe(editor, scope, bi)?;
                    }
                }
                BlockSubType::Throw => {
                    if mask.contains(BranchType::Throw) && block.successors.len() > 1 {
                        self.branch_throw_dispatch(editor, scope, bi)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Unary probe on the entry edge, placed at the first successor's start.
    fn branch_entry_probe(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
        block_index: usize,
    ) -> Result<(), InstrumentError> {
        let block = scope.cfg.block(block_index);
        let Some(&si) = block.successors.first() else {
            return Ok(());
        };
        let succ = scope.cfg.block(si);
        let Some(edge) = scope.cfg.edge_between(block_index, si) else {
            return Ok(());
        };
        let Some(id) = edge.branch_id(BranchType::Entry) else {
            return Ok(());
        };
        let at = original_insn(editor, scope, succ.start_offset)?;
        let commit = self.commit_insns(scope, BranchType::Entry.code() as u32, id, BranchType::Entry.code())?;
        editor.insert_before(at, commit, false);
        Ok(())
    }

    /// Multi-target probe on an if: each outcome runs through a patch that
    /// commits its edge id and then jumps to the outcome's real target.
    fn branch_if_probe(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
        block_index: usize,
    ) -> Result<(), InstrumentError> {
        let block = scope.cfg.block(block_index);
        let if_at = original_insn(editor, scope, block.end_offset)?;
        let Insn::Branch { target, .. } = editor.insn(if_at).clone() else {
            return Err(InstrumentError::Invariant(format!(
                "if block {} does not end in a conditional branch",
                block.id
            )));
        };

        let mut taken_id = None;
        let mut fall_id = None;
        for edge in scope.cfg.edges_from(block_index) {
            match edge.label() {
                EdgeLabel::IfTrue => taken_id = edge.branch_id(BranchType::If),
                EdgeLabel::IfFalse => fall_id = edge.branch_id(BranchType::If),
                _ => {}
            }
        }

        let resume = editor.following(if_at).ok_or_else(|| {
            InstrumentError::Invariant("conditional branch at the end of the body".into())
        })?;

        if let Some(id) = taken_id {
            let mut patch =
                self.commit_insns(scope, BranchType::If.code() as u32, id, BranchType::If.code())?;
            patch.push(Insn::Goto(target));
            let ids = editor.insert_after(if_at, patch);
            editor.retarget_branch(if_at, target, ids[0]);
        }
        if let Some(id) = fall_id {
            let mut patch =
                self.commit_insns(scope, BranchType::If.code() as u32, id, BranchType::If.code())?;
            patch.push(Insn::Goto(resume));
            // Lands between the branch and the taken patch, so fall-through
            // execution runs it naturally.
            editor.insert_after(if_at, patch);
        }
        Ok(())
    }

    /// Multi-target probe on a switch: the match table and default target are
    /// copied exactly; each outcome detours through its own patch.
    fn branch_switch_probe(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
        block_index: usize,
    ) -> Result<(), InstrumentError> {
        let block = scope.cfg.block(block_index);
        let sw_at = original_insn(editor, scope, block.end_offset)?;
        let Insn::Switch { cases, default } = editor.insn(sw_at).clone() else {
            return Err(InstrumentError::Invariant(format!(
                "switch block {} does not end in a switch",
                block.id
            )));
        };

        for (i, (value, case_target)) in cases.iter().enumerate() {
            let id = scope
                .cfg
                .edges_from(block_index)
                .find(|e| e.label() == EdgeLabel::Case(*value))
                .and_then(|e| e.branch_id(BranchType::Switch));
            if let Some(id) = id {
                let mut patch = self.commit_insns(
                    scope,
                    BranchType::Switch.code() as u32,
                    id,
                    BranchType::Switch.code(),
                )?;
                patch.push(Insn::Goto(*case_target));
                let ids = editor.insert_after(sw_at, patch);
                editor.set_case_target(sw_at, Some(i), ids[0]);
            }
        }
        let default_id = scope
            .cfg
            .edges_from(block_index)
            .find(|e| e.label() == EdgeLabel::Default)
            .and_then(|e| e.branch_id(BranchType::Switch));
        if let Some(id) = default_id {
            let mut patch = self.commit_insns(
                scope,
                BranchType::Switch.code() as u32,
                id,
                BranchType::Switch.code(),
            )?;
            patch.push(Insn::Goto(default));
            let ids = editor.insert_after(sw_at, patch);
            editor.set_case_target(sw_at, None, ids[0]);
        }
        Ok(())
    }

    fn branch_throw_dispatch(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
        block_index: usize,
    ) -> Result<(), InstrumentError> {
        let block = scope.cfg.block(block_index);
        let mut arms = Vec::new();
        for edge in ordered_exceptional_edges(scope.cfg, block_index) {
            let Some(id) = edge.branch_id(BranchType::Throw) else {
                continue;
            };
            let commit = self.commit_insns(
                scope,
                BranchType::Throw.code() as u32,
                id,
                BranchType::Throw.code(),
            )?;
            arms.push(DispatchArm {
                exc_type: exception_type_of(&edge.label()),
                commit,
                suppress: Some(SUMMARY_EXIT_FLAG),
            });
        }
        if arms.is_empty() {
            return Ok(());
        }
        let throw_at = original_insn(editor, scope, block.end_offset)?;
        self.insert_throw_dispatch(editor, scope, throw_at, arms)
    }

    /// Call blocks get the catch-all handler for their exception edges and a
    /// unary probe on the `<r>` edge right after the call returns.
    fn branch_call_probes(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
        block_index: usize,
    ) -> Result<(), InstrumentError> {
        let block = scope.cfg.block(block_index);
        let call_at = original_insn(editor, scope, block.end_offset)?;

        // Normal-return probe first, so the handler's resume point runs it.
        let r_id = scope
            .cfg
            .edges_from(block_index)
            .find(|e| e.label() == EdgeLabel::NormalReturn)
            .and_then(|e| e.branch_id(BranchType::Call));
        if let Some(id) = r_id {
            let commit = self.commit_insns(
                scope,
                BranchType::Call.code() as u32,
                id,
                BranchType::Call.code(),
            )?;
            editor.insert_after(call_at, commit);
        }

        let mut arms = Vec::new();
        for edge in ordered_exceptional_edges(scope.cfg, block_index) {
            let Some(id) = edge.branch_id(BranchType::Call) else {
                continue;
            };
            let commit = self.commit_insns(
                scope,
                BranchType::Call.code() as u32,
                id,
                BranchType::Call.code(),
            )?;
            arms.push(DispatchArm {
                exc_type: exception_type_of(&edge.label()),
                commit,
                suppress: Some(EXC_EXIT_CALL_FLAG),
            });
        }
        if !arms.is_empty() {
            self.attach_call_handler(editor, scope, call_at, arms)?;
        }
        Ok(())
    }

    // ----- shared dispatch construction --------------------------------------

    /// Build the type-test chain in front of a throw instruction. Built back
    /// to front so every forward target already exists; jumps to the throw
    /// are captured onto the chain head at the end.
    fn insert_throw_dispatch(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
        throw_at: InsnId,
        arms: Vec<DispatchArm>,
    ) -> Result<(), InstrumentError> {
        let reload = editor.insert_before(throw_at, vec![Insn::LoadLocal(scope.exc_local)], false)[0];
        let mut head = reload;
        for arm in arms.iter().rev() {
            let piece = self.arm_insns(scope, arm, head, reload);
            head = editor.insert_before(head, piece, false)[0];
        }
        let store = editor.insert_before(head, vec![Insn::StoreLocal(scope.exc_local)], false)[0];
        editor.capture_targeters(throw_at, store);
        Ok(())
    }

    /// Inline catch-all handler for a call: a goto hops over the handler on
    /// the normal path; the handler dispatches, then rethrows into whatever
    /// user handlers cover the call. The injected exception entry goes first
    /// so it binds before user-declared handlers.
    fn attach_call_handler(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
        call_at: InsnId,
        arms: Vec<DispatchArm>,
    ) -> Result<(), InstrumentError> {
        let over = editor.following(call_at).ok_or_else(|| {
            InstrumentError::Invariant("call instruction at the end of the body".into())
        })?;
        let goto_at = editor.insert_after(call_at, vec![Insn::Goto(over)])[0];
        let tail = editor.insert_after(
            goto_at,
            vec![Insn::LoadLocal(scope.exc_local), Insn::Throw],
        );
        let reload = tail[0];
        let mut head = reload;
        for arm in arms.iter().rev() {
            let piece = self.arm_insns(scope, arm, head, reload);
            head = editor.insert_after(goto_at, piece)[0];
        }
        let store = editor.insert_after(goto_at, vec![Insn::StoreLocal(scope.exc_local)])[0];
        editor.add_exception_first(ExceptionEntry {
            start: call_at,
            end: call_at,
            handler: store,
            catch_type: None,
        });
        Ok(())
    }

    fn arm_insns(
        &mut self,
        scope: &mut Scope<'_>,
        arm: &DispatchArm,
        fail_target: InsnId,
        commit_exit: InsnId,
    ) -> Vec<Insn> {
        let mut piece = Vec::new();
        if let Some(ty) = &arm.exc_type {
            piece.push(Insn::LoadLocal(scope.exc_local));
            piece.push(Insn::InstanceOf(ty.clone()));
            piece.push(Insn::Branch {
                kind: BranchKind::IfZero,
                target: fail_target,
            });
        }
        piece.extend(arm.commit.iter().cloned());
        if let Some(flag) = arm.suppress {
            scope.used_suppress = true;
            piece.push(Insn::PushInt(flag));
            piece.push(Insn::StoreLocal(scope.suppress_local));
        }
        piece.push(Insn::Goto(commit_exit));
        piece
    }

    /// Whole-method catch-all: reads the suppress flag and decides whether
    /// the summary exit is marked. Appended last so every user handler and
    /// injected call handler binds first; the handler body sits past the end
    /// of the watched region, so its rethrow leaves the method.
    fn attach_summary_handler(
        &mut self,
        editor: &mut MethodEditor,
        scope: &mut Scope<'_>,
    ) -> Result<(), InstrumentError> {
        let summary_commit = match self.options.object_type {
            ObjectType::Block => {
                if !self.exit_tracking() {
                    None
                } else {
                    match scope.cfg.summary_exit_block() {
                        Some(block) => Some(self.commit_insns(
                            scope,
                            BlockType::Exit.code() as u32,
                            block.id,
                            BlockType::Exit.code(),
                        )?),
                        None => None,
                    }
                }
            }
            ObjectType::Branch => {
                let enabled = self.options.branches.contains(BranchType::Summary)
                    || self.options.mode == InstMode::OptSequence;
                if !enabled {
                    None
                } else {
                    match scope.cfg.summary_branch_id() {
                        Some(id) => Some(self.commit_insns(
                            scope,
                            BranchType::Summary.code() as u32,
                            id,
                            BranchType::Summary.code(),
                        )?),
                        None => None,
                    }
                }
            }
        };

        let sequence_mode = self.options.mode == InstMode::OptSequence;
        let wanted = summary_commit.is_some() || (sequence_mode && scope.used_suppress);
        if !wanted {
            return Ok(());
        }
        let (Some(first), Some(last)) = (editor.first_original(), editor.last_original()) else {
            return Ok(());
        };

        let tail = editor.append(vec![Insn::LoadLocal(scope.exc_local), Insn::Throw]);
        let rethrow = tail[0];

        let mark_arm = |commit: &Option<Vec<Insn>>| -> Vec<Insn> {
            let mut arm = commit.clone().unwrap_or_default();
            arm.push(Insn::Goto(rethrow));
            arm
        };

        let arm0 = editor.append(mark_arm(&summary_commit))[0];
        let mut cases = vec![(0, arm0)];
        if sequence_mode {
            // Cases 1 and 2 exist only in sequence mode; everything else
            // falls to the default, which always rethrows.
            let arm1 = editor.append(mark_arm(&summary_commit))[0];
            let arm2 = editor.append(vec![
                Insn::Invoke(descriptors::SEQUENCE_EXIT.call(scope.twin)),
                Insn::Goto(rethrow),
            ])[0];
            cases.push((SUMMARY_EXIT_FLAG, arm1));
            cases.push((EXC_EXIT_CALL_FLAG, arm2));
        }

        let head = editor.append(vec![
            Insn::StoreLocal(scope.exc_local),
            Insn::LoadLocal(scope.suppress_local),
            Insn::Switch {
                cases,
                default: rethrow,
            },
        ]);
        editor.add_exception_last(ExceptionEntry {
            start: first,
            end: last,
            handler: head[0],
            catch_type: None,
        });
        // The wrapper reads the flag even when no dispatch chain wrote it.
        scope.used_suppress = true;
        Ok(())
    }
}

/// Rewrite a whole job: every unit against one CFG set. Per-unit failures
/// are logged and skipped; the job itself always completes.
pub fn instrument_units(
    units: &mut [Unit],
    cfgs: &CfgSet,
    options: InstrumentOptions,
) -> (JobReport, GlobalIndexTable) {
    let mut instrumentor = Instrumentor::new(cfgs, options);
    let mut report = JobReport::default();
    for unit in units.iter_mut() {
        match instrumentor.instrument_unit(unit) {
            Ok(unit_report) => {
                report.units_ok += 1;
                report.reports.push(unit_report);
            }
            Err(err) => {
                warn!("skipping unit {}: {err}", unit.name);
                report.units_failed += 1;
            }
        }
    }
    (report, instrumentor.into_hash_table())
}

/// Under self-instrumentation, existing probe invocations must go to the
/// twin copy so the probe cannot recurse into itself.
fn redirect_probe_calls_to_twin(unit: &mut Unit) {
    for method in &mut unit.methods {
        let Some(body) = method.body.as_mut() else {
            continue;
        };
        for insn in &mut body.insns {
            if let Insn::Invoke(call) = insn {
                if descriptors::is_probe_call(&call.target)
                    && !call.target.ends_with(descriptors::TWIN_SUFFIX)
                {
                    call.target = descriptors::twin_name(&call.target);
                }
            }
        }
    }
}

fn original_insn(
    editor: &MethodEditor,
    scope: &Scope<'_>,
    offset: usize,
) -> Result<InsnId, InstrumentError> {
    editor.original(offset).ok_or_else(|| {
        InstrumentError::Invariant(format!(
            "CFG offset {offset} outside the body of {}",
            scope.signature
        ))
    })
}

/// Exceptional edges of a block, ordered by label with catch-all edges last
/// so they cannot shadow a precise type test.
fn ordered_exceptional_edges(cfg: &Cfg, block_index: usize) -> Vec<&CfgEdge> {
    let mut edges: Vec<&CfgEdge> = cfg
        .edges_from(block_index)
        .filter(|e| e.label().is_exceptional())
        .collect();
    edges.sort_by_key(|e| (e.label() == EdgeLabel::AnyException, e.label.clone()));
    edges
}

fn exception_type_of(label: &EdgeLabel) -> Option<String> {
    match label {
        EdgeLabel::Exception(name) => Some(name.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::CfgBlock;
    use crate::unit::{Method, MethodAccess};
    use tracery_wire::MAX_ENTITY_ID;

    fn block(
        id: u32,
        block_type: BlockType,
        subtype: BlockSubType,
        span: (usize, usize),
        successors: Vec<usize>,
        predecessors: Vec<usize>,
    ) -> CfgBlock {
        CfgBlock {
            id,
            block_type,
            subtype,
            start_offset: span.0,
            end_offset: span.1,
            successors,
            predecessors,
        }
    }

    fn edge(from: usize, to: usize, label: &str, ids: Vec<(BranchType, u32)>) -> CfgEdge {
        CfgEdge {
            from_block: from,
            to_block: to,
            label: label.into(),
            branch_ids: ids,
        }
    }

    fn cfg_set(cfgs: Vec<Cfg>) -> CfgSet {
        let mut set = CfgSet::new();
        for cfg in cfgs {
            set.insert(cfg);
        }
        set
    }

    fn method(signature: &str, insns: Vec<Insn>, exceptions: Vec<ExceptionEntry>) -> Method {
        Method {
            signature: signature.into(),
            access: MethodAccess::default(),
            body: Some(MethodBody {
                insns,
                exceptions,
                max_locals: 0,
                max_stack: 0,
            }),
        }
    }

    fn unit_of(name: &str, methods: Vec<Method>) -> Unit {
        Unit {
            name: name.into(),
            kind: UnitKind::Class,
            methods,
        }
    }

    fn invoke_targets(body: &MethodBody) -> Vec<&str> {
        body.insns
            .iter()
            .filter_map(|i| match i {
                Insn::Invoke(c) => Some(c.target.as_str()),
                _ => None,
            })
            .collect()
    }

    const SIG: &str = "demo.Target.run()V";

    fn straight_line_cfg() -> Cfg {
        Cfg {
            signature: SIG.into(),
            highest_block_id: 5,
            blocks: vec![
                block(1, BlockType::Code, BlockSubType::Other, (0, 0), vec![1], vec![3]),
                block(2, BlockType::Code, BlockSubType::Other, (1, 1), vec![2], vec![0]),
                block(3, BlockType::Code, BlockSubType::Other, (2, 3), vec![4], vec![1]),
                block(4, BlockType::Entry, BlockSubType::Other, (0, 0), vec![0], vec![]),
                block(5, BlockType::Exit, BlockSubType::Other, (3, 3), vec![], vec![2]),
            ],
            edges: vec![],
        }
    }

    fn straight_line_method() -> Method {
        method(
            SIG,
            vec![
                Insn::Nop,
                Insn::Nop,
                Insn::Nop,
                Insn::Return { with_value: false },
            ],
            vec![],
        )
    }

    #[test]
    fn coverage_mode_marks_each_code_block() {
        let cfgs = cfg_set(vec![straight_line_cfg()]);
        let mut options = InstrumentOptions::new(InstMode::OptNormal, ObjectType::Block);
        options.blocks.insert(BlockType::Code);
        let mut unit = unit_of("demo.Target", vec![straight_line_method()]);
        let report = Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap();
        assert_eq!(report.methods_instrumented, 1);

        let body = unit.methods[0].body.as_ref().unwrap();
        assert_eq!(invoke_targets(body), vec!["tracery_probe_object_array"]);
        // One array store per code block, witness byte = the Code type code.
        let mut indices = Vec::new();
        for (i, insn) in body.insns.iter().enumerate() {
            if *insn == Insn::ByteStore {
                let Insn::PushInt(witness) = body.insns[i - 1] else {
                    panic!("no witness byte before store");
                };
                let Insn::PushInt(index) = body.insns[i - 2] else {
                    panic!("no index before store");
                };
                assert_eq!(witness, BlockType::Code.code() as i32);
                indices.push(index);
            }
        }
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(body.max_stack, 3);
        // Original instruction order survives.
        let nops = body.insns.iter().filter(|i| **i == Insn::Nop).count();
        assert_eq!(nops, 3);
        assert!(matches!(body.insns.last(), Some(Insn::Return { .. })));
    }

    #[test]
    fn empty_native_and_abstract_methods_are_identity() {
        let cfgs = cfg_set(vec![straight_line_cfg()]);
        let options = InstrumentOptions::new(InstMode::OptNormal, ObjectType::Block);
        let mut native = straight_line_method();
        native.access.is_native = true;
        let original = native.body.clone();
        let mut no_body = straight_line_method();
        no_body.body = None;
        let mut unit = unit_of("demo.Target", vec![native, no_body]);
        let report = Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap();
        assert_eq!(report.methods_instrumented, 0);
        assert_eq!(report.methods_skipped, 2);
        assert_eq!(unit.methods[0].body, original);
        assert!(unit.methods[1].body.is_none());
    }

    #[test]
    fn interfaces_are_rejected() {
        let cfgs = cfg_set(vec![]);
        let options = InstrumentOptions::new(InstMode::OptNormal, ObjectType::Block);
        let mut unit = unit_of("demo.Iface", vec![]);
        unit.kind = UnitKind::Interface;
        let err = Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap_err();
        assert!(matches!(err, InstrumentError::BadFileFormat { .. }));
    }

    #[test]
    fn missing_cfg_fails_the_unit() {
        let cfgs = cfg_set(vec![]);
        let options = InstrumentOptions::new(InstMode::OptNormal, ObjectType::Block);
        let mut unit = unit_of("demo.Target", vec![straight_line_method()]);
        let err = Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap_err();
        assert!(matches!(err, InstrumentError::MissingCfg { .. }));
    }

    #[test]
    fn oversized_block_id_is_rejected() {
        let mut cfg = straight_line_cfg();
        cfg.blocks[0].id = MAX_ENTITY_ID + 1;
        let cfgs = cfg_set(vec![cfg]);
        let mut options = InstrumentOptions::new(InstMode::OptNormal, ObjectType::Block);
        options.blocks.insert(BlockType::Code);
        let mut unit = unit_of("demo.Target", vec![straight_line_method()]);
        let err = Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap_err();
        assert!(matches!(err, InstrumentError::IdOutOfRange { .. }));
    }

    fn if_cfg() -> Cfg {
        Cfg {
            signature: SIG.into(),
            highest_block_id: 6,
            blocks: vec![
                block(6, BlockType::Entry, BlockSubType::Other, (0, 0), vec![1], vec![]),
                block(1, BlockType::Code, BlockSubType::If, (0, 1), vec![2, 3], vec![0]),
                block(2, BlockType::Code, BlockSubType::Other, (2, 3), vec![4], vec![1]),
                block(3, BlockType::Code, BlockSubType::Other, (4, 4), vec![4], vec![1]),
                block(4, BlockType::Code, BlockSubType::Other, (5, 6), vec![], vec![2, 3]),
            ],
            edges: vec![
                edge(1, 3, "t", vec![(BranchType::If, 1)]),
                edge(1, 2, "f", vec![(BranchType::If, 2)]),
            ],
        }
    }

    fn if_method() -> Method {
        method(
            SIG,
            vec![
                Insn::PushInt(1),
                Insn::Branch {
                    kind: BranchKind::IfNonZero,
                    target: InsnId(4),
                },
                Insn::PushInt(55),
                Insn::Goto(InsnId(5)),
                Insn::PushInt(77),
                Insn::Pop,
                Insn::Return { with_value: false },
            ],
            vec![],
        )
    }

    #[test]
    fn if_probe_patches_both_outcomes() {
        let cfgs = cfg_set(vec![if_cfg()]);
        let mut options = InstrumentOptions::new(InstMode::Compatible, ObjectType::Branch);
        options.branches.insert(BranchType::If);
        let mut unit = unit_of("demo.Target", vec![if_method()]);
        Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap();
        let body = unit.methods[0].body.as_ref().unwrap();

        let (branch_at, target) = body
            .insns
            .iter()
            .enumerate()
            .find_map(|(i, insn)| match insn {
                Insn::Branch { target, .. } => Some((i, target.0 as usize)),
                _ => None,
            })
            .unwrap();

        let packed_taken = ObjectId::pack(BranchType::If.code() as u32, 1).unwrap().raw() as i32;
        let packed_fall = ObjectId::pack(BranchType::If.code() as u32, 2).unwrap().raw() as i32;

        // Taken side: patch commits the true edge, then jumps to the real
        // target instruction.
        assert_eq!(body.insns[target], Insn::PushInt(packed_taken));
        let Insn::Goto(real) = &body.insns[target + 3] else {
            panic!("taken patch does not end in a goto");
        };
        assert_eq!(body.insns[real.0 as usize], Insn::PushInt(77));

        // Fall-through side: the next instruction after the branch commits
        // the false edge and jumps to the original fall-through.
        assert_eq!(body.insns[branch_at + 1], Insn::PushInt(packed_fall));
        let Insn::Goto(fall) = &body.insns[branch_at + 4] else {
            panic!("fall-through patch does not end in a goto");
        };
        assert_eq!(body.insns[fall.0 as usize], Insn::PushInt(55));
    }

    fn throw_cfg() -> Cfg {
        Cfg {
            signature: SIG.into(),
            highest_block_id: 9,
            blocks: vec![
                block(3, BlockType::Entry, BlockSubType::Other, (0, 0), vec![1], vec![]),
                block(1, BlockType::Code, BlockSubType::Throw, (0, 1), vec![2, 3], vec![0]),
                block(2, BlockType::Exit, BlockSubType::Other, (1, 1), vec![], vec![1]),
                block(9, BlockType::Exit, BlockSubType::SummaryThrow, (1, 1), vec![], vec![1]),
            ],
            edges: vec![edge(1, 2, "java.lang.ArithmeticException", vec![])],
        }
    }

    fn throw_method() -> Method {
        method(SIG, vec![Insn::PushStr("boom".into()), Insn::Throw], vec![])
    }

    #[test]
    fn throw_dispatch_tests_types_and_falls_back_to_rethrow() {
        let cfgs = cfg_set(vec![throw_cfg()]);
        let mut options = InstrumentOptions::new(InstMode::OptNormal, ObjectType::Block);
        options.blocks.insert(BlockType::Exit);
        let mut unit = unit_of("demo.Target", vec![throw_method()]);
        Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap();
        let body = unit.methods[0].body.as_ref().unwrap();

        // Exactly one type test, for the labelled edge.
        let instance_ofs: Vec<&str> = body
            .insns
            .iter()
            .filter_map(|i| match i {
                Insn::InstanceOf(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(instance_ofs, vec!["java.lang.ArithmeticException"]);

        // The matched arm stores the precise exit block (id 2 -> index 1)
        // with the Exit witness code and raises the suppress flag.
        let exit_witness = BlockType::Exit.code() as i32;
        let mut saw_precise = false;
        for (i, insn) in body.insns.iter().enumerate() {
            if *insn == Insn::ByteStore
                && body.insns[i - 1] == Insn::PushInt(exit_witness)
                && body.insns[i - 2] == Insn::PushInt(1)
            {
                saw_precise = true;
            }
        }
        assert!(saw_precise);

        // The summary wrapper is the only exception entry and catches all.
        assert_eq!(body.exceptions.len(), 1);
        let summary = &body.exceptions[0];
        assert!(summary.catch_type.is_none());
        assert!(matches!(
            body.insns[summary.handler.0 as usize],
            Insn::StoreLocal(_)
        ));
        // Its switch marks the summary exit block (id 9 -> index 8) on the
        // zero flag and rethrows by default.
        let mut saw_summary = false;
        for (i, insn) in body.insns.iter().enumerate() {
            if *insn == Insn::ByteStore && body.insns[i - 2] == Insn::PushInt(8) {
                saw_summary = true;
            }
        }
        assert!(saw_summary);
        let switch = body.insns.iter().find_map(|i| match i {
            Insn::Switch { cases, default } => Some((cases.clone(), *default)),
            _ => None,
        });
        let (cases, default) = switch.expect("summary wrapper has a switch");
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].0, 0);
        assert!(matches!(body.insns[default.0 as usize], Insn::LoadLocal(_)));
        assert!(matches!(
            body.insns[default.0 as usize + 1],
            Insn::Throw
        ));
    }

    fn call_cfg() -> Cfg {
        Cfg {
            signature: SIG.into(),
            highest_block_id: 9,
            blocks: vec![
                block(4, BlockType::Entry, BlockSubType::Other, (0, 0), vec![1], vec![]),
                block(1, BlockType::Call, BlockSubType::Other, (0, 0), vec![2, 3], vec![0]),
                block(2, BlockType::Return, BlockSubType::Other, (1, 2), vec![4], vec![1]),
                block(3, BlockType::Exit, BlockSubType::Other, (0, 0), vec![], vec![1]),
                block(9, BlockType::Exit, BlockSubType::SummaryThrow, (0, 0), vec![], vec![1]),
            ],
            edges: vec![
                edge(1, 2, "<r>", vec![(BranchType::Call, 1)]),
                edge(1, 3, "java.lang.Exception", vec![(BranchType::Call, 2)]),
            ],
        }
    }

    fn call_method() -> Method {
        let mut m = method(
            SIG,
            vec![
                Insn::Invoke(crate::ir::CallSite {
                    target: "demo.Helper.work".into(),
                    arg_count: 0,
                    returns_value: false,
                }),
                Insn::Nop,
                Insn::Return { with_value: false },
                Insn::StoreLocal(0),
                Insn::Return { with_value: false },
            ],
            vec![ExceptionEntry {
                start: InsnId(0),
                end: InsnId(1),
                handler: InsnId(3),
                catch_type: Some("java.lang.Exception".into()),
            }],
        );
        m.body.as_mut().unwrap().max_locals = 1;
        m
    }

    #[test]
    fn call_handler_binds_before_user_handlers() {
        let cfgs = cfg_set(vec![call_cfg()]);
        let mut options = InstrumentOptions::new(InstMode::OptNormal, ObjectType::Block);
        options.blocks.insert(BlockType::Exit);
        let mut unit = unit_of("demo.Target", vec![call_method()]);
        Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap();
        let body = unit.methods[0].body.as_ref().unwrap();

        assert_eq!(body.exceptions.len(), 3);
        let injected = &body.exceptions[0];
        let user = &body.exceptions[1];
        let summary = &body.exceptions[2];

        // Injected catch-all covers exactly the call instruction.
        assert!(injected.catch_type.is_none());
        assert_eq!(injected.start, injected.end);
        assert!(matches!(
            body.insns[injected.start.0 as usize],
            Insn::Invoke(_)
        ));
        // User handler survives with its original meaning and region bounds
        // on original instructions.
        assert_eq!(user.catch_type.as_deref(), Some("java.lang.Exception"));
        assert!(matches!(
            body.insns[user.handler.0 as usize],
            Insn::StoreLocal(_)
        ));
        // Summary wrapper binds last.
        assert!(summary.catch_type.is_none());
        assert!(summary.end.0 > summary.start.0);

        // The goto after the call hops over the handler body.
        let call_at = injected.start.0 as usize;
        assert!(matches!(body.insns[call_at + 1], Insn::Goto(_)));
    }

    #[test]
    fn sequence_mode_always_tracks_exits() {
        let cfg = Cfg {
            signature: SIG.into(),
            highest_block_id: 3,
            blocks: vec![
                block(2, BlockType::Entry, BlockSubType::Other, (0, 0), vec![1], vec![]),
                block(1, BlockType::Code, BlockSubType::Other, (0, 1), vec![2], vec![0]),
                block(3, BlockType::Exit, BlockSubType::Other, (1, 1), vec![], vec![1]),
            ],
            edges: vec![],
        };
        let cfgs = cfg_set(vec![cfg]);
        let options = InstrumentOptions::new(InstMode::OptSequence, ObjectType::Block);
        let mut unit = unit_of(
            "demo.Target",
            vec![method(
                SIG,
                vec![Insn::Nop, Insn::Return { with_value: false }],
                vec![],
            )],
        );
        Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap();
        let body = unit.methods[0].body.as_ref().unwrap();
        let targets = invoke_targets(body);
        assert_eq!(
            targets,
            vec!["tracery_probe_sequence_enter", "tracery_probe_sequence_append"]
        );
        // The exit commit runs before the return.
        let append_at = body
            .insns
            .iter()
            .position(|i| matches!(i, Insn::Invoke(c) if c.target == "tracery_probe_sequence_append"))
            .unwrap();
        assert!(matches!(
            body.insns[append_at + 1],
            Insn::Return { .. }
        ));
    }

    #[test]
    fn startup_call_prefers_the_class_initializer() {
        let clinit_sig = "demo.Target.<clinit>()V";
        let main_sig = "demo.Target.main([Ljava/lang/String;)V";
        let tiny = |sig: &str| Cfg {
            signature: sig.into(),
            highest_block_id: 1,
            blocks: vec![block(
                1,
                BlockType::Code,
                BlockSubType::Other,
                (0, 0),
                vec![],
                vec![],
            )],
            edges: vec![],
        };
        let cfgs = cfg_set(vec![tiny(clinit_sig), tiny(main_sig)]);
        let options = InstrumentOptions::new(InstMode::Compatible, ObjectType::Block);

        let mut clinit = method(clinit_sig, vec![Insn::Return { with_value: false }], vec![]);
        clinit.access.is_class_init = true;
        let mut main = method(main_sig, vec![Insn::Return { with_value: false }], vec![]);
        main.access.is_main = true;

        let mut unit = unit_of("demo.Target", vec![clinit, main]);
        Instrumentor::new(&cfgs, options.clone())
            .instrument_unit(&mut unit)
            .unwrap();
        let clinit_targets = invoke_targets(unit.methods[0].body.as_ref().unwrap());
        let main_targets = invoke_targets(unit.methods[1].body.as_ref().unwrap());
        assert_eq!(
            clinit_targets,
            vec!["tracery_probe_start", "tracery_probe_object_count"]
        );
        assert_eq!(main_targets, vec!["tracery_probe_object_count"]);

        // Without a class initializer the entry point takes over.
        let mut main_only = method(main_sig, vec![Insn::Return { with_value: false }], vec![]);
        main_only.access.is_main = true;
        let mut unit = unit_of("demo.Target", vec![main_only]);
        Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap();
        let targets = invoke_targets(unit.methods[0].body.as_ref().unwrap());
        assert_eq!(
            targets,
            vec!["tracery_probe_start", "tracery_probe_object_count"]
        );
    }

    #[test]
    fn probe_units_call_their_twin() {
        let sig = "tracery.probe.Connection.flush()V";
        let cfg = Cfg {
            signature: sig.into(),
            highest_block_id: 1,
            blocks: vec![block(
                1,
                BlockType::Code,
                BlockSubType::Other,
                (0, 0),
                vec![],
                vec![],
            )],
            edges: vec![],
        };
        let cfgs = cfg_set(vec![cfg]);
        let mut options = InstrumentOptions::new(InstMode::Compatible, ObjectType::Block);
        options.blocks.insert(BlockType::Code);
        let mut unit = unit_of(
            "tracery.probe",
            vec![method(
                sig,
                vec![
                    Insn::Invoke(crate::ir::CallSite {
                        target: "tracery_probe_trace_event".into(),
                        arg_count: 2,
                        returns_value: false,
                    }),
                    Insn::Return { with_value: false },
                ],
                vec![],
            )],
        );
        Instrumentor::new(&cfgs, options)
            .instrument_unit(&mut unit)
            .unwrap();
        let body = unit.methods[0].body.as_ref().unwrap();
        for target in invoke_targets(body) {
            assert!(
                target.ends_with(descriptors::TWIN_SUFFIX),
                "unrenamed probe call {target}"
            );
        }
    }

    #[test]
    fn global_index_table_is_lazy_and_stable() {
        let mut table = GlobalIndexTable::new();
        let a = table.index_for("demo.A.f()V", 1);
        let b = table.index_for("demo.A.f()V", 2);
        let a_again = table.index_for("demo.A.f()V", 1);
        let c = table.index_for("demo.B.g()V", 1);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(a_again, a);
        assert_eq!(c, 3);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn failed_unit_does_not_fail_the_job() {
        let cfgs = cfg_set(vec![straight_line_cfg()]);
        let mut options = InstrumentOptions::new(InstMode::OptNormal, ObjectType::Block);
        options.blocks.insert(BlockType::Code);
        let mut units = vec![
            unit_of("demo.Target", vec![straight_line_method()]),
            unit_of("demo.Orphan", vec![method("demo.Orphan.f()V", vec![Insn::Nop], vec![])]),
        ];
        let (report, _) = instrument_units(&mut units, &cfgs, options);
        assert_eq!(report.units_ok, 1);
        assert_eq!(report.units_failed, 1);
    }
}
