//! Method bodies and the splicing editor.
//!
//! A method body is a flat list of stack-machine instructions plus an
//! exception table. Branch targets in a stored body are instruction offsets;
//! inside the editor every instruction gets a stable id, so splicing never
//! invalidates a reference. `assemble` lays the final body out again,
//! renumbers every target, and recomputes the operand-stack bound.
//!
//! Targeter discipline: a branch that targeted an original instruction either
//! still targets it, or targets the first instruction of a probe inserted in
//! front of it — never the middle of a probe. Exception watched regions keep
//! their original start and end instructions; code spliced strictly between
//! them becomes covered, code outside never does.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::InstrumentError;

/// Stable reference to an instruction inside the editor. In a stored
/// [`MethodBody`], the value is the instruction's offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InsnId(pub u32);

/// A named call target with its stack shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub target: String,
    pub arg_count: u8,
    pub returns_value: bool,
}

/// Conditional branch condition over the popped integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchKind {
    IfZero,
    IfNonZero,
}

/// The instruction set the instrumentor understands and emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Insn {
    Nop,
    PushInt(i32),
    PushStr(String),
    LoadLocal(u16),
    StoreLocal(u16),
    Dup,
    Pop,
    /// Stores a byte: pops value, index, array reference.
    ByteStore,
    /// Pops a reference, pushes 1 if it is an instance of the named type.
    InstanceOf(String),
    Invoke(CallSite),
    Branch { kind: BranchKind, target: InsnId },
    Goto(InsnId),
    Switch {
        cases: Vec<(i32, InsnId)>,
        default: InsnId,
    },
    Return { with_value: bool },
    Throw,
}

impl Insn {
    /// (pops, pushes) on the operand stack.
    pub fn stack_effect(&self) -> (u16, u16) {
        match self {
            Insn::Nop => (0, 0),
            Insn::PushInt(_) | Insn::PushStr(_) | Insn::LoadLocal(_) => (0, 1),
            Insn::StoreLocal(_) | Insn::Pop => (1, 0),
            Insn::Dup => (1, 2),
            Insn::ByteStore => (3, 0),
            Insn::InstanceOf(_) => (1, 1),
            Insn::Invoke(call) => (call.arg_count as u16, call.returns_value as u16),
            Insn::Branch { .. } | Insn::Switch { .. } => (1, 0),
            Insn::Goto(_) => (0, 0),
            Insn::Return { with_value } => (*with_value as u16, 0),
            Insn::Throw => (1, 0),
        }
    }

    /// Every target reference held by this instruction.
    pub fn targets(&self) -> Vec<InsnId> {
        match self {
            Insn::Branch { target, .. } | Insn::Goto(target) => vec![*target],
            Insn::Switch { cases, default } => {
                let mut t: Vec<InsnId> = cases.iter().map(|(_, id)| *id).collect();
                t.push(*default);
                t
            }
            _ => Vec::new(),
        }
    }

    fn retarget(&mut self, from: InsnId, to: InsnId) {
        match self {
            Insn::Branch { target, .. } | Insn::Goto(target) => {
                if *target == from {
                    *target = to;
                }
            }
            Insn::Switch { cases, default } => {
                for (_, t) in cases.iter_mut() {
                    if *t == from {
                        *t = to;
                    }
                }
                if *default == from {
                    *default = to;
                }
            }
            _ => {}
        }
    }

}

/// One exception-table entry. `start` and `end` are the first and last
/// covered instructions (inclusive); `catch_type` of `None` catches anything.
/// Entries are matched in table order, first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub start: InsnId,
    pub end: InsnId,
    pub handler: InsnId,
    pub catch_type: Option<String>,
}

/// A stored method body. Targets and exception bounds are offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MethodBody {
    pub insns: Vec<Insn>,
    #[serde(default)]
    pub exceptions: Vec<ExceptionEntry>,
    #[serde(default)]
    pub max_locals: u16,
    #[serde(default)]
    pub max_stack: u16,
}

struct Node {
    id: InsnId,
    insn: Insn,
}

/// Splicing editor over one method body.
pub struct MethodEditor {
    nodes: Vec<Node>,
    exceptions: Vec<ExceptionEntry>,
    max_locals: u16,
    next_id: u32,
    /// Ids of the original instructions, in original order.
    original_count: u32,
    /// Ids inserted as part of the method-entry prologue; exception handlers
    /// must never point at these.
    prologue: HashSet<InsnId>,
}

impl MethodEditor {
    /// Build an editor over a stored body. Instruction ids are assigned so
    /// that original offset `k` becomes id `k`.
    pub fn from_body(body: &MethodBody) -> Result<Self, InstrumentError> {
        let count = body.insns.len() as u32;
        let in_range = |id: InsnId| -> Result<InsnId, InstrumentError> {
            if id.0 < count {
                Ok(id)
            } else {
                Err(InstrumentError::Invariant(format!(
                    "target offset {} outside body of {} instruction(s)",
                    id.0, count
                )))
            }
        };
        let nodes: Vec<Node> = body
            .insns
            .iter()
            .enumerate()
            .map(|(i, insn)| Node {
                id: InsnId(i as u32),
                insn: insn.clone(),
            })
            .collect();
        for node in &nodes {
            for t in node.insn.targets() {
                in_range(t)?;
            }
        }
        let mut exceptions = Vec::with_capacity(body.exceptions.len());
        for entry in &body.exceptions {
            exceptions.push(ExceptionEntry {
                start: in_range(entry.start)?,
                end: in_range(entry.end)?,
                handler: in_range(entry.handler)?,
                catch_type: entry.catch_type.clone(),
            });
        }
        Ok(MethodEditor {
            nodes,
            exceptions,
            max_locals: body.max_locals,
            next_id: count,
            original_count: count,
            prologue: HashSet::new(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Id of the first original instruction.
    pub fn first_original(&self) -> Option<InsnId> {
        (self.original_count > 0).then_some(InsnId(0))
    }

    /// Id of the original instruction at `offset`, if the body has one.
    pub fn original(&self, offset: usize) -> Option<InsnId> {
        (offset < self.original_count as usize).then_some(InsnId(offset as u32))
    }

    /// Redirect every branch, switch, and handler reference to `of` onto
    /// `to`. Exception region bounds are left alone.
    pub fn capture_targeters(&mut self, of: InsnId, to: InsnId) {
        for node in self.nodes.iter_mut() {
            node.insn.retarget(of, to);
        }
        for entry in self.exceptions.iter_mut() {
            if entry.handler == of {
                entry.handler = to;
            }
        }
    }

    /// Id of the last original instruction.
    pub fn last_original(&self) -> Option<InsnId> {
        (self.original_count > 0).then_some(InsnId(self.original_count - 1))
    }

    pub fn insn(&self, id: InsnId) -> &Insn {
        &self.nodes[self.position(id)].insn
    }

    /// Reserve one more local slot and return its index.
    pub fn alloc_local(&mut self) -> u16 {
        let slot = self.max_locals;
        self.max_locals += 1;
        slot
    }

    fn position(&self, id: InsnId) -> usize {
        self.nodes
            .iter()
            .position(|n| n.id == id)
            .unwrap_or_else(|| panic!("unknown instruction id {}", id.0))
    }

    fn fresh_ids(&mut self, count: usize) -> Vec<InsnId> {
        let ids: Vec<InsnId> = (0..count as u32).map(|k| InsnId(self.next_id + k)).collect();
        self.next_id += count as u32;
        ids
    }

    /// Insert `seq` immediately before `anchor`. With `capture_targeters`,
    /// every branch, switch, and handler reference to `anchor` is redirected
    /// to the first inserted instruction, so jumps to the anchor execute the
    /// probe first. Exception region bounds are never redirected.
    pub fn insert_before(
        &mut self,
        anchor: InsnId,
        seq: Vec<Insn>,
        capture_targeters: bool,
    ) -> Vec<InsnId> {
        if seq.is_empty() {
            return Vec::new();
        }
        let at = self.position(anchor);
        let ids = self.fresh_ids(seq.len());
        if capture_targeters {
            self.capture_targeters(anchor, ids[0]);
        }
        let nodes: Vec<Node> = ids
            .iter()
            .zip(seq)
            .map(|(id, insn)| Node { id: *id, insn })
            .collect();
        self.nodes.splice(at..at, nodes);
        ids
    }

    /// Insert `seq` immediately after `anchor`.
    pub fn insert_after(&mut self, anchor: InsnId, seq: Vec<Insn>) -> Vec<InsnId> {
        if seq.is_empty() {
            return Vec::new();
        }
        let at = self.position(anchor) + 1;
        let ids = self.fresh_ids(seq.len());
        let nodes: Vec<Node> = ids
            .iter()
            .zip(seq)
            .map(|(id, insn)| Node { id: *id, insn })
            .collect();
        self.nodes.splice(at..at, nodes);
        ids
    }

    /// Insert the method-entry prologue at the very top. Prologue
    /// instructions are recorded so `assemble` can reject handler references
    /// into them.
    pub fn insert_prologue(&mut self, seq: Vec<Insn>) -> Vec<InsnId> {
        if seq.is_empty() {
            return Vec::new();
        }
        let ids = self.fresh_ids(seq.len());
        let nodes: Vec<Node> = ids
            .iter()
            .zip(seq)
            .map(|(id, insn)| Node { id: *id, insn })
            .collect();
        // Later prologue fragments land after earlier ones but before the
        // first original instruction.
        let at = self
            .nodes
            .iter()
            .position(|n| !self.prologue.contains(&n.id))
            .unwrap_or(self.nodes.len());
        self.nodes.splice(at..at, nodes);
        self.prologue.extend(ids.iter().copied());
        ids
    }

    /// Append `seq` after the last instruction.
    pub fn append(&mut self, seq: Vec<Insn>) -> Vec<InsnId> {
        let ids = self.fresh_ids(seq.len());
        let nodes: Vec<Node> = ids
            .iter()
            .zip(seq)
            .map(|(id, insn)| Node { id: *id, insn })
            .collect();
        self.nodes.extend(nodes);
        ids
    }

    /// Redirect one specific target of one instruction.
    pub fn retarget_branch(&mut self, of: InsnId, from: InsnId, to: InsnId) {
        let at = self.position(of);
        self.nodes[at].insn.retarget(from, to);
    }

    /// Redirect exactly one switch case (`None` for the default target).
    /// Distinct cases sharing a target stay independent this way.
    pub fn set_case_target(&mut self, of: InsnId, case_index: Option<usize>, to: InsnId) {
        let at = self.position(of);
        if let Insn::Switch { cases, default } = &mut self.nodes[at].insn {
            match case_index {
                Some(i) => cases[i].1 = to,
                None => *default = to,
            }
        } else {
            panic!("set_case_target on a non-switch instruction");
        }
    }

    /// The instruction currently laid out right after `id`, if any.
    pub fn following(&self, id: InsnId) -> Option<InsnId> {
        let at = self.position(id);
        self.nodes.get(at + 1).map(|n| n.id)
    }

    /// Add an exception entry that binds before all existing ones.
    pub fn add_exception_first(&mut self, entry: ExceptionEntry) {
        self.exceptions.insert(0, entry);
    }

    /// Add an exception entry that binds after all existing ones.
    pub fn add_exception_last(&mut self, entry: ExceptionEntry) {
        self.exceptions.push(entry);
    }

    pub fn exceptions(&self) -> &[ExceptionEntry] {
        &self.exceptions
    }

    /// Lay out the final body: renumber offsets, rewrite every target and
    /// exception bound, and recompute the operand-stack bound.
    pub fn assemble(self) -> Result<MethodBody, InstrumentError> {
        let mut offset_of: HashMap<InsnId, u32> = HashMap::with_capacity(self.nodes.len());
        for (i, node) in self.nodes.iter().enumerate() {
            offset_of.insert(node.id, i as u32);
        }
        let map = |id: InsnId| -> Result<InsnId, InstrumentError> {
            offset_of.get(&id).copied().map(InsnId).ok_or_else(|| {
                InstrumentError::Invariant(format!("dangling instruction reference {}", id.0))
            })
        };

        for entry in &self.exceptions {
            if self.prologue.contains(&entry.handler) {
                return Err(InstrumentError::Invariant(
                    "exception handler points into the method-entry prologue".into(),
                ));
            }
        }

        let mut insns = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut insn = node.insn.clone();
            match &mut insn {
                Insn::Branch { target, .. } | Insn::Goto(target) => *target = map(*target)?,
                Insn::Switch { cases, default } => {
                    for (_, t) in cases.iter_mut() {
                        *t = map(*t)?;
                    }
                    *default = map(*default)?;
                }
                _ => {}
            }
            insns.push(insn);
        }

        let mut exceptions = Vec::with_capacity(self.exceptions.len());
        for entry in &self.exceptions {
            let start = map(entry.start)?;
            let end = map(entry.end)?;
            if start.0 > end.0 {
                return Err(InstrumentError::Invariant(
                    "exception region start is after its end".into(),
                ));
            }
            exceptions.push(ExceptionEntry {
                start,
                end,
                handler: map(entry.handler)?,
                catch_type: entry.catch_type.clone(),
            });
        }

        let max_stack = compute_max_stack(&insns, &exceptions)?;
        Ok(MethodBody {
            insns,
            exceptions,
            max_locals: self.max_locals,
            max_stack,
        })
    }
}

/// Propagate operand-stack depths along the successor relation, seeding the
/// entry point at depth 0 and every handler at depth 1 (the caught
/// exception). Depth disagreements at a join take the larger value, which
/// keeps the result a safe upper bound.
fn compute_max_stack(
    insns: &[Insn],
    exceptions: &[ExceptionEntry],
) -> Result<u16, InstrumentError> {
    if insns.is_empty() {
        return Ok(0);
    }
    let mut depth_in: HashMap<usize, u16> = HashMap::new();
    let mut worklist: Vec<(usize, u16)> = vec![(0, 0)];
    for entry in exceptions {
        worklist.push((entry.handler.0 as usize, 1));
    }
    let mut max = 0u16;
    while let Some((at, depth)) = worklist.pop() {
        if at >= insns.len() {
            return Err(InstrumentError::Invariant(format!(
                "control flows past the end of the body at offset {at}"
            )));
        }
        match depth_in.get(&at) {
            Some(&seen) if seen >= depth => continue,
            _ => {
                depth_in.insert(at, depth);
            }
        }
        let insn = &insns[at];
        let (pops, pushes) = insn.stack_effect();
        if depth < pops {
            return Err(InstrumentError::Invariant(format!(
                "stack underflow at offset {at}: depth {depth}, pops {pops}"
            )));
        }
        let out = depth - pops + pushes;
        max = max.max(out).max(depth);
        match insn {
            Insn::Goto(t) => worklist.push((t.0 as usize, out)),
            Insn::Branch { target, .. } => {
                worklist.push((target.0 as usize, out));
                worklist.push((at + 1, out));
            }
            Insn::Switch { cases, default } => {
                for (_, t) in cases {
                    worklist.push((t.0 as usize, out));
                }
                worklist.push((default.0 as usize, out));
            }
            Insn::Return { .. } | Insn::Throw => {}
            _ => worklist.push((at + 1, out)),
        }
    }
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goto_body() -> MethodBody {
        // 0: push 1 ; 1: branch ifnz -> 3 ; 2: nop ; 3: return
        MethodBody {
            insns: vec![
                Insn::PushInt(1),
                Insn::Branch {
                    kind: BranchKind::IfNonZero,
                    target: InsnId(3),
                },
                Insn::Nop,
                Insn::Return { with_value: false },
            ],
            exceptions: vec![],
            max_locals: 1,
            max_stack: 1,
        }
    }

    #[test]
    fn capture_moves_branch_to_probe_start() {
        let mut editor = MethodEditor::from_body(&goto_body()).unwrap();
        let probe = vec![Insn::PushInt(7), Insn::Pop];
        editor.insert_before(InsnId(3), probe, true);
        let body = editor.assemble().unwrap();
        // The branch now lands on the first probe instruction, which falls
        // through to the original return.
        let target = match &body.insns[1] {
            Insn::Branch { target, .. } => target.0 as usize,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(body.insns[target], Insn::PushInt(7));
        assert_eq!(body.insns[target + 1], Insn::Pop);
        assert_eq!(body.insns[target + 2], Insn::Return { with_value: false });
    }

    #[test]
    fn no_capture_keeps_branch_on_original() {
        let mut editor = MethodEditor::from_body(&goto_body()).unwrap();
        editor.insert_before(InsnId(3), vec![Insn::Nop], false);
        let body = editor.assemble().unwrap();
        let target = match &body.insns[1] {
            Insn::Branch { target, .. } => target.0 as usize,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(body.insns[target], Insn::Return { with_value: false });
    }

    #[test]
    fn exception_region_is_never_widened() {
        let mut body = goto_body();
        body.exceptions.push(ExceptionEntry {
            start: InsnId(1),
            end: InsnId(2),
            handler: InsnId(3),
            catch_type: None,
        });
        let mut editor = MethodEditor::from_body(&body).unwrap();
        // Splice in front of the region start and after the region end.
        editor.insert_before(InsnId(1), vec![Insn::Nop, Insn::Nop], true);
        editor.insert_after(InsnId(2), vec![Insn::Nop]);
        let out = editor.assemble().unwrap();
        let entry = &out.exceptions[0];
        // Bounds still point at the original branch and nop.
        assert!(matches!(out.insns[entry.start.0 as usize], Insn::Branch { .. }));
        assert!(matches!(out.insns[entry.end.0 as usize], Insn::Nop));
        // Nothing inserted before the start is covered.
        assert_eq!(entry.start.0, 3);
    }

    #[test]
    fn handler_into_prologue_is_rejected() {
        let mut body = goto_body();
        body.exceptions.push(ExceptionEntry {
            start: InsnId(0),
            end: InsnId(2),
            handler: InsnId(3),
            catch_type: None,
        });
        let mut editor = MethodEditor::from_body(&body).unwrap();
        let ids = editor.insert_prologue(vec![Insn::Nop]);
        // Force the defect the assembler must catch.
        editor.exceptions[0].handler = ids[0];
        assert!(matches!(
            editor.assemble(),
            Err(InstrumentError::Invariant(_))
        ));
    }

    #[test]
    fn max_stack_counts_probe_arguments() {
        let body = MethodBody {
            insns: vec![
                Insn::PushStr("demo.A.f()V".into()),
                Insn::PushInt(3),
                Insn::Invoke(CallSite {
                    target: "probe".into(),
                    arg_count: 2,
                    returns_value: false,
                }),
                Insn::Return { with_value: false },
            ],
            exceptions: vec![],
            max_locals: 0,
            max_stack: 0,
        };
        let editor = MethodEditor::from_body(&body).unwrap();
        let out = editor.assemble().unwrap();
        assert_eq!(out.max_stack, 2);
    }

    #[test]
    fn handlers_seed_depth_one() {
        // handler at 2 does: store, return.
        let body = MethodBody {
            insns: vec![
                Insn::Nop,
                Insn::Return { with_value: false },
                Insn::StoreLocal(0),
                Insn::Return { with_value: false },
            ],
            exceptions: vec![ExceptionEntry {
                start: InsnId(0),
                end: InsnId(0),
                handler: InsnId(2),
                catch_type: None,
            }],
            max_locals: 1,
            max_stack: 0,
        };
        let editor = MethodEditor::from_body(&body).unwrap();
        let out = editor.assemble().unwrap();
        assert_eq!(out.max_stack, 1);
    }
}
