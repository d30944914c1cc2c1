//! Collect every move the allocator needs and insert them into the method.
//!
//! Moves are recorded between intervals, not registers, because they are collected before
//! register assignment is final (argument unsplitting and compaction both change registers). They
//! are only turned into register moves, one parallel group per gap position, by
//! [SpillMoveSet::insert_moves].

use super::{
    live_intervals::{IntervalArena, IntervalIdx},
    move_scheduler::{RegisterMove, RegisterMoveScheduler},
};
use crate::{
    errors::CompilationError,
    ir::{Inst, InstIdx, InstKind, Method, MoveTy},
};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

/// A transfer of one value from the interval `from` to the interval `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SpillMove {
    pub ty: MoveTy,
    pub from: IntervalIdx,
    pub to: IntervalIdx,
}

/// What [SpillMoveSet::insert_moves] inserted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InsertedMoves {
    pub spill_moves: u64,
    pub rematerializations: u64,
    /// The number of temporary registers needed, starting at the `temp_base` passed to
    /// [SpillMoveSet::insert_moves].
    pub temporaries: u32,
}

pub struct SpillMoveSet {
    moves: BTreeMap<u32, BTreeSet<SpillMove>>,
    /// The gaps immediately before each block's first instruction.
    block_entries: BTreeSet<u32>,
}

impl SpillMoveSet {
    pub fn new(m: &Method) -> Self {
        let block_entries = m
            .blocks
            .indices()
            .filter(|b| !m.blocks[*b].insts.is_empty())
            .map(|b| m.entry_number(b))
            .filter(|x| *x > 0)
            .map(|x| x - 1)
            .collect();
        Self {
            moves: BTreeMap::new(),
            block_entries,
        }
    }

    fn add(&mut self, gap: u32, from: IntervalIdx, to: IntervalIdx, ty: MoveTy) {
        debug_assert_eq!(gap % 2, 1);
        self.moves
            .entry(gap)
            .or_default()
            .insert(SpillMove { ty, from, to });
    }

    /// Add a move between two splits of the same value. Splits at a block entry are connected by
    /// control flow resolution instead.
    pub fn add_spill_or_restore_move(
        &mut self,
        gap: u32,
        from: IntervalIdx,
        to: IntervalIdx,
        ty: MoveTy,
    ) {
        if !self.block_entries.contains(&gap) {
            self.add(gap, from, to, ty);
        }
    }

    /// Add a move at the start of a block (or after its `move_exception`).
    pub fn add_in_resolution_move(
        &mut self,
        gap: u32,
        from: IntervalIdx,
        to: IntervalIdx,
        ty: MoveTy,
    ) {
        self.add(gap, from, to, ty);
    }

    /// Add a move before the `goto` ending a block.
    pub fn add_out_resolution_move(
        &mut self,
        gap: u32,
        from: IntervalIdx,
        to: IntervalIdx,
        ty: MoveTy,
    ) {
        self.add(gap, from, to, ty);
    }

    pub fn add_phi_move(&mut self, gap: u32, from: IntervalIdx, to: IntervalIdx, ty: MoveTy) {
        self.add(gap, from, to, ty);
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// The register moves at `gap` after pruning: chains of moves are collapsed to a move from
    /// the first interval, moves into rematerialisable intervals or into an argument's own
    /// register are dropped, and so are moves which don't change register.
    fn register_moves(
        &self,
        gap: u32,
        arena: &IntervalArena,
    ) -> Result<Vec<RegisterMove>, CompilationError> {
        let Some(moves) = self.moves.get(&gap) else {
            return Ok(Vec::new());
        };
        let sources = moves
            .iter()
            .map(|x| (x.to, x.from))
            .collect::<BTreeMap<_, _>>();
        let mut out = Vec::new();
        for mv in moves {
            let mut from = mv.from;
            let mut steps = 0;
            while let Some(prev) = sources.get(&from) {
                from = *prev;
                steps += 1;
                if steps > moves.len() {
                    return Err(CompilationError::InternalError(format!(
                        "Cyclic moves of {} at {gap}",
                        arena[from].value
                    )));
                }
            }
            let to = &arena[mv.to];
            let Some(dst) = to.register else {
                if to.is_rematerializable() {
                    continue;
                }
                return Err(CompilationError::InternalError(format!(
                    "Move of {} at {gap} into an interval without a register",
                    to.value
                )));
            };
            if to.is_argument && to.pinned {
                // The argument's own register is never given to anything else.
                continue;
            }
            let from = &arena[from];
            match (from.register, from.const_value) {
                (Some(src), _) => {
                    if src != dst {
                        out.push(RegisterMove::new(dst, src, mv.ty));
                    }
                }
                (None, Some(c)) if from.is_rematerializable() => {
                    out.push(RegisterMove::remat(dst, c, mv.ty))
                }
                _ => {
                    return Err(CompilationError::InternalError(format!(
                        "Move of {} at {gap} from an interval without a register",
                        from.value
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Insert the moves into `m`. Each gap's moves go immediately before the instruction after
    /// the gap and take the gap's number. Cycles are broken with temporaries numbered from
    /// `temp_base`.
    pub fn insert_moves(
        &self,
        m: &mut Method,
        arena: &IntervalArena,
        temp_base: u32,
    ) -> Result<InsertedMoves, CompilationError> {
        let by_number = m
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .map(|iidx| (m.insts[*iidx].number, *iidx))
            .collect::<BTreeMap<u32, InstIdx>>();
        let mut inserted = InsertedMoves::default();
        for gap in self.moves.keys() {
            let mut sched = RegisterMoveScheduler::new(temp_base);
            for mv in self.register_moves(*gap, arena)? {
                sched.add_move(mv);
            }
            let (kinds, temps) = sched.schedule();
            if kinds.is_empty() {
                continue;
            }
            inserted.temporaries = inserted.temporaries.max(temps);
            let Some(before) = by_number.get(&(gap + 1)) else {
                return Err(CompilationError::InternalError(format!(
                    "No instruction after gap {gap}"
                )));
            };
            let bidx = m.insts[*before].block;
            let Some(at) = m.blocks[bidx].insts.iter().position(|x| x == before) else {
                return Err(CompilationError::InternalError(format!(
                    "Instruction at {} is not in {bidx}",
                    gap + 1
                )));
            };
            for (i, kind) in kinds.into_iter().enumerate() {
                match kind {
                    InstKind::SpillMove { .. } => inserted.spill_moves += 1,
                    InstKind::Remat { .. } => inserted.rematerializations += 1,
                    _ => (),
                }
                let mut inst = Inst::new(kind, None, SmallVec::new());
                inst.block = bidx;
                inst.number = *gap;
                let iidx = m.insts.push(inst);
                m.blocks[bidx].insts.insert(at + i, iidx);
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ir::{parser::str_to_method, ValueIdx},
        regalloc::live_intervals::LiveRange,
    };

    #[test]
    fn insert() {
        let mut m = str_to_method(
            "
          bb0:
            %0: int = arg
            %1: int = const 7
            %2: int = add %0, %1
            goto bb1
          bb1:
            return %2
        ",
        );
        let mut a = IntervalArena::new(m.values.iter_enumerated().map(|(v, x)| (v, x.ty)));
        let (i0, i1, i2) = (
            a.for_value(ValueIdx::new(0)),
            a.for_value(ValueIdx::new(1)),
            a.for_value(ValueIdx::new(2)),
        );
        a[i0].add_range(LiveRange::new(0, 5));
        a[i1].add_range(LiveRange::new(2, 5));
        a[i1].const_value = Some(7);
        a[i2].add_range(LiveRange::new(4, 9));
        let c0 = a.split_before(i0, 3);
        let c1 = a.split_before(i1, 3);
        let c2 = a.split_before(i2, 5);
        let c3 = a.split_before(c2, 7);
        a[i0].register = Some(0);
        a[c0].register = Some(3);
        a[i1].spilled = true;
        a[c1].register = Some(1);
        a[i2].register = Some(2);
        a[c2].register = Some(4);
        a[c3].register = Some(2);

        let mut s = SpillMoveSet::new(&m);
        s.add_spill_or_restore_move(3, i0, c0, MoveTy::Single);
        s.add_spill_or_restore_move(3, i1, c1, MoveTy::Single);
        s.add_spill_or_restore_move(5, i2, c2, MoveTy::Single);
        s.add_out_resolution_move(5, c2, c3, MoveTy::Single);
        s.add_spill_or_restore_move(7, c2, c3, MoveTy::Single);
        let inserted = s.insert_moves(&mut m, &a, 5).unwrap();
        assert_eq!(
            inserted,
            InsertedMoves {
                spill_moves: 2,
                rematerializations: 1,
                temporaries: 0
            }
        );
        assert_eq!(
            m.to_string(),
            "bb0:
  %0: int = arg
  %1: int = const 7
  const r1, 7
  move r3, r0
  %2: int = add %0, %1
  move r4, r2
  goto bb1
bb1:
  return %2
"
        );
        m.remove_inserted_insts();
        assert_eq!(m.blocks[crate::ir::BlockIdx::new(0)].insts.len(), 4);
    }
}
