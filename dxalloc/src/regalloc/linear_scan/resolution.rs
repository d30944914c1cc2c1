//! Connect the pieces of each value once every interval has a register: a move wherever a value
//! changes split within a block, and moves on each control flow edge where a value (or a phi's
//! operand) is in a different place at the end of the predecessor than at the start of the
//! successor.

use crate::{
    errors::CompilationError,
    ir::{BlockIdx, InstKind, Method, ValueDef},
    regalloc::{live_intervals::IntervalArena, liveness::Liveness, spill_moves::SpillMoveSet},
};
use std::collections::HashMap;

pub(super) fn resolve(
    m: &Method,
    arena: &IntervalArena,
    liveness: &Liveness,
) -> Result<SpillMoveSet, CompilationError> {
    let mut moves = SpillMoveSet::new(m);
    split_moves(m, arena, liveness, &mut moves);
    for succ in m.blocks.indices() {
        for pred in &m.blocks[succ].preds {
            edge_moves(m, arena, liveness, *pred, succ, &mut moves)?;
        }
    }
    Ok(moves)
}

/// The position whose register state flows along the edge `pred -> succ`: the end of `pred` or,
/// for an exceptional edge, `pred`'s throwing instruction.
pub(super) fn edge_source_position(m: &Method, pred: BlockIdx, succ: BlockIdx) -> u32 {
    let b = &m.blocks[pred];
    if !b.succs.contains(&succ) {
        if let Some(n) = b
            .insts
            .iter()
            .map(|i| &m.insts[*i])
            .filter(|x| x.can_throw())
            .map(|x| x.number)
            .last()
        {
            return n;
        }
    }
    m.exit_number(pred)
}

fn is_handler(m: &Method, bidx: BlockIdx) -> bool {
    matches!(
        m.entry_inst(bidx).map(|x| &x.kind),
        Some(InstKind::MoveException)
    )
}

fn split_moves(m: &Method, arena: &IntervalArena, liveness: &Liveness, moves: &mut SpillMoveSet) {
    // Values live into a handler arrive in the gap after its `move_exception`: a split there is
    // already fed by the edge's moves.
    let handler_gaps = m
        .blocks
        .indices()
        .filter(|b| is_handler(m, *b) && m.blocks[*b].preds.len() == 1)
        .map(|b| (m.entry_number(b) + 1, b))
        .collect::<HashMap<_, _>>();
    for p in arena.parents() {
        let ty = arena[p].ty.move_ty();
        for pair in arena.sorted_splits(p).windows(2) {
            let gap = arena[pair[1]].start();
            if let Some(b) = handler_gaps.get(&gap) {
                if liveness.is_live_in(*b, arena[p].value) {
                    continue;
                }
            }
            moves.add_spill_or_restore_move(gap, pair[0], pair[1], ty);
        }
    }
}

fn edge_moves(
    m: &Method,
    arena: &IntervalArena,
    liveness: &Liveness,
    pred: BlockIdx,
    succ: BlockIdx,
    moves: &mut SpillMoveSet,
) -> Result<(), CompilationError> {
    let by_goto = m.blocks[pred].succs.contains(&succ)
        && matches!(m.exit_inst(pred).map(|x| &x.kind), Some(InstKind::Goto));
    let entry = m.entry_number(succ);
    let (gap, dest) = if by_goto {
        (m.exit_number(pred).saturating_sub(1), entry.saturating_sub(1))
    } else if m.blocks[succ].preds.len() == 1 {
        if is_handler(m, succ) {
            (entry + 1, entry + 1)
        } else {
            (entry.saturating_sub(1), entry.saturating_sub(1))
        }
    } else {
        return Err(CompilationError::InternalError(format!(
            "The edge {pred} -> {succ} is critical"
        )));
    };
    let src = edge_source_position(m, pred, succ);

    for v in liveness.live_in(succ) {
        let p = arena.for_value(v);
        let Some(from) = arena.split_live_at(p, src) else {
            return Err(CompilationError::InternalError(format!(
                "{v} is live into {succ} but not at the end of {pred}"
            )));
        };
        let Some(to) = arena.split_live_at(p, dest) else {
            continue;
        };
        if from != to {
            let ty = arena[p].ty.move_ty();
            if by_goto {
                moves.add_out_resolution_move(gap, from, to, ty);
            } else {
                moves.add_in_resolution_move(gap, from, to, ty);
            }
        }
    }

    for phi in &m.blocks[succ].phis {
        let ValueDef::Phi { args, .. } = &m.values[*phi].def else {
            continue;
        };
        for (_, v) in args.iter().filter(|(b, _)| *b == pred) {
            let Some(from) = arena.split_live_at(arena.for_value(*v), src) else {
                return Err(CompilationError::InternalError(format!(
                    "{v}, an operand of {phi}, is not live at the end of {pred}"
                )));
            };
            let Some(to) = arena.split_live_at(arena.for_value(*phi), dest) else {
                continue;
            };
            moves.add_phi_move(gap, from, to, m.values[*phi].ty.move_ty());
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::Config, ir::parser::str_to_method};

    #[test]
    fn throwing_position() {
        let m = str_to_method(
            "
          bb0 catch bb2:
            %0: obj = arg
            %1: int = iget %0, f
            if_eqz %1, bb1, bb3
          bb1:
            return %1
          bb2:
            %2: obj = move_exception
            throw %2
          bb3:
            return %1
        ",
        );
        assert_eq!(edge_source_position(&m, BlockIdx::new(0), BlockIdx::new(2)), 2);
        assert_eq!(edge_source_position(&m, BlockIdx::new(0), BlockIdx::new(1)), 4);
    }

    #[test]
    fn critical_edges_rejected() {
        let m = str_to_method(
            "
          bb0:
            %0: int = arg
            if_eqz %0, bb1, bb2
          bb1:
            goto bb2
          bb2:
            %1: int = phi [%0, bb0], [%0, bb1]
            return %1
        ",
        );
        let l = Liveness::compute(&m, &Config::default()).unwrap();
        let arena = l.build_intervals(&m);
        match resolve(&m, &arena, &l) {
            Err(CompilationError::InternalError(e)) => {
                assert_eq!(e, "The edge bb0 -> bb2 is critical")
            }
            Err(e) => panic!("{e}"),
            Ok(_) => panic!(),
        }
    }
}
