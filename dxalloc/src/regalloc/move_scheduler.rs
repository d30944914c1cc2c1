//! Serialise a set of simultaneous register moves.
//!
//! All the moves at one gap position are semantically parallel: every source is read before any
//! destination is written. [RegisterMoveScheduler] orders them so that no move overwrites a
//! register a later move still needs to read, moving values to temporary registers to break
//! cycles.

use crate::ir::{InstKind, MoveTy};
use vob::Vob;

/// One move in a parallel group. A `src` of `None` means "materialise the constant `value`".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegisterMove {
    pub dst: u32,
    pub src: Option<u32>,
    pub ty: MoveTy,
    pub value: Option<i64>,
}

impl RegisterMove {
    pub fn new(dst: u32, src: u32, ty: MoveTy) -> Self {
        Self {
            dst,
            src: Some(src),
            ty,
            value: None,
        }
    }

    pub fn remat(dst: u32, value: i64, ty: MoveTy) -> Self {
        Self {
            dst,
            src: None,
            ty,
            value: Some(value),
        }
    }

    fn width(&self) -> u32 {
        self.ty.required_registers()
    }

    /// Does this move read any of the registers `reg..reg + width`?
    fn reads(&self, reg: u32, width: u32) -> bool {
        match self.src {
            Some(src) => src < reg + width && reg < src + self.width(),
            None => false,
        }
    }

    fn to_inst(self) -> InstKind {
        match (self.src, self.value) {
            (Some(src), _) => InstKind::SpillMove {
                ty: self.ty,
                dst: self.dst,
                src,
            },
            (None, value) => InstKind::Remat {
                ty: self.ty,
                dst: self.dst,
                value: value.unwrap_or(0),
            },
        }
    }
}

pub struct RegisterMoveScheduler {
    moves: Vec<RegisterMove>,
    /// The first register that is free for use as a temporary.
    temp_base: u32,
}

impl RegisterMoveScheduler {
    pub fn new(temp_base: u32) -> Self {
        Self {
            moves: Vec::new(),
            temp_base,
        }
    }

    pub fn add_move(&mut self, m: RegisterMove) {
        if m.src != Some(m.dst) && !self.moves.contains(&m) {
            self.moves.push(m);
        }
    }

    /// Return the serialised moves, and how many temporary registers they need.
    pub fn schedule(mut self) -> (Vec<InstKind>, u32) {
        // Sorting makes the output independent of the order moves were added in.
        self.moves.sort();
        let pending = &mut self.moves;
        let mut done = Vob::from_elem(false, pending.len());
        let mut out = Vec::with_capacity(pending.len());
        let mut temps = 0;

        loop {
            // A move can be emitted when no other unemitted move reads its destination, i.e.
            // when its destination has an "indegree" of zero.
            let mut progress = false;
            for i in 0..pending.len() {
                if done[i] {
                    continue;
                }
                let m = pending[i];
                let blocked = pending
                    .iter()
                    .enumerate()
                    .any(|(j, x)| j != i && !done[j] && x.reads(m.dst, m.width()));
                if !blocked {
                    out.push(m.to_inst());
                    done.set(i, true);
                    progress = true;
                }
            }
            if done.iter_unset_bits(..).next().is_none() {
                break;
            }
            if progress {
                continue;
            }

            // Every remaining move is blocked, so there is at least one cycle. Pick a move
            // (preferably one with a single register destination, so the temporary is narrow
            // more often) and save the value it would overwrite to a temporary.
            let unemitted = done.iter_unset_bits(..).collect::<Vec<_>>();
            let i = unemitted
                .iter()
                .cloned()
                .find(|i| pending[*i].ty != MoveTy::Wide)
                .unwrap_or(unemitted[0]);
            let dst = pending[i];
            let Some(blocker) = unemitted
                .iter()
                .cloned()
                .find(|j| *j != i && pending[*j].reads(dst.dst, dst.width()))
            else {
                unreachable!()
            };
            let RegisterMove {
                src: Some(src), ty, ..
            } = pending[blocker]
            else {
                unreachable!()
            };
            let temp = self.temp_base + temps;
            temps += ty.required_registers();
            out.push(InstKind::SpillMove { ty, dst: temp, src });
            for j in unemitted {
                if pending[j].src == Some(src) && pending[j].ty == ty {
                    pending[j].src = Some(temp);
                }
            }
        }
        (out, temps)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::MoveTy::{Object, Single, Wide};

    fn mv(ty: MoveTy, dst: u32, src: u32) -> InstKind {
        InstKind::SpillMove { ty, dst, src }
    }

    #[test]
    fn chain() {
        let mut s = RegisterMoveScheduler::new(10);
        s.add_move(RegisterMove::new(1, 0, Single));
        s.add_move(RegisterMove::new(2, 1, Object));
        s.add_move(RegisterMove::new(3, 3, Single));
        assert_eq!(
            s.schedule(),
            (vec![mv(Object, 2, 1), mv(Single, 1, 0)], 0)
        );
    }

    #[test]
    fn swap() {
        let mut s = RegisterMoveScheduler::new(2);
        s.add_move(RegisterMove::new(1, 0, Single));
        s.add_move(RegisterMove::new(0, 1, Single));
        assert_eq!(
            s.schedule(),
            (
                vec![mv(Single, 2, 0), mv(Single, 0, 1), mv(Single, 1, 2)],
                1
            )
        );
    }

    #[test]
    fn wide_cycle() {
        let mut s = RegisterMoveScheduler::new(4);
        s.add_move(RegisterMove::new(0, 2, Wide));
        s.add_move(RegisterMove::new(2, 0, Single));
        assert_eq!(
            s.schedule(),
            (
                vec![mv(Wide, 4, 2), mv(Single, 2, 0), mv(Wide, 0, 4)],
                2
            )
        );
    }

    #[test]
    fn fan_out_and_remat() {
        let mut s = RegisterMoveScheduler::new(3);
        s.add_move(RegisterMove::remat(0, 5, Single));
        s.add_move(RegisterMove::new(1, 0, Single));
        s.add_move(RegisterMove::new(2, 0, Single));
        assert_eq!(
            s.schedule(),
            (
                vec![
                    mv(Single, 1, 0),
                    mv(Single, 2, 0),
                    InstKind::Remat {
                        ty: Single,
                        dst: 0,
                        value: 5
                    }
                ],
                0
            )
        );
    }
}
