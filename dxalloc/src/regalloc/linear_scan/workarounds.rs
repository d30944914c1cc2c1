//! Registers some VMs mishandle. Each entry names a bug and, given the interval being allocated
//! and a candidate register, returns `true` if the candidate must not be used.

use super::{resolution::edge_source_position, scan::Scan};
use crate::{
    ir::{Inst, InstKind, Ty, ValueDef},
    regalloc::live_intervals::IntervalIdx,
};

pub(super) static WORKAROUNDS: &[(&str, fn(&Scan, IntervalIdx, u32) -> bool)] = &[
    ("overlapping long registers", overlapping_long_registers),
    ("cmp-long result overlap", cmp_long_overlap),
    ("non-object in receiver register", receiver_type),
    ("move-exception clobber", move_exception_clobber),
];

/// The instruction defining `cur`'s value, if `cur` starts at that definition.
fn defining_inst<'a>(s: &'a Scan<'_>, cur: IntervalIdx) -> Option<&'a Inst> {
    let iv = &s.arena[cur];
    if iv.split_parent() != cur {
        return None;
    }
    s.m.def_inst(iv.value)
}

/// Does the `w`-register run at `reg` share a register with whatever holds `v` at `pos`?
fn overlaps_value(s: &Scan, reg: u32, w: u32, v: crate::ir::ValueIdx, pos: u32) -> bool {
    let vw = s.m.values[v].ty.required_registers();
    matches!(s.register_at(v, pos), Some(r) if r < reg + w && reg < r + vw)
}

/// Older VMs corrupt wide arithmetic whose result partially overlaps a wide operand.
fn overlapping_long_registers(s: &Scan, cur: IntervalIdx, reg: u32) -> bool {
    if !s.config.has_overlapping_long_register_bug() || !s.arena[cur].ty.is_wide() {
        return false;
    }
    let Some(inst) = defining_inst(s, cur) else {
        return false;
    };
    if !matches!(
        inst.kind,
        InstKind::BinOp(_) | InstKind::BinOpLit(..) | InstKind::UnOp(_)
    ) {
        return false;
    }
    inst.ins.iter().any(|v| {
        s.m.values[*v].ty.is_wide()
            && matches!(s.register_at(*v, inst.number), Some(r) if r != reg && r.abs_diff(reg) == 1)
    })
}

/// Older VMs write a `cmp-long`'s result before reading both of its operands.
fn cmp_long_overlap(s: &Scan, cur: IntervalIdx, reg: u32) -> bool {
    if !s.config.has_cmp_long_overlap_bug() {
        return false;
    }
    let Some(inst) = defining_inst(s, cur) else {
        return false;
    };
    matches!(inst.kind, InstKind::Cmp)
        && inst
            .ins
            .iter()
            .any(|v| s.m.values[*v].ty.is_wide() && overlaps_value(s, reg, 1, *v, inst.number))
}

/// Some verifiers insist that the receiver's register only ever holds objects.
fn receiver_type(s: &Scan, cur: IntervalIdx, reg: u32) -> bool {
    if !s.config.has_receiver_type_verifier_bug() || s.arena[cur].ty == Ty::Object {
        return false;
    }
    let w = s.arena[cur].required_registers();
    matches!(s.receiver_register, Some(r) if reg <= r && r < reg + w)
}

/// A handler's `move_exception` writes its register before the moves for the exceptional edge
/// run, so it must not hold anything those moves read.
fn move_exception_clobber(s: &Scan, cur: IntervalIdx, reg: u32) -> bool {
    let Some(inst) = defining_inst(s, cur) else {
        return false;
    };
    if !matches!(inst.kind, InstKind::MoveException) {
        return false;
    }
    let b = inst.block;
    let w = s.arena[cur].required_registers();
    s.m.blocks[b].preds.iter().any(|pred| {
        let pos = edge_source_position(s.m, *pred, b);
        let phi_operands = s.m.blocks[b].phis.iter().filter_map(|phi| match &s.m.values[*phi].def {
            ValueDef::Phi { args, .. } => {
                args.iter().find(|(x, _)| x == pred).map(|(_, v)| *v)
            }
            ValueDef::Inst(_) => None,
        });
        s.liveness
            .live_in(b)
            .chain(phi_operands)
            .any(|v| overlaps_value(s, reg, w, v, pos))
    })
}

#[cfg(test)]
mod test {
    use super::{super::ArgumentReuseMode, *};
    use crate::{
        config::Config,
        ir::{parser::str_to_method, ValueIdx},
        regalloc::liveness::Liveness,
    };

    #[test]
    fn receiver() {
        let m = str_to_method(
            "
          bb0:
            %0: obj = arg this
            %1: int = arg
            %2: int = add %1, %1
            %3: obj = new_instance Foo
            return %2
        ",
        );
        let old = Config::new(21, false, true);
        let l = Liveness::compute(&m, &old).unwrap();
        let s = Scan::new(&m, &old, &l, ArgumentReuseMode::AllowArgumentReuseU4);
        let i2 = s.arena.for_value(ValueIdx::new(2));
        let i3 = s.arena.for_value(ValueIdx::new(3));
        assert!(receiver_type(&s, i2, 0));
        assert!(!receiver_type(&s, i2, 1));
        assert!(!receiver_type(&s, i3, 0));

        let new = Config::new(26, false, true);
        let s = Scan::new(&m, &new, &l, ArgumentReuseMode::AllowArgumentReuseU4);
        assert!(!receiver_type(&s, i2, 0));
    }

    #[test]
    fn long_overlap() {
        let m = str_to_method(
            "
          bb0:
            %0: long = arg
            %1: long = neg %0
            %2: int = cmp %1, %1
            return %2
        ",
        );
        let c = Config::new(19, false, true);
        let l = Liveness::compute(&m, &c).unwrap();
        let s = Scan::new(&m, &c, &l, ArgumentReuseMode::AllowArgumentReuseU4);
        // `%0` is pinned to r0 and r1.
        let i1 = s.arena.for_value(ValueIdx::new(1));
        assert!(overlapping_long_registers(&s, i1, 1));
        assert!(!overlapping_long_registers(&s, i1, 0));
        assert!(!overlapping_long_registers(&s, i1, 2));
        let i2 = s.arena.for_value(ValueIdx::new(2));
        // `%1` has no register yet.
        assert!(!cmp_long_overlap(&s, i2, 0));
    }
}
