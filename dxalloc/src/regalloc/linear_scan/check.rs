//! Check an allocation from the outside: that no two overlapping values share a register, that
//! every register is within its limits, and that the allocated method, run on a register file,
//! computes what the SSA method does.

use super::LinearScanRegisterAllocator;
use crate::{
    ir::{BinOp, BlockIdx, IfCond, InstKind, Method, UnOp, ValueDef, ValueIdx},
    regalloc::RegisterAllocator,
};
use std::collections::HashMap;

pub(super) fn check_allocation(ra: &LinearScanRegisterAllocator, ssa: &Method, inputs: &[&[i64]]) {
    check_registers(ra);
    check_groups(ra);
    for args in inputs {
        let expected = run(ssa, &mut SsaFrame::new(ssa), args);
        let got = run(ra.method(), &mut RegisterFrame::new(ra), args);
        assert_eq!(expected, got, "with arguments {args:?}");
    }
}

fn check_registers(ra: &LinearScanRegisterAllocator) {
    let a = ra.allocation.as_ref().unwrap();
    let arena = &a.arena;
    let splits = arena
        .all_splits()
        .filter(|i| arena[*i].register.is_some() && !arena[*i].ranges().is_empty())
        .collect::<Vec<_>>();
    let reg = |i| a.map.final_register(arena[i].register.unwrap());
    for (k, x) in splits.iter().enumerate() {
        let (xi, rx) = (&arena[*x], reg(*x));
        let wx = xi.required_registers();
        assert!(
            rx + wx - 1 <= xi.register_limit(),
            "{xi} is in r{rx}, beyond its limit"
        );
        assert!(rx + wx <= ra.registers_used());
        for y in &splits[k + 1..] {
            let yi = &arena[*y];
            if yi.value == xi.value || !xi.overlaps(yi) {
                continue;
            }
            let (ry, wy) = (reg(*y), yi.required_registers());
            assert!(
                rx + wx <= ry || ry + wy <= rx,
                "{xi} (r{rx}) and {yi} (r{ry}) share a register"
            );
        }
    }
}

fn check_groups(ra: &LinearScanRegisterAllocator) {
    let m = ra.method();
    for b in &m.blocks {
        for iidx in &b.insts {
            let inst = &m.insts[*iidx];
            if !inst.is_range_invoke(m) {
                continue;
            }
            let n = inst.number;
            for pair in inst.ins.windows(2) {
                assert_eq!(
                    ra.register_for_value(pair[1], n),
                    ra.register_for_value(pair[0], n) + m.values[pair[0]].ty.required_registers()
                );
            }
        }
    }
}

/// Everything a run can observe.
#[derive(Debug, Default, PartialEq)]
struct Outcome {
    ret: Option<i64>,
    effects: Vec<String>,
}

/// Where values live while a method runs.
trait Frame {
    fn read(&self, v: ValueIdx, pos: u32) -> i64;
    fn write(&mut self, v: ValueIdx, pos: u32, x: i64);
    /// The argument `v` starts `offset` registers into the incoming arguments.
    fn arg(&mut self, v: ValueIdx, pos: u32, offset: u32, x: i64);
    fn enter(&mut self, pred: BlockIdx, b: BlockIdx);
    fn inserted(&mut self, kind: &InstKind);
}

struct SsaFrame<'a> {
    m: &'a Method,
    vals: HashMap<ValueIdx, i64>,
}

impl<'a> SsaFrame<'a> {
    fn new(m: &'a Method) -> Self {
        Self {
            m,
            vals: HashMap::new(),
        }
    }
}

impl Frame for SsaFrame<'_> {
    fn read(&self, v: ValueIdx, _: u32) -> i64 {
        match self.vals.get(&v) {
            Some(x) => *x,
            None => panic!("{v} read before it is defined"),
        }
    }

    fn write(&mut self, v: ValueIdx, _: u32, x: i64) {
        self.vals.insert(v, x);
    }

    fn arg(&mut self, v: ValueIdx, pos: u32, _: u32, x: i64) {
        self.write(v, pos, x);
    }

    fn enter(&mut self, pred: BlockIdx, b: BlockIdx) {
        let updates = self.m.blocks[b]
            .phis
            .iter()
            .map(|phi| match &self.m.values[*phi].def {
                ValueDef::Phi { args, .. } => {
                    let (_, v) = args.iter().find(|(p, _)| *p == pred).unwrap();
                    (*phi, self.read(*v, 0))
                }
                ValueDef::Inst(_) => panic!("{phi} is not a phi"),
            })
            .collect::<Vec<_>>();
        self.vals.extend(updates);
    }

    fn inserted(&mut self, kind: &InstKind) {
        panic!("{kind:?} in an unallocated method");
    }
}

/// Wide values are written as `x` in their first register and `!x` in their second, so that a
/// clobbered half is noticed when the value is read.
struct RegisterFrame<'a, 'b> {
    ra: &'a LinearScanRegisterAllocator<'b>,
    num_arg_registers: u32,
    regs: Vec<Option<i64>>,
}

impl<'a, 'b> RegisterFrame<'a, 'b> {
    fn new(ra: &'a LinearScanRegisterAllocator<'b>) -> Self {
        let m = ra.method();
        Self {
            ra,
            num_arg_registers: m.registers_for(&m.args()),
            regs: vec![None; ra.registers_used() as usize],
        }
    }

    fn is_wide(&self, v: ValueIdx) -> bool {
        self.ra.method().values[v].ty.is_wide()
    }

    fn set(&mut self, r: u32, wide: bool, x: i64) {
        self.regs[r as usize] = Some(x);
        if wide {
            self.regs[r as usize + 1] = Some(!x);
        }
    }
}

impl Frame for RegisterFrame<'_, '_> {
    fn read(&self, v: ValueIdx, pos: u32) -> i64 {
        let r = self.ra.register_for_value(v, pos) as usize;
        let Some(x) = self.regs[r] else {
            panic!("{v} read from r{r} at {pos}, which holds nothing");
        };
        if self.is_wide(v) {
            assert_eq!(
                self.regs[r + 1],
                Some(!x),
                "the high half of {v} in r{r} was clobbered before {pos}"
            );
        }
        x
    }

    fn write(&mut self, v: ValueIdx, pos: u32, x: i64) {
        let r = self.ra.register_for_value(v, pos);
        self.set(r, self.is_wide(v), x);
    }

    fn arg(&mut self, v: ValueIdx, pos: u32, offset: u32, x: i64) {
        // The caller puts the arguments in the last registers of the frame.
        let r = self.ra.registers_used() - self.num_arg_registers + offset;
        assert_eq!(self.ra.register_for_value(v, pos), r);
        self.set(r, self.is_wide(v), x);
    }

    fn enter(&mut self, _: BlockIdx, _: BlockIdx) {}

    fn inserted(&mut self, kind: &InstKind) {
        match kind {
            InstKind::SpillMove { ty, dst, src } => {
                let w = ty.required_registers() as usize;
                let (dst, src) = (*dst as usize, *src as usize);
                let vals = self.regs[src..src + w].to_vec();
                self.regs[dst..dst + w].copy_from_slice(&vals);
            }
            InstKind::Remat { ty, dst, value } => {
                self.set(*dst, ty.required_registers() == 2, *value)
            }
            _ => unreachable!(),
        }
    }
}

/// A deterministic stand-in for whatever a field, method, or array slot yields.
fn mix(name: &str, xs: &[i64]) -> i64 {
    xs.iter().fold(name.len() as i64 * 31, |acc, x| {
        acc.wrapping_mul(17).wrapping_add(*x)
    })
}

fn binop(op: BinOp, a: i64, b: i64) -> i64 {
    match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => a.checked_div(b).unwrap_or(0),
        BinOp::Rem => a.checked_rem(b).unwrap_or(0),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(b as u32),
        BinOp::Shr => a.wrapping_shr(b as u32),
        BinOp::Ushr => ((a as u64).wrapping_shr(b as u32)) as i64,
    }
}

fn taken(cond: IfCond, a: i64, b: i64) -> bool {
    match cond {
        IfCond::Eq => a == b,
        IfCond::Ne => a != b,
        IfCond::Lt => a < b,
        IfCond::Ge => a >= b,
        IfCond::Gt => a > b,
        IfCond::Le => a <= b,
    }
}

fn run<F: Frame>(m: &Method, f: &mut F, args: &[i64]) -> Outcome {
    let mut out = Outcome::default();
    let mut heap = HashMap::new();
    let mut next_object = 1000;
    let (mut arg_i, mut arg_reg) = (0, 0);
    let mut steps = 0;
    let mut b = BlockIdx::new(0);
    let mut pred = None;
    'blocks: loop {
        if let Some(p) = pred {
            f.enter(p, b);
        }
        for iidx in &m.blocks[b].insts {
            steps += 1;
            assert!(steps < 100_000, "ran for too long");
            let inst = &m.insts[*iidx];
            let n = inst.number;
            let ins = inst.ins.iter().map(|v| f.read(*v, n)).collect::<Vec<_>>();
            let succ = |i: usize| m.blocks[b].succs[i];
            let res = match &inst.kind {
                InstKind::Arg { .. } => {
                    if let Some(v) = inst.out {
                        f.arg(v, n, arg_reg, args[arg_i]);
                        arg_reg += m.values[v].ty.required_registers();
                    }
                    arg_i += 1;
                    None
                }
                InstKind::MoveException => Some(0),
                InstKind::Const(c) => Some(*c),
                InstKind::Move => Some(ins[0]),
                InstKind::BinOp(op) => Some(binop(*op, ins[0], ins[1])),
                InstKind::BinOpLit(op, lit) => Some(binop(*op, ins[0], i64::from(*lit))),
                InstKind::UnOp(UnOp::Neg) => Some(ins[0].wrapping_neg()),
                InstKind::UnOp(UnOp::Not) => Some(!ins[0]),
                InstKind::UnOp(UnOp::Conv) => Some(ins[0]),
                InstKind::Cmp => Some(ins[0].cmp(&ins[1]) as i64),
                InstKind::If(cond) => {
                    let rhs = ins.get(1).copied().unwrap_or(0);
                    let next = succ(if taken(*cond, ins[0], rhs) { 0 } else { 1 });
                    pred = Some(b);
                    b = next;
                    continue 'blocks;
                }
                InstKind::Goto => {
                    let next = succ(0);
                    pred = Some(b);
                    b = next;
                    continue 'blocks;
                }
                InstKind::Return => {
                    out.ret = ins.first().copied();
                    return out;
                }
                InstKind::Throw => {
                    out.effects.push(format!("throw {}", ins[0]));
                    return out;
                }
                InstKind::Invoke { target, .. } => {
                    out.effects.push(format!("{target}{ins:?}"));
                    Some(mix(target, &ins))
                }
                InstKind::InstanceGet(field) => Some(
                    heap.get(&(format!("{}.{field}", ins[0])))
                        .copied()
                        .unwrap_or_else(|| mix(field, &ins)),
                ),
                InstKind::InstancePut(field) => {
                    heap.insert(format!("{}.{field}", ins[1]), ins[0]);
                    None
                }
                InstKind::StaticGet(field) => {
                    Some(heap.get(field).copied().unwrap_or_else(|| mix(field, &[])))
                }
                InstKind::StaticPut(field) => {
                    out.effects.push(format!("{field} = {}", ins[0]));
                    heap.insert(field.clone(), ins[0]);
                    None
                }
                InstKind::ArrayGet => Some(
                    heap.get(&format!("{}[{}]", ins[0], ins[1]))
                        .copied()
                        .unwrap_or_else(|| mix("[]", &ins)),
                ),
                InstKind::ArrayPut => {
                    heap.insert(format!("{}[{}]", ins[1], ins[2]), ins[0]);
                    None
                }
                InstKind::NewInstance(_) => {
                    next_object += 1;
                    Some(next_object)
                }
                InstKind::CheckCast(_) => ins.first().copied(),
                InstKind::MonitorEnter | InstKind::MonitorExit => {
                    out.effects.push(format!("{:?} {}", inst.kind, ins[0]));
                    None
                }
                InstKind::SpillMove { .. } | InstKind::Remat { .. } => {
                    f.inserted(&inst.kind);
                    None
                }
                InstKind::Tombstone => None,
            };
            if let (Some(v), Some(x)) = (inst.out, res) {
                f.write(v, n, x);
            }
        }
        panic!("fell off the end of {b}");
    }
}
