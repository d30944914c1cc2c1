//! The method IR that the register allocator operates on.
//!
//! A [Method] is a sequence of basic blocks in their final (linearised) order. Values are in SSA
//! form: every [Value] is defined exactly once, either by an instruction or by a phi at the start
//! of a block. Instructions, blocks, and values live in [IndexVec]s and refer to each other by
//! index.
//!
//! Instructions are numbered in steps of [INSTRUCTION_NUMBER_DELTA] (`0, 2, 4, ...`) so that the
//! odd "gap" positions between them can be used by the register allocator for the moves it
//! inserts. Inserted instructions take the number of the gap they were inserted at.
//!
//! The textual format (see [parser]) looks like:
//!
//! ```text
//! bb0:
//!   %0: int = arg
//!   %1: int = const 3
//!   %2: int = add %0, %1
//!   if_eqz %2, bb1, bb2
//! bb1:
//!   goto bb2
//! bb2:
//!   return %2
//! ```

use index_vec::IndexVec;
use smallvec::SmallVec;
use std::fmt;
use strum::{Display, EnumString};

pub mod parser;
pub(crate) mod well_formed;

/// The distance between the numbers of two consecutive instructions.
pub const INSTRUCTION_NUMBER_DELTA: u32 = 2;
// Gaps between instructions must be odd positions.
static_assertions::const_assert!(INSTRUCTION_NUMBER_DELTA % 2 == 0 && INSTRUCTION_NUMBER_DELTA > 1);

/// The highest register addressable by a 4-bit register field.
pub const U4BIT_MAX: u32 = 15;
/// The highest register addressable by an 8-bit register field.
pub const U8BIT_MAX: u32 = 255;
/// The highest register addressable by a 16-bit register field.
pub const U16BIT_MAX: u32 = 65535;

/// Invokes needing more than this many argument registers must use the range form.
pub const MAX_NON_RANGE_INVOKE_REGISTERS: u32 = 5;

index_vec::define_index_type! {
    /// A basic block index.
    pub struct BlockIdx = u32;
    DISPLAY_FORMAT = "bb{}";
}

index_vec::define_index_type! {
    /// An index into [Method::insts].
    pub struct InstIdx = u32;
}

index_vec::define_index_type! {
    /// An SSA value index.
    pub struct ValueIdx = u32;
    DISPLAY_FORMAT = "%{}";
}

/// The type of a value, as far as register allocation is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ty {
    Int,
    Float,
    Long,
    Double,
    Object,
}

impl Ty {
    /// Does this type occupy two consecutive registers?
    pub fn is_wide(self) -> bool {
        matches!(self, Ty::Long | Ty::Double)
    }

    /// How many registers does a value of this type occupy?
    pub fn required_registers(self) -> u32 {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    /// The kind of move needed to copy a value of this type between registers.
    pub fn move_ty(self) -> MoveTy {
        match self {
            Ty::Int | Ty::Float => MoveTy::Single,
            Ty::Long | Ty::Double => MoveTy::Wide,
            Ty::Object => MoveTy::Object,
        }
    }

    /// Parse a single character of a method shorty into a type. Returns `None` for `V` (void) and
    /// for characters that aren't part of the shorty alphabet.
    pub fn from_shorty_char(c: char) -> Option<Ty> {
        match c {
            'Z' | 'B' | 'S' | 'C' | 'I' => Some(Ty::Int),
            'F' => Some(Ty::Float),
            'J' => Some(Ty::Long),
            'D' => Some(Ty::Double),
            'L' => Some(Ty::Object),
            _ => None,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Int => write!(f, "int"),
            Ty::Float => write!(f, "float"),
            Ty::Long => write!(f, "long"),
            Ty::Double => write!(f, "double"),
            Ty::Object => write!(f, "obj"),
        }
    }
}

/// The register class of a move.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MoveTy {
    Single,
    Wide,
    Object,
}

impl MoveTy {
    pub fn required_registers(self) -> u32 {
        match self {
            MoveTy::Wide => 2,
            MoveTy::Single | MoveTy::Object => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum UnOp {
    Neg,
    Not,
    /// A primitive conversion (e.g. `int-to-long`): the input and output types are those of the
    /// values involved.
    Conv,
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum IfCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "snake_case")]
pub enum InvokeKind {
    Static,
    Virtual,
    Direct,
    Interface,
}

impl InvokeKind {
    /// Does this kind of invoke pass a receiver before the arguments listed in the shorty?
    pub fn has_receiver(self) -> bool {
        !matches!(self, InvokeKind::Static)
    }
}

/// How a value is defined.
#[derive(Clone, Debug)]
pub enum ValueDef {
    /// The value is the output of an instruction.
    Inst(InstIdx),
    /// The value is a phi at the start of `block`. `args` pairs each predecessor with the value
    /// flowing in from it.
    Phi {
        block: BlockIdx,
        args: SmallVec<[(BlockIdx, ValueIdx); 2]>,
    },
}

#[derive(Clone, Debug)]
pub struct Value {
    pub ty: Ty,
    pub def: ValueDef,
    /// The source-level local this value holds, used only for debug output.
    pub local: Option<String>,
    /// The previous value in a consecutive-register group.
    pub prev_consecutive: Option<ValueIdx>,
    /// The next value in a consecutive-register group.
    pub next_consecutive: Option<ValueIdx>,
}

impl Value {
    pub fn new(ty: Ty, def: ValueDef) -> Self {
        Self {
            ty,
            def,
            local: None,
            prev_consecutive: None,
            next_consecutive: None,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.def, ValueDef::Phi { .. })
    }

    pub fn def_inst(&self) -> Option<InstIdx> {
        match self.def {
            ValueDef::Inst(iidx) => Some(iidx),
            ValueDef::Phi { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InstKind {
    /// An incoming argument. Arguments must be the first instructions of the entry block.
    Arg {
        receiver: bool,
    },
    /// Load the pending exception. Only valid as the first instruction of a catch handler.
    MoveException,
    Const(i64),
    Move,
    BinOp(BinOp),
    BinOpLit(BinOp, i32),
    UnOp(UnOp),
    Cmp,
    /// A conditional branch with one (compare against zero) or two inputs. The taken successor
    /// is the block's first successor, the fallthrough its second.
    If(IfCond),
    Goto,
    Return,
    Throw,
    Invoke {
        kind: InvokeKind,
        target: String,
        shorty: String,
    },
    InstanceGet(String),
    InstancePut(String),
    StaticGet(String),
    StaticPut(String),
    ArrayGet,
    ArrayPut,
    NewInstance(String),
    CheckCast(String),
    MonitorEnter,
    MonitorExit,
    /// A register to register move inserted by the register allocator.
    SpillMove {
        ty: MoveTy,
        dst: u32,
        src: u32,
    },
    /// A rematerialised constant inserted by the register allocator.
    Remat {
        ty: MoveTy,
        dst: u32,
        value: i64,
    },
    /// An instruction that has been removed.
    Tombstone,
}

impl InstKind {
    /// Was this instruction inserted by the register allocator?
    pub fn is_inserted(&self) -> bool {
        matches!(self, InstKind::SpillMove { .. } | InstKind::Remat { .. })
    }
}

#[derive(Clone, Debug)]
pub struct Inst {
    pub kind: InstKind,
    pub out: Option<ValueIdx>,
    pub ins: SmallVec<[ValueIdx; 3]>,
    pub block: BlockIdx,
    pub number: u32,
}

impl Inst {
    pub fn new(kind: InstKind, out: Option<ValueIdx>, ins: SmallVec<[ValueIdx; 3]>) -> Self {
        Self {
            kind,
            out,
            ins,
            block: BlockIdx::new(0),
            number: 0,
        }
    }

    /// The highest register number any input of this instruction can be encoded in.
    pub fn max_in_register(&self, m: &Method) -> u32 {
        match &self.kind {
            InstKind::BinOp(_)
            | InstKind::Cmp
            | InstKind::ArrayGet
            | InstKind::ArrayPut
            | InstKind::StaticPut(_)
            | InstKind::CheckCast(_)
            | InstKind::Return
            | InstKind::Throw
            | InstKind::MonitorEnter
            | InstKind::MonitorExit => U8BIT_MAX,
            InstKind::BinOpLit(_, lit) => {
                if i8::try_from(*lit).is_ok() {
                    U8BIT_MAX
                } else {
                    U4BIT_MAX
                }
            }
            InstKind::UnOp(_) | InstKind::InstanceGet(_) | InstKind::InstancePut(_) => U4BIT_MAX,
            InstKind::If(_) => {
                if self.ins.len() == 2 {
                    U4BIT_MAX
                } else {
                    U8BIT_MAX
                }
            }
            InstKind::Invoke { .. } => {
                if self.is_range_invoke(m) {
                    U16BIT_MAX
                } else {
                    U4BIT_MAX
                }
            }
            InstKind::Arg { .. }
            | InstKind::MoveException
            | InstKind::Const(_)
            | InstKind::Move
            | InstKind::Goto
            | InstKind::StaticGet(_)
            | InstKind::NewInstance(_)
            | InstKind::SpillMove { .. }
            | InstKind::Remat { .. }
            | InstKind::Tombstone => U16BIT_MAX,
        }
    }

    /// The highest register number the output of this instruction can be encoded in.
    pub fn max_out_register(&self) -> u32 {
        match &self.kind {
            InstKind::Const(_)
            | InstKind::MoveException
            | InstKind::BinOp(_)
            | InstKind::Cmp
            | InstKind::ArrayGet
            | InstKind::StaticGet(_)
            | InstKind::NewInstance(_)
            | InstKind::CheckCast(_)
            | InstKind::Invoke { .. } => U8BIT_MAX,
            InstKind::BinOpLit(_, lit) => {
                if i8::try_from(*lit).is_ok() {
                    U8BIT_MAX
                } else {
                    U4BIT_MAX
                }
            }
            InstKind::UnOp(_) | InstKind::InstanceGet(_) => U4BIT_MAX,
            _ => U16BIT_MAX,
        }
    }

    /// Is this an invoke whose argument registers don't fit the non-range encoding?
    pub fn is_range_invoke(&self, m: &Method) -> bool {
        matches!(self.kind, InstKind::Invoke { .. })
            && m.registers_for(&self.ins) > MAX_NON_RANGE_INVOKE_REGISTERS
    }

    pub fn can_throw(&self) -> bool {
        match &self.kind {
            InstKind::BinOp(op) | InstKind::BinOpLit(op, _) => {
                matches!(op, BinOp::Div | BinOp::Rem)
            }
            InstKind::Throw
            | InstKind::Invoke { .. }
            | InstKind::InstanceGet(_)
            | InstKind::InstancePut(_)
            | InstKind::StaticGet(_)
            | InstKind::StaticPut(_)
            | InstKind::ArrayGet
            | InstKind::ArrayPut
            | InstKind::NewInstance(_)
            | InstKind::CheckCast(_)
            | InstKind::MonitorEnter
            | InstKind::MonitorExit => true,
            _ => false,
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::If(_) | InstKind::Goto | InstKind::Return | InstKind::Throw
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct Block {
    pub insts: Vec<InstIdx>,
    pub phis: Vec<ValueIdx>,
    /// Normal successors. For an `if`, the taken successor comes first.
    pub succs: Vec<BlockIdx>,
    /// Exceptional successors.
    pub catch_handlers: Vec<BlockIdx>,
    /// Derived from the successors and catch handlers of all blocks by
    /// [Method::compute_predecessors].
    pub preds: Vec<BlockIdx>,
    /// The values holding source-level locals on entry to this block.
    pub locals_at_entry: Vec<ValueIdx>,
}

impl Block {
    /// Iterate over normal and exceptional successors, normal successors first.
    pub fn all_succs(&self) -> impl Iterator<Item = BlockIdx> + '_ {
        self.succs.iter().chain(self.catch_handlers.iter()).cloned()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Method {
    pub blocks: IndexVec<BlockIdx, Block>,
    pub insts: IndexVec<InstIdx, Inst>,
    pub values: IndexVec<ValueIdx, Value>,
}

impl Method {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `inst` onto the end of `bidx`, returning its index.
    pub fn push_inst(&mut self, bidx: BlockIdx, mut inst: Inst) -> InstIdx {
        inst.block = bidx;
        let iidx = self.insts.push(inst);
        self.blocks[bidx].insts.push(iidx);
        iidx
    }

    pub fn inst(&self, iidx: InstIdx) -> &Inst {
        &self.insts[iidx]
    }

    pub fn value(&self, vidx: ValueIdx) -> &Value {
        &self.values[vidx]
    }

    /// The instruction defining `vidx`, if it is not a phi.
    pub fn def_inst(&self, vidx: ValueIdx) -> Option<&Inst> {
        self.values[vidx].def_inst().map(|iidx| &self.insts[iidx])
    }

    /// How many registers do the values `vals` need in total?
    pub fn registers_for(&self, vals: &[ValueIdx]) -> u32 {
        vals.iter()
            .map(|v| self.values[*v].ty.required_registers())
            .sum()
    }

    /// The number of the first instruction in `bidx`.
    ///
    /// # Panics
    ///
    /// If `bidx` is empty.
    pub fn entry_number(&self, bidx: BlockIdx) -> u32 {
        self.insts[self.blocks[bidx].insts[0]].number
    }

    /// The number of the last instruction in `bidx`.
    ///
    /// # Panics
    ///
    /// If `bidx` is empty.
    pub fn exit_number(&self, bidx: BlockIdx) -> u32 {
        self.insts[*self.blocks[bidx].insts.last().unwrap()].number
    }

    /// The first instruction of `bidx`.
    pub fn entry_inst(&self, bidx: BlockIdx) -> Option<&Inst> {
        self.blocks[bidx].insts.first().map(|iidx| &self.insts[*iidx])
    }

    /// The last instruction of `bidx`.
    pub fn exit_inst(&self, bidx: BlockIdx) -> Option<&Inst> {
        self.blocks[bidx].insts.last().map(|iidx| &self.insts[*iidx])
    }

    /// Number all instructions in block order, starting at 0 and counting up in steps of
    /// [INSTRUCTION_NUMBER_DELTA].
    pub fn number_instructions(&mut self) {
        let mut next = 0;
        for b in self.blocks.iter() {
            for iidx in &b.insts {
                self.insts[*iidx].number = next;
                next += INSTRUCTION_NUMBER_DELTA;
            }
        }
    }

    /// Recompute every block's predecessors from the successors and catch handlers of all
    /// blocks. Predecessors are listed in block order.
    pub fn compute_predecessors(&mut self) {
        let mut preds: IndexVec<BlockIdx, Vec<BlockIdx>> =
            index_vec::index_vec![Vec::new(); self.blocks.len()];
        for (bidx, b) in self.blocks.iter_enumerated() {
            for succ in b.all_succs() {
                if !preds[succ].contains(&bidx) {
                    preds[succ].push(bidx);
                }
            }
        }
        for (bidx, p) in preds.into_iter_enumerated() {
            self.blocks[bidx].preds = p;
        }
    }

    /// The values defined by the method's `arg` instructions, in order.
    pub fn args(&self) -> Vec<ValueIdx> {
        let Some(entry) = self.blocks.iter().next() else {
            return Vec::new();
        };
        entry
            .insts
            .iter()
            .map(|iidx| &self.insts[*iidx])
            .take_while(|inst| matches!(inst.kind, InstKind::Arg { .. }))
            .filter_map(|inst| inst.out)
            .collect()
    }

    /// The value holding the receiver, if this method has one.
    pub fn receiver(&self) -> Option<ValueIdx> {
        self.args().into_iter().find(|v| {
            matches!(
                self.def_inst(*v).map(|inst| &inst.kind),
                Some(InstKind::Arg { receiver: true })
            )
        })
    }

    /// For each value, the phis it flows into, in value order.
    pub fn phi_users(&self) -> IndexVec<ValueIdx, Vec<ValueIdx>> {
        let mut users: IndexVec<ValueIdx, Vec<ValueIdx>> =
            index_vec::index_vec![Vec::new(); self.values.len()];
        for (vidx, v) in self.values.iter_enumerated() {
            if let ValueDef::Phi { args, .. } = &v.def {
                for (_, arg) in args {
                    if !users[*arg].contains(&vidx) {
                        users[*arg].push(vidx);
                    }
                }
            }
        }
        users
    }

    /// Remove every instruction inserted by the register allocator.
    pub fn remove_inserted_insts(&mut self) {
        for b in self.blocks.iter_mut() {
            let insts = &mut self.insts;
            b.insts.retain(|iidx| {
                if insts[*iidx].kind.is_inserted() {
                    insts[*iidx].kind = InstKind::Tombstone;
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Remove `iidx` from its block and turn it into a [InstKind::Tombstone].
    pub fn tombstone(&mut self, iidx: InstIdx) {
        let bidx = self.insts[iidx].block;
        self.blocks[bidx].insts.retain(|x| *x != iidx);
        self.insts[iidx].kind = InstKind::Tombstone;
    }

    /// Return a displayable version of this method.
    pub fn display(&self) -> DisplayableMethod<'_> {
        DisplayableMethod {
            m: self,
            regs: None,
        }
    }

    /// Return a displayable version of this method in which every value operand is annotated
    /// with the register `regs(value, position)` holds it in. Values which are not in a register
    /// (i.e. `regs` returns `None`) are annotated with `remat`.
    pub fn display_allocated<'a>(
        &'a self,
        regs: &'a dyn Fn(ValueIdx, u32) -> Option<u32>,
    ) -> DisplayableMethod<'a> {
        DisplayableMethod {
            m: self,
            regs: Some(regs),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display().fmt(f)
    }
}

pub struct DisplayableMethod<'a> {
    m: &'a Method,
    regs: Option<&'a dyn Fn(ValueIdx, u32) -> Option<u32>>,
}

impl DisplayableMethod<'_> {
    fn val(&self, vidx: ValueIdx, pos: u32) -> String {
        match self.regs.map(|regs| regs(vidx, pos)) {
            Some(Some(r)) => format!("{vidx}:r{r}"),
            Some(None) => format!("{vidx}:remat"),
            None => format!("{vidx}"),
        }
    }

    fn def(&self, vidx: ValueIdx, pos: u32) -> String {
        if self.regs.is_some() {
            self.val(vidx, pos)
        } else {
            format!("{vidx}: {}", self.m.values[vidx].ty)
        }
    }

    fn fmt_inst(&self, f: &mut fmt::Formatter<'_>, iidx: InstIdx) -> fmt::Result {
        let m = self.m;
        let inst = &m.insts[iidx];
        let b = &m.blocks[inst.block];
        let n = inst.number;
        let ins = inst
            .ins
            .iter()
            .map(|v| self.val(*v, n))
            .collect::<Vec<_>>();
        let lhs = inst.out.map(|v| format!("{} = ", self.def(v, n)));
        let lhs = lhs.as_deref().unwrap_or("");
        let target = |i: usize| {
            b.succs
                .get(i)
                .map(|x| x.to_string())
                .unwrap_or_else(|| "?".to_owned())
        };
        match &inst.kind {
            InstKind::Arg { receiver } => {
                write!(f, "{lhs}arg{}", if *receiver { " this" } else { "" })?
            }
            InstKind::MoveException => write!(f, "{lhs}move_exception")?,
            InstKind::Const(c) => write!(f, "{lhs}const {c}")?,
            InstKind::Move => write!(f, "{lhs}move {}", ins.join(", "))?,
            InstKind::BinOp(op) => write!(f, "{lhs}{op} {}", ins.join(", "))?,
            InstKind::BinOpLit(op, lit) => write!(f, "{lhs}{op}_lit {}, {lit}", ins.join(", "))?,
            InstKind::UnOp(op) => write!(f, "{lhs}{op} {}", ins.join(", "))?,
            InstKind::Cmp => write!(f, "{lhs}cmp {}", ins.join(", "))?,
            InstKind::If(cond) => {
                let z = if ins.len() == 1 { "z" } else { "" };
                write!(
                    f,
                    "if_{cond}{z} {}, {}, {}",
                    ins.join(", "),
                    target(0),
                    target(1)
                )?
            }
            InstKind::Goto => write!(f, "goto {}", target(0))?,
            InstKind::Return => {
                if ins.is_empty() {
                    write!(f, "return")?
                } else {
                    write!(f, "return {}", ins.join(", "))?
                }
            }
            InstKind::Throw => write!(f, "throw {}", ins.join(", "))?,
            InstKind::Invoke {
                kind,
                target,
                shorty,
            } => {
                write!(f, "{lhs}invoke_{kind} {target}, {shorty}")?;
                for x in &ins {
                    write!(f, ", {x}")?;
                }
            }
            InstKind::InstanceGet(field) => write!(f, "{lhs}iget {}, {field}", ins.join(", "))?,
            InstKind::InstancePut(field) => write!(f, "iput {}, {field}", ins.join(", "))?,
            InstKind::StaticGet(field) => write!(f, "{lhs}sget {field}")?,
            InstKind::StaticPut(field) => write!(f, "sput {}, {field}", ins.join(", "))?,
            InstKind::ArrayGet => write!(f, "{lhs}aget {}", ins.join(", "))?,
            InstKind::ArrayPut => write!(f, "aput {}", ins.join(", "))?,
            InstKind::NewInstance(class) => write!(f, "{lhs}new_instance {class}")?,
            InstKind::CheckCast(class) => write!(f, "{lhs}check_cast {}, {class}", ins.join(", "))?,
            InstKind::MonitorEnter => write!(f, "monitor_enter {}", ins.join(", "))?,
            InstKind::MonitorExit => write!(f, "monitor_exit {}", ins.join(", "))?,
            InstKind::SpillMove { ty, dst, src } => {
                let op = match ty {
                    MoveTy::Single => "move",
                    MoveTy::Wide => "move_wide",
                    MoveTy::Object => "move_object",
                };
                write!(f, "{op} r{dst}, r{src}")?
            }
            InstKind::Remat { ty, dst, value } => {
                let op = if *ty == MoveTy::Wide {
                    "const_wide"
                } else {
                    "const"
                };
                write!(f, "{op} r{dst}, {value}")?
            }
            InstKind::Tombstone => write!(f, "tombstone")?,
        }
        if self.regs.is_none() {
            if let Some(name) = inst.out.and_then(|v| m.values[v].local.as_ref()) {
                write!(f, " @{name}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for DisplayableMethod<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.m;
        for (bidx, b) in m.blocks.iter_enumerated() {
            write!(f, "{bidx}")?;
            for h in &b.catch_handlers {
                write!(f, " catch {h}")?;
            }
            if !b.locals_at_entry.is_empty() {
                let locals = b
                    .locals_at_entry
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>();
                write!(f, " locals({})", locals.join(", "))?;
            }
            writeln!(f, ":")?;
            for phi in &b.phis {
                let pos = b
                    .insts
                    .first()
                    .map(|iidx| m.insts[*iidx].number.saturating_sub(1))
                    .unwrap_or(0);
                let ValueDef::Phi { args, .. } = &m.values[*phi].def else {
                    panic!()
                };
                let args = args
                    .iter()
                    .map(|(pred, v)| {
                        let pos = m.exit_inst(*pred).map(|x| x.number).unwrap_or(0);
                        format!("[{}, {pred}]", self.val(*v, pos))
                    })
                    .collect::<Vec<_>>();
                write!(f, "  {} = phi {}", self.def(*phi, pos), args.join(", "))?;
                if self.regs.is_none() {
                    if let Some(name) = &m.values[*phi].local {
                        write!(f, " @{name}")?;
                    }
                }
                writeln!(f)?;
            }
            for iidx in &b.insts {
                write!(f, "  ")?;
                self.fmt_inst(f, *iidx)?;
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{parser::str_to_method, *};

    #[test]
    fn numbering() {
        let m = str_to_method(
            "
          bb0:
            %0: int = const 1
            goto bb1
          bb1:
            return %0
        ",
        );
        assert_eq!(m.entry_number(BlockIdx::new(0)), 0);
        assert_eq!(m.exit_number(BlockIdx::new(0)), 2);
        assert_eq!(m.entry_number(BlockIdx::new(1)), 4);
        assert_eq!(m.blocks[BlockIdx::new(1)].preds, vec![BlockIdx::new(0)]);
    }

    #[test]
    fn display_roundtrips() {
        let s = "bb0:
  %0: obj = arg this
  %1: long = arg
  %2: int = const -3 @x
  %3: long = add %1, %1
  %4: int = cmp %3, %1
  if_eqz %4, bb1, bb2
bb1:
  %5: int = iget %0, count
  goto bb2
bb2 catch bb3:
  %6: int = phi [%2, bb0], [%5, bb1]
  invoke_virtual foo, VI, %0, %6
  return
bb3:
  %7: obj = move_exception
  throw %7
";
        let m = str_to_method(s);
        assert_eq!(m.to_string(), s);
        assert_eq!(m.args(), vec![ValueIdx::new(0), ValueIdx::new(1)]);
        assert_eq!(m.receiver(), Some(ValueIdx::new(0)));
    }

    #[test]
    fn encoding_limits() {
        let m = str_to_method(
            "
          bb0:
            %0: int = arg
            %1: int = add_lit %0, 100
            %2: int = add_lit %0, 1000
            %3: int = neg %2
            %4: int = add %1, %3
            return %4
        ",
        );
        let lim = |i: usize| {
            let inst = &m.insts[InstIdx::new(i)];
            (inst.max_in_register(&m), inst.max_out_register())
        };
        assert_eq!(lim(0), (U16BIT_MAX, U16BIT_MAX));
        assert_eq!(lim(1), (U8BIT_MAX, U8BIT_MAX));
        assert_eq!(lim(2), (U4BIT_MAX, U4BIT_MAX));
        assert_eq!(lim(3), (U4BIT_MAX, U4BIT_MAX));
        assert_eq!(lim(4), (U8BIT_MAX, U8BIT_MAX));
    }

    #[test]
    fn range_invokes() {
        let m = str_to_method(
            "
          bb0:
            %0: long = arg
            %1: long = arg
            %2: int = arg
            %3: long = arg
            invoke_static f, VJJ, %0, %1
            invoke_static g, VJJI, %0, %1, %2
            invoke_static h, VJJJ, %0, %1, %3
            return
        ",
        );
        assert!(!m.insts[InstIdx::new(4)].is_range_invoke(&m));
        // Exactly five registers still fit the non-range form.
        assert!(!m.insts[InstIdx::new(5)].is_range_invoke(&m));
        assert!(m.insts[InstIdx::new(6)].is_range_invoke(&m));
    }
}
