//! A parser for the textual IR format, suitable for creating [Method]s for testing and tooling.
//!
//! The format is the same as that produced by [Method]'s `Display` implementation:
//!
//! 1. Blocks must be labelled `bb0`, `bb1`, ... in order. A block header may be followed by any
//!    number of `catch <label>` attributes and at most one `locals(<local>, ...)` attribute.
//! 2. Values are written `%<n>` and must be defined in order starting from `%0`. A definition is
//!    `%<n>: <ty> = <op> <operands> [@<name>]`: the optional `@<name>` records the source-level
//!    local the value holds.
//! 3. Phis are written `phi [%<n>, <label>], ...` and must precede all other instructions in
//!    their block.
//! 4. Every block must end with exactly one of `if_*`, `goto`, `return`, or `throw`.
//! 5. `#` starts a comment that runs to the end of the line.

use crate::{errors::CompilationError, ir::*};
use lrlex::{lrlex_mod, DefaultLexerTypes, LRNonStreamingLexer};
use lrpar::{lrpar_mod, NonStreamingLexer, Span};
use smallvec::SmallVec;
use std::str::FromStr;

lrlex_mod!("ir/ir.l");
lrpar_mod!("ir/ir.y");
type StorageT = u32;

/// A parsed operand, before it is checked against its instruction's signature.
#[derive(Clone, Copy)]
enum Opnd<'input> {
    Val(ValueIdx),
    Int(i64),
    Label(BlockIdx),
    Name(&'input str),
    PhiArg(ValueIdx, BlockIdx),
}

struct IrParser<'lexer, 'input: 'lexer> {
    lexer: &'lexer LRNonStreamingLexer<'lexer, 'input, DefaultLexerTypes<StorageT>>,
    m: Method,
}

impl<'lexer, 'input: 'lexer> IrParser<'lexer, 'input> {
    fn build(mut self, astblocks: Vec<AstBlock>) -> Result<Method, CompilationError> {
        for (i, astb) in astblocks.iter().enumerate() {
            if self.p_label_index(astb.label)? != i {
                return Err(self.err_span(
                    astb.label,
                    &format!("Incorrect label: should be 'bb{i}'"),
                ));
            }
            self.m.blocks.push(Block::default());
        }

        // Values can be used before their definition is reached in textual order (e.g. by a phi
        // at a loop header) so all definitions are created before any instruction is built.
        let mut next_iidx = InstIdx::new(0);
        for (i, astb) in astblocks.iter().enumerate() {
            let mut seen_non_phi = false;
            for astinst in &astb.insts {
                let op = self.lexer.span_str(astinst.op);
                let is_phi = op == "phi";
                if is_phi && seen_non_phi {
                    return Err(self.err_span(
                        astinst.span,
                        "Phis must precede all other instructions in a block",
                    ));
                }
                seen_non_phi |= !is_phi;
                if let Some((local, ty)) = astinst.def {
                    self.p_def_local(local)?;
                    let ty = self.p_ty(ty)?;
                    let def = if is_phi {
                        ValueDef::Phi {
                            block: BlockIdx::new(i),
                            args: SmallVec::new(),
                        }
                    } else {
                        ValueDef::Inst(next_iidx)
                    };
                    let mut val = Value::new(ty, def);
                    val.local = astinst
                        .debug_name
                        .map(|x| self.lexer.span_str(x)[1..].to_owned());
                    let vidx = self.m.values.push(val);
                    if is_phi {
                        self.m.blocks[BlockIdx::new(i)].phis.push(vidx);
                    }
                } else if is_phi {
                    return Err(self.err_span(astinst.span, "Phis must define a value"));
                }
                if !is_phi {
                    next_iidx += 1;
                }
            }
        }

        for (i, astb) in astblocks.into_iter().enumerate() {
            let bidx = BlockIdx::new(i);
            let mut seen_locals = false;
            for attr in astb.attrs {
                match attr {
                    AstBlockAttr::Catch(label) => {
                        let h = self.p_label(label)?;
                        self.m.blocks[bidx].catch_handlers.push(h);
                    }
                    AstBlockAttr::Locals(locals) => {
                        if seen_locals {
                            return Err(self.err_span(
                                astb.label,
                                "At most one 'locals' attribute per block",
                            ));
                        }
                        seen_locals = true;
                        for l in locals {
                            let vidx = self.p_local(l)?;
                            self.m.blocks[bidx].locals_at_entry.push(vidx);
                        }
                    }
                }
            }

            let Some(last) = astb.insts.last().map(|x| x.span) else {
                return Err(self.err_span(astb.label, "Empty block"));
            };
            for astinst in astb.insts {
                let out = match astinst.def {
                    Some((local, _)) => Some(self.p_local(local)?),
                    None => None,
                };
                if let (Some(vidx), "phi") = (out, self.lexer.span_str(astinst.op)) {
                    self.p_phi(vidx, &astinst)?;
                    continue;
                }
                let is_last = astinst.span == last;
                self.p_inst(bidx, out, &astinst, is_last)?;
            }
        }

        self.m.compute_predecessors();
        self.m.number_instructions();
        Ok(self.m)
    }

    fn p_phi(&mut self, vidx: ValueIdx, astinst: &AstInst) -> Result<(), CompilationError> {
        let mut phi_args = SmallVec::new();
        for opnd in self.p_operands(&astinst.operands)? {
            match opnd {
                Opnd::PhiArg(v, b) => phi_args.push((b, v)),
                _ => {
                    return Err(self.err_span(
                        astinst.span,
                        "Phi operands must be of the form '[%<n>, bb<n>]'",
                    ))
                }
            }
        }
        match &mut self.m.values[vidx].def {
            ValueDef::Phi { args, .. } => *args = phi_args,
            ValueDef::Inst(_) => unreachable!(),
        }
        Ok(())
    }

    fn p_inst(
        &mut self,
        bidx: BlockIdx,
        out: Option<ValueIdx>,
        astinst: &AstInst,
        is_last: bool,
    ) -> Result<(), CompilationError> {
        let op = self.lexer.span_str(astinst.op);
        let opnds = self.p_operands(&astinst.operands)?;
        let bad = || self.err_span(astinst.span, &format!("Malformed '{op}' instruction"));

        let mut ins = SmallVec::<[ValueIdx; 3]>::new();
        let mut succs = Vec::new();
        let mut needs_out = Some(true);
        let kind = match (op, &opnds[..]) {
            ("arg", []) => InstKind::Arg { receiver: false },
            ("arg", [Opnd::Name("this")]) => InstKind::Arg { receiver: true },
            ("move_exception", []) => InstKind::MoveException,
            ("const", [Opnd::Int(c)]) => InstKind::Const(*c),
            ("move", [Opnd::Val(v)]) => {
                ins.push(*v);
                InstKind::Move
            }
            ("cmp", [Opnd::Val(lhs), Opnd::Val(rhs)]) => {
                ins.extend([*lhs, *rhs]);
                InstKind::Cmp
            }
            ("goto", [Opnd::Label(b)]) => {
                needs_out = Some(false);
                succs.push(*b);
                InstKind::Goto
            }
            ("return", []) => {
                needs_out = Some(false);
                InstKind::Return
            }
            ("return", [Opnd::Val(v)]) | ("throw", [Opnd::Val(v)]) => {
                needs_out = Some(false);
                ins.push(*v);
                if op == "return" {
                    InstKind::Return
                } else {
                    InstKind::Throw
                }
            }
            ("iget", [Opnd::Val(obj), Opnd::Name(field)]) => {
                ins.push(*obj);
                InstKind::InstanceGet((*field).to_owned())
            }
            ("iput", [Opnd::Val(v), Opnd::Val(obj), Opnd::Name(field)]) => {
                needs_out = Some(false);
                ins.extend([*v, *obj]);
                InstKind::InstancePut((*field).to_owned())
            }
            ("sget", [Opnd::Name(field)]) => InstKind::StaticGet((*field).to_owned()),
            ("sput", [Opnd::Val(v), Opnd::Name(field)]) => {
                needs_out = Some(false);
                ins.push(*v);
                InstKind::StaticPut((*field).to_owned())
            }
            ("aget", [Opnd::Val(arr), Opnd::Val(idx)]) => {
                ins.extend([*arr, *idx]);
                InstKind::ArrayGet
            }
            ("aput", [Opnd::Val(v), Opnd::Val(arr), Opnd::Val(idx)]) => {
                needs_out = Some(false);
                ins.extend([*v, *arr, *idx]);
                InstKind::ArrayPut
            }
            ("new_instance", [Opnd::Name(class)]) => InstKind::NewInstance((*class).to_owned()),
            ("check_cast", [Opnd::Val(v), Opnd::Name(class)]) => {
                ins.push(*v);
                InstKind::CheckCast((*class).to_owned())
            }
            ("monitor_enter", [Opnd::Val(v)]) | ("monitor_exit", [Opnd::Val(v)]) => {
                needs_out = Some(false);
                ins.push(*v);
                if op == "monitor_enter" {
                    InstKind::MonitorEnter
                } else {
                    InstKind::MonitorExit
                }
            }
            (_, _) if op.starts_with("invoke_") => {
                let kind = InvokeKind::from_str(&op["invoke_".len()..]).map_err(|_| bad())?;
                let [Opnd::Name(target), Opnd::Name(shorty), args @ ..] = &opnds[..] else {
                    return Err(bad());
                };
                for a in args {
                    let Opnd::Val(v) = a else { return Err(bad()) };
                    ins.push(*v);
                }
                needs_out = None;
                InstKind::Invoke {
                    kind,
                    target: (*target).to_owned(),
                    shorty: (*shorty).to_owned(),
                }
            }
            (_, _) if op.starts_with("if_") => {
                needs_out = Some(false);
                let cond = &op["if_".len()..];
                let (cond, vals, labels) = match &opnds[..] {
                    [Opnd::Val(lhs), Opnd::Val(rhs), Opnd::Label(t), Opnd::Label(f)]
                        if !cond.ends_with('z') =>
                    {
                        (cond, vec![*lhs, *rhs], [*t, *f])
                    }
                    [Opnd::Val(v), Opnd::Label(t), Opnd::Label(f)] if cond.ends_with('z') => {
                        (&cond[..cond.len() - 1], vec![*v], [*t, *f])
                    }
                    _ => return Err(bad()),
                };
                let cond = IfCond::from_str(cond).map_err(|_| bad())?;
                ins.extend(vals);
                succs.extend(labels);
                InstKind::If(cond)
            }
            (_, [Opnd::Val(v), Opnd::Int(lit)]) if op.ends_with("_lit") => {
                let binop =
                    BinOp::from_str(&op[..op.len() - "_lit".len()]).map_err(|_| bad())?;
                let lit = i32::try_from(*lit).map_err(|_| bad())?;
                ins.push(*v);
                InstKind::BinOpLit(binop, lit)
            }
            (_, [Opnd::Val(lhs), Opnd::Val(rhs)]) if BinOp::from_str(op).is_ok() => {
                ins.extend([*lhs, *rhs]);
                InstKind::BinOp(BinOp::from_str(op).map_err(|_| bad())?)
            }
            (_, [Opnd::Val(v)]) if UnOp::from_str(op).is_ok() => {
                ins.push(*v);
                InstKind::UnOp(UnOp::from_str(op).map_err(|_| bad())?)
            }
            _ => {
                return Err(self.err_span(
                    astinst.op,
                    &format!("Unknown instruction '{op}' or incorrect operands"),
                ))
            }
        };

        match (needs_out, out) {
            (Some(true), None) => {
                return Err(self.err_span(astinst.span, &format!("'{op}' must define a value")))
            }
            (Some(false), Some(_)) => {
                return Err(self.err_span(astinst.span, &format!("'{op}' cannot define a value")))
            }
            _ => (),
        }
        if astinst.def.is_none() && astinst.debug_name.is_some() {
            return Err(self.err_span(astinst.span, "Only definitions can have a debug name"));
        }

        let inst = Inst::new(kind, out, ins);
        match (inst.is_terminator(), is_last) {
            (true, false) => {
                return Err(self.err_span(
                    astinst.span,
                    "Terminators must be the last instruction in a block",
                ))
            }
            (false, true) => {
                return Err(self.err_span(astinst.span, "Blocks must end with a terminator"))
            }
            _ => (),
        }
        let iidx = self.m.push_inst(bidx, inst);
        if let Some(vidx) = out {
            debug_assert!(matches!(self.m.values[vidx].def, ValueDef::Inst(x) if x == iidx));
        }
        self.m.blocks[bidx].succs.extend(succs);
        Ok(())
    }

    fn p_operands(&self, astopnds: &[AstOperand]) -> Result<Vec<Opnd<'input>>, CompilationError> {
        astopnds
            .iter()
            .map(|x| match x {
                AstOperand::Local(span) => Ok(Opnd::Val(self.p_local(*span)?)),
                AstOperand::Int(span) => self
                    .lexer
                    .span_str(*span)
                    .parse::<i64>()
                    .map(Opnd::Int)
                    .map_err(|e| self.err_span(*span, &e.to_string())),
                AstOperand::Label(span) => Ok(Opnd::Label(self.p_label(*span)?)),
                AstOperand::Name(span) => Ok(Opnd::Name(self.lexer.span_str(*span))),
                AstOperand::PhiArg(local, label) => {
                    Ok(Opnd::PhiArg(self.p_local(*local)?, self.p_label(*label)?))
                }
            })
            .collect()
    }

    fn err_span(&self, span: Span, msg: &str) -> CompilationError {
        let ((line_off, col), _) = self.lexer.line_col(span);
        let code = self
            .lexer
            .span_lines_str(span)
            .split('\n')
            .next()
            .unwrap_or("")
            .trim();
        CompilationError::General(format!(
            "Line {}, column {}:\n  {}\n{}",
            line_off, col, code, msg
        ))
    }

    fn p_def_local(&self, span: Span) -> Result<(), CompilationError> {
        let n = self.p_index(span)?;
        if n != self.m.values.len() {
            return Err(self.err_span(
                span,
                &format!("Incorrect local: should be '%{}'", self.m.values.len()),
            ));
        }
        Ok(())
    }

    fn p_local(&self, span: Span) -> Result<ValueIdx, CompilationError> {
        let n = self.p_index(span)?;
        if n >= self.m.values.len() {
            return Err(self.err_span(span, "Undefined local"));
        }
        Ok(ValueIdx::new(n))
    }

    fn p_label(&self, span: Span) -> Result<BlockIdx, CompilationError> {
        let n = self.p_label_index(span)?;
        if n >= self.m.blocks.len() {
            return Err(self.err_span(span, "Undefined label"));
        }
        Ok(BlockIdx::new(n))
    }

    fn p_label_index(&self, span: Span) -> Result<usize, CompilationError> {
        let s = self.lexer.span_str(span);
        debug_assert!(s.starts_with("bb"));
        s[2..]
            .parse::<usize>()
            .map_err(|e| self.err_span(span, &e.to_string()))
    }

    fn p_index(&self, span: Span) -> Result<usize, CompilationError> {
        let s = self.lexer.span_str(span);
        debug_assert!(s.starts_with('%'));
        s[1..]
            .parse::<usize>()
            .map_err(|e| self.err_span(span, &e.to_string()))
    }

    fn p_ty(&self, span: Span) -> Result<Ty, CompilationError> {
        match self.lexer.span_str(span) {
            "int" => Ok(Ty::Int),
            "float" => Ok(Ty::Float),
            "long" => Ok(Ty::Long),
            "double" => Ok(Ty::Double),
            "obj" => Ok(Ty::Object),
            x => Err(self.err_span(span, &format!("Unknown type '{x}'"))),
        }
    }
}

/// Parse `s` into a [Method].
pub fn parse_method(s: &str) -> Result<Method, CompilationError> {
    let lexerdef = ir_l::lexerdef();
    let lexer = lexerdef.lexer(s);
    let (res, errs) = ir_y::parse(&lexer);
    if !errs.is_empty() {
        let msgs = errs
            .iter()
            .map(|e| e.pp(&lexer, &ir_y::token_epp))
            .collect::<Vec<_>>();
        return Err(CompilationError::General(format!(
            "Could not parse input:\n{}",
            msgs.join("\n")
        )));
    }
    let Some(Ok(blocks)) = res else {
        return Err(CompilationError::General("No AST produced".to_owned()));
    };
    IrParser {
        lexer: &lexer,
        m: Method::new(),
    }
    .build(blocks)
}

/// Parse `s` into a [Method].
///
/// # Panics
///
/// If `s` is not parsable.
pub fn str_to_method(s: &str) -> Method {
    match parse_method(s) {
        Ok(m) => m,
        Err(e) => panic!("{e}"),
    }
}

impl FromStr for Method {
    type Err = CompilationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_method(s)
    }
}

struct AstBlock {
    label: Span,
    attrs: Vec<AstBlockAttr>,
    insts: Vec<AstInst>,
}

enum AstBlockAttr {
    Catch(Span),
    Locals(Vec<Span>),
}

struct AstInst {
    /// The defined local and its type.
    def: Option<(Span, Span)>,
    op: Span,
    operands: Vec<AstOperand>,
    debug_name: Option<Span>,
    span: Span,
}

enum AstOperand {
    Local(Span),
    Int(Span),
    Label(Span),
    Name(Span),
    PhiArg(Span, Span),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basic() {
        let m = str_to_method(
            "
          # A comment.
          bb0:
            %0: int = arg
            %1: int = const 2 @two
            %2: int = mul %0, %1
            if_lt %2, %1, bb1, bb2
          bb1 catch bb2:
            %3: obj = new_instance Foo
            goto bb2
          bb2 locals(%2):
            return %2
        ",
        );
        assert_eq!(m.blocks.len(), 3);
        assert_eq!(m.values.len(), 4);
        assert_eq!(m.values[ValueIdx::new(1)].local.as_deref(), Some("two"));
        let b0 = &m.blocks[BlockIdx::new(0)];
        assert_eq!(b0.succs, vec![BlockIdx::new(1), BlockIdx::new(2)]);
        let b2 = &m.blocks[BlockIdx::new(2)];
        assert_eq!(b2.preds, vec![BlockIdx::new(0), BlockIdx::new(1)]);
        assert_eq!(b2.locals_at_entry, vec![ValueIdx::new(2)]);
        assert_eq!(m.exit_number(BlockIdx::new(2)), 12);
    }

    #[test]
    fn loop_phi() {
        let m = str_to_method(
            "
          bb0:
            %0: int = const 0
            goto bb1
          bb1:
            %1: int = phi [%0, bb0], [%2, bb1]
            %2: int = add_lit %1, 1
            if_nez %2, bb1, bb2
          bb2:
            return %1
        ",
        );
        let ValueDef::Phi { block, args } = &m.values[ValueIdx::new(1)].def else {
            panic!()
        };
        assert_eq!(*block, BlockIdx::new(1));
        assert_eq!(
            args.as_slice(),
            &[
                (BlockIdx::new(0), ValueIdx::new(0)),
                (BlockIdx::new(1), ValueIdx::new(2))
            ]
        );
        assert_eq!(m.def_inst(ValueIdx::new(2)).unwrap().number, 4);
    }

    #[test]
    fn errors() {
        let bad = [
            ("bb0:\n  %1: int = const 1\n  return\n", "Incorrect local: should be '%0'"),
            ("bb1:\n  return\n", "Incorrect label: should be 'bb0'"),
            ("bb0:\n  %0: int = const 1\n", "Blocks must end with a terminator"),
            ("bb0:\n  return\n  return\n", "Terminators must be the last"),
            ("bb0:\n  %0: int = frob %0\n  return\n", "Unknown instruction 'frob'"),
            ("bb0:\n  const 1\n  return\n", "'const' must define a value"),
            ("bb0:\n  %0: wide = const 1\n  return\n", "Unknown type 'wide'"),
            ("bb0:\n  return %3\n", "Undefined local"),
        ];
        for (s, msg) in bad {
            match parse_method(s) {
                Ok(_) => panic!("{s} parsed"),
                Err(e) => {
                    let e = e.to_string();
                    assert!(e.contains(msg), "{e}");
                }
            }
        }
        assert!(parse_method("bb0 bb1:\n").is_err());
    }
}
