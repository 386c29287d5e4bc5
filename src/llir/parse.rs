//! A minimal line-oriented text loader for LLIR programs.
//!
//! One instruction per line; blocks are introduced by `block`, functions by
//! `func`/`endfunc`, globals by `global`. Function names used before their
//! definition resolve in a second pass; names matching an intrinsic bind to
//! the engine, anything else becomes an external declaration.

use super::{
    AluOp, Block, CastOp, CmpPred, FuncId, Function, FunctionKind, Inst, Intrinsic, Operand,
    Program, ValueId,
};
use crate::expr::Width;
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;

pub fn parse_program(text: &str) -> Result<Program> {
    Parser::default().run(text)
}

pub fn load_program(path: &std::path::Path) -> Result<Program> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read program {}", path.display()))?;
    parse_program(&text)
}

#[derive(Default)]
struct Parser {
    functions: Vec<Function>,
    function_names: HashMap<String, FuncId>,
    globals: Vec<super::Global>,
    global_names: HashMap<String, u32>,
    /// call sites waiting for a function id: (func, block, inst, name).
    fixups: Vec<(usize, usize, usize, String)>,
    entry: Option<String>,
}

struct FunctionState {
    function: Function,
    max_local: u32,
}

impl Parser {
    fn run(mut self, text: &str) -> Result<Program> {
        let mut current: Option<FunctionState> = None;
        for (number, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            self.line(line, &mut current)
                .with_context(|| format!("line {}: {}", number + 1, raw.trim()))?;
        }
        if current.is_some() {
            bail!("unterminated function (missing endfunc)");
        }
        self.resolve_fixups()?;
        let entry_name = self.entry.ok_or_else(|| anyhow!("missing entry directive"))?;
        let entry = *self
            .function_names
            .get(&entry_name)
            .ok_or_else(|| anyhow!("entry function {} is not defined", entry_name))?;
        Ok(Program {
            functions: self.functions,
            globals: self.globals,
            entry,
        })
    }

    fn line(&mut self, line: &str, current: &mut Option<FunctionState>) -> Result<()> {
        let mut words = line.split_whitespace();
        let head = words.next().unwrap();
        match head {
            "global" => {
                let name = words.next().ok_or_else(|| anyhow!("global needs a name"))?;
                let mut read_only = false;
                let mut spec = words.next().ok_or_else(|| anyhow!("global needs contents"))?;
                if spec == "ro" {
                    read_only = true;
                    spec = words.next().ok_or_else(|| anyhow!("global needs contents"))?;
                }
                let init = if let Some(hex) = spec.strip_prefix("hex:") {
                    decode_hex(hex)?
                } else if let Some(n) = spec.strip_prefix("zero:") {
                    vec![0; n.parse::<usize>()?]
                } else if let Some(s) = spec.strip_prefix("str:") {
                    let mut bytes = s.as_bytes().to_vec();
                    bytes.push(0);
                    bytes
                } else {
                    bail!("unknown global contents {}", spec);
                };
                let id = self.globals.len() as u32;
                self.global_names.insert(name.to_owned(), id);
                self.globals.push(super::Global {
                    name: name.to_owned(),
                    size: init.len() as u64,
                    init,
                    read_only,
                });
            }
            "func" => {
                if current.is_some() {
                    bail!("nested func");
                }
                let name = words.next().ok_or_else(|| anyhow!("func needs a name"))?;
                let params_spec = words.next().unwrap_or("()");
                let params = parse_params(params_spec)?;
                let mut ret = None;
                let mut vararg = false;
                let rest: Vec<&str> = words.collect();
                let mut iter = rest.iter();
                while let Some(&word) = iter.next() {
                    match word {
                        "->" => {
                            let w = iter
                                .next()
                                .ok_or_else(|| anyhow!("-> needs a return width"))?;
                            ret = Some(parse_width(w)?);
                        }
                        "vararg" => vararg = true,
                        other => bail!("unexpected token {}", other),
                    }
                }
                let id = self.functions.len() as FuncId;
                self.function_names.insert(name.to_owned(), id);
                self.functions.push(Function {
                    name: name.to_owned(),
                    params: params.clone(),
                    ret,
                    locals: 0,
                    blocks: Vec::new(),
                    vararg,
                    kind: FunctionKind::Defined,
                });
                *current = Some(FunctionState {
                    function: Function {
                        name: name.to_owned(),
                        params: params.clone(),
                        ret,
                        locals: params.len() as u32,
                        blocks: vec![Block { insts: Vec::new() }],
                        vararg,
                        kind: FunctionKind::Defined,
                    },
                    max_local: params.len().saturating_sub(1) as u32,
                });
            }
            "endfunc" => {
                let state = current
                    .take()
                    .ok_or_else(|| anyhow!("endfunc outside a function"))?;
                let id = self.function_names[&state.function.name] as usize;
                let mut function = state.function;
                function.locals = function.locals.max(state.max_local + 1);
                self.functions[id] = function;
            }
            "block" => {
                let state = current
                    .as_mut()
                    .ok_or_else(|| anyhow!("block outside a function"))?;
                // The first block exists implicitly; `block` before any
                // instruction reuses it.
                let blocks = &mut state.function.blocks;
                if !(blocks.len() == 1 && blocks[0].insts.is_empty()) {
                    blocks.push(Block { insts: Vec::new() });
                }
            }
            "entry" => {
                let name = words.next().ok_or_else(|| anyhow!("entry needs a name"))?;
                self.entry = Some(name.to_owned());
            }
            _ => {
                let state = current
                    .as_mut()
                    .ok_or_else(|| anyhow!("instruction outside a function"))?;
                let func_index = self.function_names[&state.function.name] as usize;
                let block_index = state.function.blocks.len() - 1;
                let inst_index = state.function.blocks[block_index].insts.len();
                let (inst, callee_fixup) = parse_inst(line, &self.global_names)?;
                if let Some(target) = callee_fixup {
                    self.fixups
                        .push((func_index, block_index, inst_index, target));
                }
                track_locals(&inst, &mut state.max_local);
                state.function.blocks[block_index].insts.push(inst);
            }
        }
        Ok(())
    }

    fn resolve_fixups(&mut self) -> Result<()> {
        let fixups = std::mem::take(&mut self.fixups);
        for (func, block, inst, name) in fixups {
            let id = match self.function_names.get(&name) {
                Some(&id) => id,
                None => {
                    let id = self.functions.len() as FuncId;
                    let kind = match Intrinsic::from_name(&name) {
                        Some(i) => FunctionKind::Intrinsic(i),
                        None => FunctionKind::External,
                    };
                    self.functions.push(Function {
                        name: name.clone(),
                        params: Vec::new(),
                        ret: None,
                        locals: 0,
                        blocks: Vec::new(),
                        vararg: true,
                        kind,
                    });
                    self.function_names.insert(name, id);
                    id
                }
            };
            if let Inst::Call { callee, .. } = &mut self.functions[func].blocks[block].insts[inst]
            {
                *callee = Operand::Function(id);
            }
        }
        Ok(())
    }
}

fn track_locals(inst: &Inst, max_local: &mut u32) {
    let dst = match inst {
        Inst::Alu { dst, .. }
        | Inst::Cmp { dst, .. }
        | Inst::Not { dst, .. }
        | Inst::Select { dst, .. }
        | Inst::Cast { dst, .. }
        | Inst::Phi { dst, .. }
        | Inst::Alloca { dst, .. }
        | Inst::Load { dst, .. } => Some(*dst),
        Inst::Call { dst, .. } => *dst,
        _ => None,
    };
    if let Some(dst) = dst {
        *max_local = (*max_local).max(dst);
    }
}

fn parse_params(spec: &str) -> Result<Vec<Width>> {
    let inner = spec
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| anyhow!("parameters must be parenthesized"))?;
    if inner.is_empty() {
        return Ok(Vec::new());
    }
    inner.split(',').map(parse_width).collect()
}

fn parse_width(word: &str) -> Result<Width> {
    let width: Width = word.trim().parse()?;
    match width {
        1 | 8 | 16 | 32 | 64 | 80 => Ok(width),
        _ => bail!("unsupported width {}", width),
    }
}

fn parse_value(word: &str) -> Result<ValueId> {
    word.strip_prefix('%')
        .ok_or_else(|| anyhow!("expected %value, got {}", word))?
        .parse()
        .map_err(|e| anyhow!("bad value id {}: {}", word, e))
}

fn parse_operand(word: &str, globals: &HashMap<String, u32>) -> Result<Operand> {
    if let Some(v) = word.strip_prefix('%') {
        return Ok(Operand::Value(v.parse()?));
    }
    if let Some(c) = word.strip_prefix('#') {
        let (bits, width) = c
            .split_once(':')
            .ok_or_else(|| anyhow!("constants are written #bits:width"))?;
        let value = if let Some(hex) = bits.strip_prefix("0x") {
            u128::from_str_radix(hex, 16)?
        } else {
            bits.parse::<u128>()?
        };
        return Ok(Operand::Const {
            bits: value,
            width: parse_width(width)?,
        });
    }
    if let Some(g) = word.strip_prefix('@') {
        let id = globals
            .get(g)
            .ok_or_else(|| anyhow!("unknown global {}", g))?;
        return Ok(Operand::Global(*id));
    }
    if let Some(b) = word.strip_prefix('^') {
        return Ok(Operand::BlockAddress(b.parse()?));
    }
    bail!("cannot parse operand {}", word)
}

/// Parses one instruction; a `call` returns the callee name for fixup.
fn parse_inst(line: &str, globals: &HashMap<String, u32>) -> Result<(Inst, Option<String>)> {
    let words: Vec<&str> = line.split_whitespace().collect();
    // Destination form: %N = op ...
    if words.len() >= 3 && words[1] == "=" {
        let dst = parse_value(words[0])?;
        let op = words[2];
        let operands = &words[3..];
        let inst = if let Some(alu) = parse_alu_op(op) {
            Inst::Alu {
                dst,
                op: alu,
                lhs: parse_operand(operands[0], globals)?,
                rhs: parse_operand(operands[1], globals)?,
            }
        } else if let Some(pred) = op.strip_prefix("cmp.") {
            Inst::Cmp {
                dst,
                pred: parse_cmp_pred(pred)?,
                lhs: parse_operand(operands[0], globals)?,
                rhs: parse_operand(operands[1], globals)?,
            }
        } else if op == "not" {
            Inst::Not {
                dst,
                src: parse_operand(operands[0], globals)?,
            }
        } else if op == "select" {
            Inst::Select {
                dst,
                cond: parse_operand(operands[0], globals)?,
                on_true: parse_operand(operands[1], globals)?,
                on_false: parse_operand(operands[2], globals)?,
            }
        } else if let Some(rest) = op.strip_prefix("cast.") {
            let (kind, width) = rest
                .split_once('.')
                .ok_or_else(|| anyhow!("casts are written cast.kind.width"))?;
            let cast = match kind {
                "trunc" => CastOp::Trunc,
                "zext" => CastOp::ZExt,
                "sext" => CastOp::SExt,
                other => bail!("unknown cast {}", other),
            };
            Inst::Cast {
                dst,
                op: cast,
                src: parse_operand(operands[0], globals)?,
                width: parse_width(width)?,
            }
        } else if op == "phi" {
            let incoming = parse_bracket_pairs(operands)?
                .into_iter()
                .map(|(block, value)| Ok((block.parse()?, parse_operand(&value, globals)?)))
                .collect::<Result<Vec<_>>>()?;
            Inst::Phi { dst, incoming }
        } else if op == "alloca" {
            Inst::Alloca {
                dst,
                size: parse_operand(operands[0], globals)?,
                align: operands.get(1).map_or(Ok(8), |w| w.parse())?,
            }
        } else if let Some(width) = op.strip_prefix("load.") {
            Inst::Load {
                dst,
                addr: parse_operand(operands[0], globals)?,
                width: parse_width(width)?,
            }
        } else if op == "call" {
            let name = operands
                .first()
                .ok_or_else(|| anyhow!("call needs a callee"))?;
            let args = operands[1..]
                .iter()
                .map(|w| parse_operand(w, globals))
                .collect::<Result<Vec<_>>>()?;
            return Ok((
                Inst::Call {
                    dst: Some(dst),
                    callee: Operand::Function(0),
                    args,
                },
                Some((*name).to_owned()),
            ));
        } else {
            bail!("unknown instruction {}", op);
        };
        return Ok((inst, None));
    }
    // Statement form.
    let op = words[0];
    let operands = &words[1..];
    let inst = match op {
        "store" => Inst::Store {
            addr: parse_operand(operands[0], globals)?,
            value: parse_operand(operands[1], globals)?,
        },
        "br" => Inst::Br {
            target: operands[0].parse()?,
        },
        "condbr" => Inst::CondBr {
            cond: parse_operand(operands[0], globals)?,
            on_true: operands[1].parse()?,
            on_false: operands[2].parse()?,
        },
        "switch" => {
            let cond = parse_operand(operands[0], globals)?;
            let default = operands[1].parse()?;
            let cases = parse_bracket_pairs(&operands[2..])?
                .into_iter()
                .map(|(value, block)| Ok((value.parse::<u128>()?, block.parse()?)))
                .collect::<Result<Vec<_>>>()?;
            Inst::Switch {
                cond,
                default,
                cases,
            }
        }
        "indirectbr" => {
            let addr = parse_operand(operands[0], globals)?;
            let targets = operands[1..]
                .iter()
                .map(|w| {
                    w.trim_matches(|c| c == '[' || c == ']')
                        .parse()
                        .map_err(Into::into)
                })
                .collect::<Result<Vec<_>>>()?;
            Inst::IndirectBr { addr, targets }
        }
        "call" => {
            let name = operands
                .first()
                .ok_or_else(|| anyhow!("call needs a callee"))?;
            let args = operands[1..]
                .iter()
                .map(|w| parse_operand(w, globals))
                .collect::<Result<Vec<_>>>()?;
            return Ok((
                Inst::Call {
                    dst: None,
                    callee: Operand::Function(0),
                    args,
                },
                Some((*name).to_owned()),
            ));
        }
        "ret" => Inst::Ret {
            value: operands
                .first()
                .map(|w| parse_operand(w, globals))
                .transpose()?,
        },
        "unreachable" => Inst::Unreachable,
        other => bail!("unknown instruction {}", other),
    };
    Ok((inst, None))
}

/// Parses `[first second] [first second] ...` groups.
fn parse_bracket_pairs(words: &[&str]) -> Result<Vec<(String, String)>> {
    let joined = words.join(" ");
    let mut result = Vec::new();
    for group in joined.split('[').skip(1) {
        let inner = group
            .split(']')
            .next()
            .ok_or_else(|| anyhow!("unterminated bracket group"))?;
        let mut parts = inner.split_whitespace();
        let first = parts
            .next()
            .ok_or_else(|| anyhow!("empty bracket group"))?
            .to_owned();
        let second = parts
            .next()
            .ok_or_else(|| anyhow!("bracket group needs two entries"))?
            .to_owned();
        result.push((first, second));
    }
    Ok(result)
}

fn parse_alu_op(op: &str) -> Option<AluOp> {
    Some(match op {
        "add" => AluOp::Add,
        "sub" => AluOp::Sub,
        "mul" => AluOp::Mul,
        "udiv" => AluOp::UDiv,
        "sdiv" => AluOp::SDiv,
        "urem" => AluOp::URem,
        "srem" => AluOp::SRem,
        "and" => AluOp::And,
        "or" => AluOp::Or,
        "xor" => AluOp::Xor,
        "shl" => AluOp::Shl,
        "lshr" => AluOp::LShr,
        "ashr" => AluOp::AShr,
        _ => return None,
    })
}

fn parse_cmp_pred(pred: &str) -> Result<CmpPred> {
    Ok(match pred {
        "eq" => CmpPred::Eq,
        "ne" => CmpPred::Ne,
        "ult" => CmpPred::Ult,
        "ule" => CmpPred::Ule,
        "ugt" => CmpPred::Ugt,
        "uge" => CmpPred::Uge,
        "slt" => CmpPred::Slt,
        "sle" => CmpPred::Sle,
        "sgt" => CmpPred::Sgt,
        "sge" => CmpPred::Sge,
        other => bail!("unknown comparison {}", other),
    })
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        bail!("hex contents need an even number of digits");
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_small_program() {
        let text = r#"
            # twice the first byte of input
            global greeting ro str:hi
            func main () -> 32
              %0 = alloca #4:64 4
              call make_symbolic %0 #4:64 @greeting
              %1 = load.32 %0
              %2 = cmp.ult %1 #10:32
              condbr %2 1 2
            block
              %3 = add %1 %1
              ret %3
            block
              ret %1
            endfunc
            entry main
        "#;
        let program = parse_program(text).unwrap();
        assert_eq!(program.functions.len(), 2);
        let main = program.function(program.entry);
        assert_eq!(main.blocks.len(), 3);
        assert_eq!(main.locals, 4);
        let intrinsic = program.function_named("make_symbolic").unwrap();
        assert!(matches!(
            program.function(intrinsic).kind,
            FunctionKind::Intrinsic(Intrinsic::MakeSymbolic)
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_program("bogus line").is_err());
        assert!(parse_program("func f ()\n  frobnicate %0\nendfunc\nentry f").is_err());
    }
}
