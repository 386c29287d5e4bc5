//! Programmatic construction of LLIR programs, used by tests and by
//! front-ends that synthesize code.

use super::{
    AluOp, Block, BlockId, CastOp, CmpPred, FuncId, Function, FunctionKind, Global, GlobalId,
    Inst, Intrinsic, Operand, Program, ValueId,
};
use crate::expr::Width;

#[derive(Default)]
pub struct ProgramBuilder {
    functions: Vec<Function>,
    globals: Vec<Global>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(&mut self, name: &str, init: Vec<u8>, read_only: bool) -> GlobalId {
        let id = self.globals.len() as GlobalId;
        self.globals.push(Global {
            name: name.to_owned(),
            size: init.len() as u64,
            init,
            read_only,
        });
        id
    }

    pub fn zeroed_global(&mut self, name: &str, size: u64) -> GlobalId {
        self.global(name, vec![0; size as usize], false)
    }

    pub fn string_global(&mut self, name: &str, text: &str) -> GlobalId {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        self.global(name, bytes, true)
    }

    /// Registers an intrinsic declaration, reusing an existing entry.
    pub fn intrinsic(&mut self, which: Intrinsic) -> FuncId {
        if let Some(pos) = self
            .functions
            .iter()
            .position(|f| matches!(f.kind, FunctionKind::Intrinsic(i) if i == which))
        {
            return pos as FuncId;
        }
        let id = self.functions.len() as FuncId;
        self.functions.push(Function {
            name: which.name().to_owned(),
            params: Vec::new(),
            ret: None,
            locals: 0,
            blocks: Vec::new(),
            vararg: true,
            kind: FunctionKind::Intrinsic(which),
        });
        id
    }

    /// Registers an external declaration.
    pub fn external(&mut self, name: &str, params: &[Width], ret: Option<Width>) -> FuncId {
        let id = self.functions.len() as FuncId;
        self.functions.push(Function {
            name: name.to_owned(),
            params: params.to_vec(),
            ret,
            locals: 0,
            blocks: Vec::new(),
            vararg: false,
            kind: FunctionKind::External,
        });
        id
    }

    pub fn add_function(&mut self, function: Function) -> FuncId {
        let id = self.functions.len() as FuncId;
        self.functions.push(function);
        id
    }

    /// Reserves the id of a function defined later, for mutual recursion.
    pub fn reserve_function(&mut self, name: &str) -> FuncId {
        let id = self.functions.len() as FuncId;
        self.functions.push(Function {
            name: name.to_owned(),
            params: Vec::new(),
            ret: None,
            locals: 0,
            blocks: Vec::new(),
            vararg: false,
            kind: FunctionKind::Defined,
        });
        id
    }

    pub fn define_reserved(&mut self, id: FuncId, function: Function) {
        self.functions[id as usize] = function;
    }

    pub fn finish(self, entry: FuncId) -> Program {
        Program {
            functions: self.functions,
            globals: self.globals,
            entry,
        }
    }
}

pub struct FunctionBuilder {
    name: String,
    params: Vec<Width>,
    ret: Option<Width>,
    locals: u32,
    blocks: Vec<Block>,
    current: BlockId,
    vararg: bool,
}

impl FunctionBuilder {
    pub fn new(name: &str, params: &[Width], ret: Option<Width>) -> Self {
        Self {
            name: name.to_owned(),
            params: params.to_vec(),
            ret,
            locals: params.len() as u32,
            blocks: vec![Block { insts: Vec::new() }],
            current: 0,
            vararg: false,
        }
    }

    pub fn vararg(mut self) -> Self {
        self.vararg = true;
        self
    }

    pub fn param(&self, index: u32) -> Operand {
        debug_assert!(index < self.params.len() as u32);
        Operand::Value(index)
    }

    pub fn fresh(&mut self) -> ValueId {
        let id = self.locals;
        self.locals += 1;
        id
    }

    pub fn block(&mut self) -> BlockId {
        let id = self.blocks.len() as BlockId;
        self.blocks.push(Block { insts: Vec::new() });
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn push(&mut self, inst: Inst) {
        self.blocks[self.current as usize].insts.push(inst);
    }

    pub fn alu(&mut self, op: AluOp, lhs: Operand, rhs: Operand) -> Operand {
        let dst = self.fresh();
        self.push(Inst::Alu { dst, op, lhs, rhs });
        Operand::Value(dst)
    }

    pub fn cmp(&mut self, pred: CmpPred, lhs: Operand, rhs: Operand) -> Operand {
        let dst = self.fresh();
        self.push(Inst::Cmp {
            dst,
            pred,
            lhs,
            rhs,
        });
        Operand::Value(dst)
    }

    pub fn cast(&mut self, op: CastOp, src: Operand, width: Width) -> Operand {
        let dst = self.fresh();
        self.push(Inst::Cast {
            dst,
            op,
            src,
            width,
        });
        Operand::Value(dst)
    }

    pub fn select(&mut self, cond: Operand, on_true: Operand, on_false: Operand) -> Operand {
        let dst = self.fresh();
        self.push(Inst::Select {
            dst,
            cond,
            on_true,
            on_false,
        });
        Operand::Value(dst)
    }

    pub fn alloca(&mut self, size: Operand, align: u32) -> Operand {
        let dst = self.fresh();
        self.push(Inst::Alloca { dst, size, align });
        Operand::Value(dst)
    }

    pub fn load(&mut self, addr: Operand, width: Width) -> Operand {
        let dst = self.fresh();
        self.push(Inst::Load { dst, addr, width });
        Operand::Value(dst)
    }

    pub fn store(&mut self, addr: Operand, value: Operand) {
        self.push(Inst::Store { addr, value });
    }

    pub fn phi(&mut self, incoming: Vec<(BlockId, Operand)>) -> Operand {
        let dst = self.fresh();
        self.push(Inst::Phi { dst, incoming });
        Operand::Value(dst)
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(Inst::Br { target });
    }

    pub fn condbr(&mut self, cond: Operand, on_true: BlockId, on_false: BlockId) {
        self.push(Inst::CondBr {
            cond,
            on_true,
            on_false,
        });
    }

    pub fn call(&mut self, callee: FuncId, args: Vec<Operand>) -> Operand {
        let dst = self.fresh();
        self.push(Inst::Call {
            dst: Some(dst),
            callee: Operand::Function(callee),
            args,
        });
        Operand::Value(dst)
    }

    pub fn call_void(&mut self, callee: FuncId, args: Vec<Operand>) {
        self.push(Inst::Call {
            dst: None,
            callee: Operand::Function(callee),
            args,
        });
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(Inst::Ret { value });
    }

    pub fn finish(self) -> Function {
        Function {
            name: self.name,
            params: self.params,
            ret: self.ret,
            locals: self.locals,
            blocks: self.blocks,
            vararg: self.vararg,
            kind: FunctionKind::Defined,
        }
    }
}
