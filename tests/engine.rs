mod common;

use common::{run_program, word_from_le};
use griffin::executor::{ExecutorConfig, ExitReason, TerminationKind};
use griffin::expr::{INT32, INT8};
use griffin::llir::builder::{FunctionBuilder, ProgramBuilder};
use griffin::llir::{AluOp, CastOp, CmpPred, Inst, Intrinsic, Operand, Program};
use griffin::path::PathEntry;

/// `x = symbolic_u32(); if (x < 10) return 1; else return 0;`
fn symbolic_branch_program() -> Program {
    let mut pb = ProgramBuilder::new();
    let name = pb.string_global("x_name", "x");
    let make_symbolic = pb.intrinsic(Intrinsic::MakeSymbolic);

    let mut f = FunctionBuilder::new("main", &[], Some(INT32));
    let buf = f.alloca(Operand::const_u64(4, 64), 4);
    f.push(Inst::Call {
        dst: None,
        callee: Operand::Function(make_symbolic),
        args: vec![buf.clone(), Operand::const_u64(4, 64), Operand::Global(name)],
    });
    let x = f.load(buf, INT32);
    let c = f.cmp(CmpPred::Ult, x, Operand::const_u64(10, INT32));
    let low = f.block();
    let high = f.block();
    f.condbr(c, low, high);
    f.switch_to(low);
    f.ret(Some(Operand::const_u64(1, INT32)));
    f.switch_to(high);
    f.ret(Some(Operand::const_u64(0, INT32)));

    let main = pb.add_function(f.finish());
    pb.finish(main)
}

#[test]
fn symbolic_branch_forks_once() {
    let program = symbolic_branch_program();
    let tests = run_program(&program, ExecutorConfig::default());
    assert_eq!(tests.len(), 2, "one state per side of the branch");

    let mut seen_low = false;
    let mut seen_high = false;
    for test in &tests {
        assert_eq!(test.path.len(), 1, "exactly one recorded decision");
        let PathEntry::Fork { taken } = test.path[0] else {
            panic!("expected a fork entry, got {:?}", test.path[0]);
        };
        let ExitReason::Exit { code } = test.reason else {
            panic!("expected a normal exit, got {}", test.reason);
        };
        let (ref name, ref bytes) = test.objects[0];
        assert_eq!(name, "x");
        let x = word_from_le(bytes);
        if taken {
            seen_low = true;
            assert_eq!(code, 1);
            assert!(x < 10, "witness {} should take the low branch", x);
        } else {
            seen_high = true;
            assert_eq!(code, 0);
            assert!(x >= 10, "witness {} should take the high branch", x);
        }
    }
    assert!(seen_low && seen_high);
}

/// `buf[16] = symbolic; i = symbolic_u32(); assume(i < 16); touch(buf[i]);`
fn indexed_read_program() -> Program {
    let mut pb = ProgramBuilder::new();
    let buf_name = pb.string_global("buf_name", "buf");
    let i_name = pb.string_global("i_name", "i");
    let make_symbolic = pb.intrinsic(Intrinsic::MakeSymbolic);
    let assume = pb.intrinsic(Intrinsic::Assume);

    let mut f = FunctionBuilder::new("main", &[], Some(INT32));
    let buf = f.alloca(Operand::const_u64(16, 64), 8);
    let i_box = f.alloca(Operand::const_u64(4, 64), 4);
    f.push(Inst::Call {
        dst: None,
        callee: Operand::Function(make_symbolic),
        args: vec![
            buf.clone(),
            Operand::const_u64(16, 64),
            Operand::Global(buf_name),
        ],
    });
    f.push(Inst::Call {
        dst: None,
        callee: Operand::Function(make_symbolic),
        args: vec![
            i_box.clone(),
            Operand::const_u64(4, 64),
            Operand::Global(i_name),
        ],
    });
    let i = f.load(i_box, INT32);
    let in_range = f.cmp(CmpPred::Ult, i.clone(), Operand::const_u64(16, INT32));
    f.push(Inst::Call {
        dst: None,
        callee: Operand::Function(assume),
        args: vec![in_range],
    });
    let wide = f.cast(CastOp::ZExt, i, 64);
    let addr = f.alu(AluOp::Add, buf, wide);
    let _byte = f.load(addr, INT8);
    f.ret(Some(Operand::const_u64(0, INT32)));

    let main = pb.add_function(f.finish());
    pb.finish(main)
}

#[test]
fn bounded_symbolic_index_stays_symbolic() {
    let program = indexed_read_program();
    let tests = run_program(&program, ExecutorConfig::default());
    assert_eq!(tests.len(), 1, "no fork, no concretization");
    let test = &tests[0];
    assert!(test.path.is_empty(), "no recorded decisions");
    assert!(
        test.constraints.contains("Ult"),
        "the assumption survives as the only constraint: {}",
        test.constraints
    );
    let i = test
        .objects
        .iter()
        .find(|(name, _)| name == "i")
        .map(|(_, bytes)| word_from_le(bytes))
        .unwrap();
    assert!(i < 16);
}

#[test]
fn size_cap_concretizes_the_index() {
    let program = indexed_read_program();
    let config = ExecutorConfig {
        max_sym_array_size: 8,
        ..ExecutorConfig::default()
    };
    let tests = run_program(&program, config);
    assert_eq!(tests.len(), 1, "concretization does not fork");
    let test = &tests[0];
    assert!(test.path.is_empty());
    // The pinning equality replaced the assumption entirely.
    assert!(
        test.constraints.contains("Eq"),
        "expected the concretization equality in: {}",
        test.constraints
    );
    let i = test
        .objects
        .iter()
        .find(|(name, _)| name == "i")
        .map(|(_, bytes)| word_from_le(bytes))
        .unwrap();
    assert!(i < 16, "the pinned index {} still satisfies the assumption", i);
}

/// `p = malloc(4); *(p + 7) = 1;`
fn out_of_bounds_program() -> Program {
    let mut pb = ProgramBuilder::new();
    let malloc = pb.intrinsic(Intrinsic::Malloc);

    let mut f = FunctionBuilder::new("main", &[], Some(INT32));
    let p = f.call(malloc, vec![Operand::const_u64(4, 64)]);
    let q = f.alu(AluOp::Add, p, Operand::const_u64(7, 64));
    f.store(q, Operand::const_u64(1, INT8));
    f.ret(Some(Operand::const_u64(0, INT32)));

    let main = pb.add_function(f.finish());
    pb.finish(main)
}

#[test]
fn out_of_bounds_store_reports_ptr_error() {
    let program = out_of_bounds_program();
    let tests = run_program(&program, ExecutorConfig::default());
    assert_eq!(tests.len(), 1);
    let test = &tests[0];
    match &test.reason {
        ExitReason::Error { kind, message } => {
            assert_eq!(*kind, TerminationKind::Ptr);
            assert!(
                message.contains("address"),
                "the report should name the faulting address: {}",
                message
            );
        }
        other => panic!("expected a pointer error, got {}", other),
    }
}

/// An indirect branch over three labels with the third excluded by an
/// assumption; the selector is a single symbolic byte.
fn indirect_branch_program() -> Program {
    let mut pb = ProgramBuilder::new();
    let sel_name = pb.string_global("sel_name", "sel");
    let make_symbolic = pb.intrinsic(Intrinsic::MakeSymbolic);
    let assume = pb.intrinsic(Intrinsic::Assume);

    let mut f = FunctionBuilder::new("main", &[], Some(INT32));
    let l0 = f.block();
    let l1 = f.block();
    let l2 = f.block();

    let sel_box = f.alloca(Operand::const_u64(1, 64), 1);
    f.push(Inst::Call {
        dst: None,
        callee: Operand::Function(make_symbolic),
        args: vec![
            sel_box.clone(),
            Operand::const_u64(1, 64),
            Operand::Global(sel_name),
        ],
    });
    let sel = f.load(sel_box, INT8);
    let is_zero = f.cmp(CmpPred::Eq, sel.clone(), Operand::const_u64(0, INT8));
    let is_one = f.cmp(CmpPred::Eq, sel, Operand::const_u64(1, INT8));
    let tail = f.select(
        is_one,
        Operand::BlockAddress(l1),
        Operand::BlockAddress(l2),
    );
    let target = f.select(is_zero, Operand::BlockAddress(l0), tail);
    let not_l2 = f.cmp(CmpPred::Ne, target.clone(), Operand::BlockAddress(l2));
    f.push(Inst::Call {
        dst: None,
        callee: Operand::Function(assume),
        args: vec![not_l2],
    });
    f.push(Inst::IndirectBr {
        addr: target,
        targets: vec![l0, l1, l2],
    });
    for (block, code) in [(l0, 0u64), (l1, 1), (l2, 2)] {
        f.switch_to(block);
        f.ret(Some(Operand::const_u64(code, INT32)));
    }

    let main = pb.add_function(f.finish());
    pb.finish(main)
}

#[test]
fn indirect_branch_visits_only_feasible_targets() {
    let program = indirect_branch_program();
    let tests = run_program(&program, ExecutorConfig::default());
    assert_eq!(tests.len(), 2, "L2 and the illegal case are infeasible");

    let mut targets = Vec::new();
    for test in &tests {
        let ExitReason::Exit { code } = test.reason else {
            panic!("expected a normal exit, got {}", test.reason);
        };
        assert!(code < 2, "the L2 label must never execute");
        assert_eq!(test.path.len(), 1);
        let PathEntry::IndirectBr { target } = test.path[0] else {
            panic!("expected an indirectbr entry, got {:?}", test.path[0]);
        };
        targets.push(target);
    }
    targets.sort_unstable();
    assert_eq!(targets, vec![0, 1]);
}

/// A branch on `x * x == 99`, which the word-level solver cannot decide.
fn undecidable_branch_program() -> Program {
    let mut pb = ProgramBuilder::new();
    let name = pb.string_global("x_name", "x");
    let make_symbolic = pb.intrinsic(Intrinsic::MakeSymbolic);

    let mut f = FunctionBuilder::new("main", &[], Some(INT32));
    let buf = f.alloca(Operand::const_u64(4, 64), 4);
    f.push(Inst::Call {
        dst: None,
        callee: Operand::Function(make_symbolic),
        args: vec![buf.clone(), Operand::const_u64(4, 64), Operand::Global(name)],
    });
    let x = f.load(buf, INT32);
    let sq = f.alu(AluOp::Mul, x.clone(), x);
    let c = f.cmp(CmpPred::Eq, sq, Operand::const_u64(99, INT32));
    let yes = f.block();
    let no = f.block();
    f.condbr(c, yes, no);
    f.switch_to(yes);
    f.ret(Some(Operand::const_u64(1, INT32)));
    f.switch_to(no);
    f.ret(Some(Operand::const_u64(0, INT32)));

    let main = pb.add_function(f.finish());
    pb.finish(main)
}

#[test]
fn inhibited_fork_picks_one_side_on_timeout() {
    let program = undecidable_branch_program();
    let config = ExecutorConfig {
        max_forks: 0,
        ..ExecutorConfig::default()
    };
    let tests = run_program(&program, config);
    assert_eq!(tests.len(), 1, "forking was inhibited");
    let test = &tests[0];
    assert_eq!(test.path.len(), 1);
    assert!(matches!(test.path[0], PathEntry::Fork { .. }));
    assert!(
        matches!(test.reason, ExitReason::Exit { .. }),
        "the chosen side still runs to completion: {}",
        test.reason
    );
    assert!(
        !test.constraints.is_empty(),
        "the chosen branch constraint was added to the path condition"
    );
}
