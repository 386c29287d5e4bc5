mod common;

use common::{init, replay_program, run_program};
use griffin::executor::{ExecutorConfig, ExitReason, TerminationKind};
use griffin::expr::INT32;
use griffin::llir::builder::{FunctionBuilder, ProgramBuilder};
use griffin::llir::{AluOp, CmpPred, Inst, Intrinsic, Operand, Program};
use griffin::path::{parse_stream, PathEntry, PathRecorder};

fn branching_program() -> Program {
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
    let c = f.cmp(CmpPred::Ult, x.clone(), Operand::const_u64(100, INT32));
    let low = f.block();
    let high = f.block();
    f.condbr(c, low, high);
    f.switch_to(low);
    let c2 = f.cmp(CmpPred::Ult, x, Operand::const_u64(50, INT32));
    let lower = f.block();
    let upper = f.block();
    f.condbr(c2, lower, upper);
    f.switch_to(lower);
    f.ret(Some(Operand::const_u64(2, INT32)));
    f.switch_to(upper);
    f.ret(Some(Operand::const_u64(1, INT32)));
    f.switch_to(high);
    f.ret(Some(Operand::const_u64(0, INT32)));

    let main = pb.add_function(f.finish());
    pb.finish(main)
}

#[test]
fn replay_reproduces_every_recorded_path() {
    let program = branching_program();
    let tests = run_program(&program, ExecutorConfig::default());
    assert_eq!(tests.len(), 3);

    for original in &tests {
        let replayed = replay_program(
            &program,
            ExecutorConfig::default(),
            original.path.clone(),
        );
        assert_eq!(replayed.len(), 1, "replay explores exactly one path");
        let replayed = &replayed[0];
        assert_eq!(
            format!("{}", replayed.reason),
            format!("{}", original.reason),
            "termination reasons must agree"
        );
        assert_eq!(
            replayed.path, original.path,
            "the re-recorded stream is identical"
        );
    }
}

/// `assume(x < 10); if (x < 100) ...` — the branch is entailed by the
/// assumption, so its direction is provable and a flipped recording must
/// be caught as a divergence.
fn entailed_branch_program() -> Program {
    let mut pb = ProgramBuilder::new();
    let name = pb.string_global("x_name", "x");
    let make_symbolic = pb.intrinsic(Intrinsic::MakeSymbolic);
    let assume = pb.intrinsic(Intrinsic::Assume);

    let mut f = FunctionBuilder::new("main", &[], Some(INT32));
    let buf = f.alloca(Operand::const_u64(4, 64), 4);
    f.push(Inst::Call {
        dst: None,
        callee: Operand::Function(make_symbolic),
        args: vec![buf.clone(), Operand::const_u64(4, 64), Operand::Global(name)],
    });
    let x = f.load(buf, INT32);
    let small = f.cmp(CmpPred::Ult, x.clone(), Operand::const_u64(10, INT32));
    f.push(Inst::Call {
        dst: None,
        callee: Operand::Function(assume),
        args: vec![small],
    });
    let c = f.cmp(CmpPred::Ult, x, Operand::const_u64(100, INT32));
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
fn corrupted_fork_entry_raises_replay_path() {
    let program = entailed_branch_program();
    let tests = run_program(&program, ExecutorConfig::default());
    assert_eq!(tests.len(), 1, "the branch direction is provable");
    assert_eq!(tests[0].path, vec![PathEntry::Fork { taken: true }]);
    assert!(matches!(tests[0].reason, ExitReason::Exit { code: 1 }));

    // Hand-corrupt the stream: claim the impossible side was taken.
    let corrupted = vec![PathEntry::Fork { taken: false }];
    let replayed = replay_program(&program, ExecutorConfig::default(), corrupted);
    assert_eq!(replayed.len(), 1);
    match &replayed[0].reason {
        ExitReason::Error { kind, .. } => assert_eq!(*kind, TerminationKind::ReplayPath),
        other => panic!("expected a replay divergence, got {}", other),
    }
}

#[test]
fn recorded_streams_round_trip_through_serialization() {
    init();
    let program = branching_program();
    let tests = run_program(&program, ExecutorConfig::default());
    for test in &tests {
        let mut recorder = PathRecorder::default();
        for entry in &test.path {
            recorder.record(entry.clone());
        }
        let bytes = recorder.serialize();
        assert_eq!(parse_stream(&bytes).unwrap(), test.path);
    }
}

/// Two cooperative threads bump a shared counter; every yield emits one
/// schedule entry, and the final counter value is concretized into the
/// data-record stream.
fn threaded_counter_program() -> Program {
    let mut pb = ProgramBuilder::new();
    let counter = pb.zeroed_global("counter", 4);
    let thread_create = pb.intrinsic(Intrinsic::ThreadCreate);
    let thread_yield = pb.intrinsic(Intrinsic::ThreadYield);
    let record_value = pb.intrinsic(Intrinsic::RecordValue);

    let increment = |f: &mut FunctionBuilder| {
        let value = f.load(Operand::Global(counter), INT32);
        let bumped = f.alu(AluOp::Add, value, Operand::const_u64(1, INT32));
        f.store(Operand::Global(counter), bumped);
    };

    let mut worker = FunctionBuilder::new("worker", &[], None);
    increment(&mut worker);
    worker.push(Inst::Call {
        dst: None,
        callee: Operand::Function(thread_yield),
        args: vec![],
    });
    increment(&mut worker);
    worker.ret(None);
    let worker_id = pb.add_function(worker.finish());

    let mut main = FunctionBuilder::new("main", &[], Some(INT32));
    main.push(Inst::Call {
        dst: None,
        callee: Operand::Function(thread_create),
        args: vec![Operand::Function(worker_id), Operand::const_u64(0, 64)],
    });
    increment(&mut main);
    main.push(Inst::Call {
        dst: None,
        callee: Operand::Function(thread_yield),
        args: vec![],
    });
    increment(&mut main);
    let value = main.load(Operand::Global(counter), INT32);
    main.push(Inst::Call {
        dst: None,
        callee: Operand::Function(record_value),
        args: vec![value],
    });
    main.ret(Some(Operand::const_u64(0, INT32)));
    let main_id = pb.add_function(main.finish());

    pb.finish(main_id)
}

#[test]
fn cooperative_threads_replay_to_the_same_counter() {
    let program = threaded_counter_program();
    let tests = run_program(&program, ExecutorConfig::default());
    assert_eq!(tests.len(), 1, "no symbolic branching");
    let original = &tests[0];
    assert!(matches!(original.reason, ExitReason::Exit { code: 0 }));

    let schedules: Vec<u64> = original
        .path
        .iter()
        .filter_map(|e| match e {
            PathEntry::Schedule { thread } => Some(*thread),
            _ => None,
        })
        .collect();
    assert!(
        schedules.len() >= 3,
        "creation, yields and thread exit each schedule: {:?}",
        schedules
    );

    let recorded_counter = original
        .path
        .iter()
        .find_map(|e| match e {
            PathEntry::DataRec { bytes, .. } => Some(bytes.clone()),
            _ => None,
        })
        .expect("the final counter is data-recorded");
    assert_eq!(
        u32::from_le_bytes(recorded_counter.clone().try_into().unwrap()),
        4,
        "both threads incremented twice"
    );

    let replayed = replay_program(
        &program,
        ExecutorConfig::default(),
        original.path.clone(),
    );
    assert_eq!(replayed.len(), 1);
    assert_eq!(
        replayed[0].path, original.path,
        "replay is byte-identical, counter included"
    );
}
