use griffin::executor::{Executor, ExecutorConfig, TestCase};
use griffin::llir::Program;
use griffin::path::PathEntry;
use griffin::solver::SolverConfig;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn run_program(program: &Program, config: ExecutorConfig) -> Vec<TestCase> {
    init();
    let solver = SolverConfig::default();
    let mut executor = Executor::new(program, config, &solver).expect("executor setup");
    executor.run(None).expect("run").test_cases
}

#[allow(dead_code)]
pub fn replay_program(
    program: &Program,
    config: ExecutorConfig,
    stream: Vec<PathEntry>,
) -> Vec<TestCase> {
    init();
    let solver = SolverConfig::default();
    let mut executor = Executor::new(program, config, &solver).expect("executor setup");
    executor.run(Some(stream)).expect("replay run").test_cases
}

#[allow(dead_code)]
pub fn word_from_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[0..4].try_into().unwrap())
}
