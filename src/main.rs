mod cli;

use anyhow::{Context, Result};
use bytesize::ByteSize;
use griffin::executor::{
    AddressInfoLevel, Executor, ExecutorConfig, ExternalPolicy, TerminationKind, TraceSink,
};
use griffin::llir::parse::load_program;
use griffin::searcher::SearcherKind;
use griffin::solver::{BackendKind, SolverConfig};
use griffin::{path, stats};
use log::info;
use std::path::{Path, PathBuf};
use std::process;
use std::str::FromStr;
use std::time::Duration;

fn main() {
    env_logger::init();
    if let Err(error) = run() {
        eprintln!("error: {:#}", error);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = cli::args().get_matches();
    match matches.subcommand() {
        Some(("run", m)) => execute(m),
        _ => unreachable!("a subcommand is required"),
    }
}

fn execute(m: &clap::ArgMatches) -> Result<()> {
    let program_path = PathBuf::from(m.get_one::<String>("program").unwrap());
    let program = load_program(&program_path)?;

    let mut config = ExecutorConfig {
        max_instructions: parse_num(m, "max-instructions")?,
        max_depth: parse_num::<u32>(m, "max-depth")?,
        max_stack_frames: parse_num::<usize>(m, "max-stack-frames")?,
        max_sym_array_size: parse_num(m, "max-sym-array-size")?,
        simplify_sym_indices: m.get_flag("simplify-sym-indices"),
        equality_substitution: !m.get_flag("no-equality-substitution"),
        rewrite_equalities: !m.get_flag("no-rewrite-equalities"),
        max_memory_inhibit: m.get_flag("max-memory-inhibit"),
        seed: parse_num(m, "seed")?,
        ..ExecutorConfig::default()
    };
    if let Some(seconds) = m.get_one::<String>("max-time") {
        config.max_time = Some(Duration::from_secs(seconds.parse()?));
    }
    if let Some(n) = m.get_one::<String>("max-forks") {
        config.max_forks = n.parse()?;
    }
    if let Some(mb) = m.get_one::<String>("max-memory") {
        config.max_memory = Some(ByteSize::mib(mb.parse()?));
    }
    config.external_calls = ExternalPolicy::from_str(
        m.get_one::<String>("external-calls").unwrap(),
    )
    .expect("validated by clap");
    if let Some(kind) = m.get_one::<String>("exit-on-error-type") {
        config.exit_on_error_kind = Some(TerminationKind::from_str(kind).expect("validated"));
    }
    config.searcher =
        SearcherKind::from_str(m.get_one::<String>("searcher").unwrap()).expect("validated");
    config.address_info = match m.get_one::<String>("address-info").unwrap().as_str() {
        "full" => AddressInfoLevel::Full,
        _ => AddressInfoLevel::None,
    };
    if let Some(dest) = m.get_one::<String>("debug-print-instructions") {
        match dest.as_str() {
            "stderr" => config.trace = TraceSink::Stderr,
            other => {
                let path = other.strip_prefix("file:").unwrap_or(other);
                config.trace = TraceSink::File;
                config.trace_file = Some(PathBuf::from(path));
            }
        }
    }

    let solver_config = SolverConfig {
        backend: BackendKind::from_str(m.get_one::<String>("solver").unwrap())
            .expect("validated"),
        smt_solver_path: PathBuf::from(m.get_one::<String>("smt-solver-path").unwrap()),
        timeout: Some(Duration::from_secs(parse_num(m, "solver-timeout")?)),
        ..SolverConfig::default()
    };

    let replay = match m.get_one::<String>("replay") {
        Some(file) => {
            let bytes = std::fs::read(file)
                .with_context(|| format!("cannot read replay stream {}", file))?;
            Some(path::parse_stream(&bytes)?)
        }
        None => None,
    };

    let output_dir = Path::new(m.get_one::<String>("output-dir").unwrap());
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("cannot create {}", output_dir.display()))?;

    let mut executor = Executor::new(&program, config, &solver_config)?;
    let summary = executor.run(replay)?;

    for (index, test) in summary.test_cases.iter().enumerate() {
        test.write_to_dir(output_dir, index + 1)?;
        info!("test{:06}: {}", index + 1, test.reason);
    }
    println!(
        "done: {} paths, {} instructions{}",
        summary.test_cases.len(),
        summary.instructions,
        if summary.halted { " (halted)" } else { "" }
    );
    println!("{}", stats::Summary);
    Ok(())
}

fn parse_num<T: FromStr>(m: &clap::ArgMatches, name: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(m.get_one::<String>(name).unwrap().parse()?)
}
