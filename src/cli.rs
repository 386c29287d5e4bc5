use clap::{crate_version, Arg, ArgAction, Command};
use strum::VariantNames;

use griffin::executor::{ExternalPolicy, TerminationKind};
use griffin::searcher::SearcherKind;
use griffin::solver::BackendKind;

pub fn args() -> Command {
    Command::new("griffin")
        .version(crate_version!())
        .about("Symbolic virtual machine for typed SSA programs")
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Symbolically execute a program, emitting one test case per explored path")
                .arg(
                    Arg::new("program")
                        .value_name("FILE")
                        .help("Textual LLIR program to interpret")
                        .required(true),
                )
                .arg(
                    Arg::new("output-dir")
                        .short('o')
                        .long("output-dir")
                        .value_name("DIR")
                        .help("Directory receiving test cases and path streams")
                        .default_value("griffin-out"),
                )
                .arg(
                    Arg::new("max-time")
                        .long("max-time")
                        .value_name("SECONDS")
                        .help("Halt after this wall duration"),
                )
                .arg(
                    Arg::new("max-instructions")
                        .long("max-instructions")
                        .value_name("N")
                        .help("Instruction budget; 0 disables")
                        .default_value("0"),
                )
                .arg(
                    Arg::new("max-forks")
                        .long("max-forks")
                        .value_name("N")
                        .help("Cap on lifetime forks"),
                )
                .arg(
                    Arg::new("max-depth")
                        .long("max-depth")
                        .value_name("N")
                        .help("Cap on symbolic-branch depth per path; 0 disables")
                        .default_value("0"),
                )
                .arg(
                    Arg::new("max-memory")
                        .long("max-memory")
                        .value_name("MB")
                        .help("Memory cap in megabytes"),
                )
                .arg(
                    Arg::new("max-memory-inhibit")
                        .long("max-memory-inhibit")
                        .help("Inhibit forking at the memory cap instead of killing states")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("max-stack-frames")
                        .long("max-stack-frames")
                        .value_name("N")
                        .default_value("8192"),
                )
                .arg(
                    Arg::new("max-sym-array-size")
                        .long("max-sym-array-size")
                        .value_name("BYTES")
                        .help("Concretize symbolic indices into larger arrays; 0 disables")
                        .default_value("0"),
                )
                .arg(
                    Arg::new("simplify-sym-indices")
                        .long("simplify-sym-indices")
                        .help("Pre-simplify addresses via equality substitution")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("no-equality-substitution")
                        .long("no-equality-substitution")
                        .help("Disable equality substitution in expression simplification")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("no-rewrite-equalities")
                        .long("no-rewrite-equalities")
                        .help("Disable rewriting existing constraints on Eq(const, x)")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    Arg::new("external-calls")
                        .long("external-calls")
                        .value_name("POLICY")
                        .value_parser(clap::builder::PossibleValuesParser::new(
                            ExternalPolicy::VARIANTS.iter().copied(),
                        ))
                        .default_value("concrete"),
                )
                .arg(
                    Arg::new("exit-on-error-type")
                        .long("exit-on-error-type")
                        .value_name("KIND")
                        .help("Halt on the first error of this kind")
                        .value_parser(clap::builder::PossibleValuesParser::new(
                            TerminationKind::VARIANTS.iter().copied(),
                        )),
                )
                .arg(
                    Arg::new("debug-print-instructions")
                        .long("debug-print-instructions")
                        .value_name("DEST")
                        .help("Trace executed instructions to stderr or file:PATH"),
                )
                .arg(
                    Arg::new("searcher")
                        .long("searcher")
                        .value_name("POLICY")
                        .value_parser(clap::builder::PossibleValuesParser::new(
                            SearcherKind::VARIANTS.iter().copied(),
                        ))
                        .default_value("depth-first"),
                )
                .arg(
                    Arg::new("solver")
                        .long("solver")
                        .value_name("BACKEND")
                        .value_parser(clap::builder::PossibleValuesParser::new(
                            BackendKind::VARIANTS.iter().copied(),
                        ))
                        .default_value("search"),
                )
                .arg(
                    Arg::new("smt-solver-path")
                        .long("smt-solver-path")
                        .value_name("PATH")
                        .default_value("z3"),
                )
                .arg(
                    Arg::new("solver-timeout")
                        .long("solver-timeout")
                        .value_name("SECONDS")
                        .default_value("30"),
                )
                .arg(
                    Arg::new("address-info")
                        .long("address-info")
                        .value_name("LEVEL")
                        .value_parser(["none", "full"])
                        .default_value("none"),
                )
                .arg(
                    Arg::new("replay")
                        .long("replay")
                        .value_name("PATHFILE")
                        .help("Replay a recorded path stream"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_name("N")
                        .default_value("24121"),
                ),
        )
}
