use std::path::PathBuf;

use clap::{Parser, Subcommand};

use dtest::cli::commands::{self, RunOptions};
use dtest::logging::{LogLevel, init_logger};

#[derive(Parser)]
#[command(name = "dtest", about = "dtest: dependency-aware concurrent test runner", version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a suite manifest
    Run {
        /// Suite manifest (YAML)
        manifest: PathBuf,

        /// Worker threads (default: available parallelism)
        #[arg(short = 'j', long = "jobs")]
        jobs: Option<usize>,

        /// Also run nodes marked skip
        #[arg(long)]
        no_skip: bool,

        /// Skip tests with attribute ATTR, or ATTR=VALUE
        #[arg(long, value_name = "ATTR[=VALUE]")]
        skip: Option<String>,

        /// What a skipped prerequisite does to its dependents: fail, skip, ignore
        #[arg(long, default_value = "fail")]
        skip_propagation: String,

        /// Cap on live instances per resource descriptor
        #[arg(long)]
        max_instances: Option<usize>,

        /// Output format: text, json, yaml, junit
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List nodes in discovery order without running them
    List {
        /// Suite manifest (YAML)
        manifest: PathBuf,
    },

    /// Render the dependency graph as Graphviz DOT
    Dot {
        /// Suite manifest (YAML)
        manifest: PathBuf,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logger(LogLevel::from_verbosity(cli.verbose));

    match cli.command {
        Some(Commands::Run {
            manifest,
            jobs,
            no_skip,
            skip,
            skip_propagation,
            max_instances,
            format,
            output,
        }) => {
            let options = RunOptions {
                manifest,
                workers: jobs,
                run_skipped: no_skip,
                skip,
                skip_propagation,
                max_instances,
                format,
                output,
                verbose: cli.verbose > 0,
            };
            match commands::run_run(&options) {
                Ok(true) => {}
                Ok(false) => std::process::exit(1),
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::List { manifest }) => match commands::run_list(&manifest) {
            Ok(result) => print!("{result}"),
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        },
        Some(Commands::Dot { manifest, output }) => {
            match commands::run_dot(&manifest, output.as_ref()) {
                Ok(result) => print!("{result}"),
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => {
            // No subcommand: show help
            Cli::parse_from(["dtest", "--help"]);
        }
    }
}
