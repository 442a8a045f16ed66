use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use synthbench::config::{default_config_path, Config, Provider};
use synthbench::llm::LlmBackend;
use synthbench::run_test_synthesis;

#[derive(Parser)]
#[command(
    name = "synthbench",
    version,
    about = "Ask several LLM backends for pytest suites, run each in a sandbox and compare the results."
)]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Generate, run and compare test suites for one Python file
    Run {
        /// Python source file to test
        file: PathBuf,

        /// Path to the configuration file
        #[arg(long = "config", short = 'c')]
        config: Option<PathBuf>,

        /// Print the report as JSON instead of text
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List configured backends and whether they are usable
    Backends {
        /// Path to the configuration file
        #[arg(long = "config", short = 'c')]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    let res = match cli.command {
        CliCommand::Run { file, config, json } => run(&file, config.as_deref(), json),
        CliCommand::Backends { config } => backends(config.as_deref()),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    Config::load(&path).context("failed to load configuration")
}

fn run(file: &Path, config: Option<&Path>, json: bool) -> Result<()> {
    let config = load_config(config)?;
    let report = run_test_synthesis(file, &config)?;

    if json {
        println!("{}", report.to_json().context("failed to serialize report")?);
    } else {
        print!("{report}");
    }
    Ok(())
}

fn backends(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;

    println!(
        "{:<16} {:<10} {:<24} {:>8}  STATUS",
        "NAME", "PROVIDER", "MODEL", "TIMEOUT"
    );

    for b in &config.backends {
        let provider = b.provider.map(|p| p.as_str()).unwrap_or("-");
        let model = match (b.provider, &b.model, &b.command) {
            (Some(Provider::Command), _, Some(argv)) => argv.join(" "),
            (_, Some(model), _) => model.clone(),
            _ => "-".to_string(),
        };
        let timeout = b
            .timeout_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "-".to_string());
        let status = match LlmBackend::from_config(b) {
            Ok(_) => "ready".to_string(),
            Err(e) => format!("misconfigured: {e}"),
        };

        println!(
            "{:<16} {:<10} {:<24} {:>8}  {}",
            b.name, provider, model, timeout, status
        );
    }

    Ok(())
}
