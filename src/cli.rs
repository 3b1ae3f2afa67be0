use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::action::ActionDef;
use crate::actions::function::{ArgDecl, ArgSpec, CallDefinition, FunctionDefinition};
use crate::actions::process::ProcessDefinition;
use crate::actions::sequence::{ReturnDefinition, SequenceDefinition};
use crate::actions::testcase::{TestcaseDefinition, TestcaseStatusDefinition};
use crate::config::Config;
use crate::engine::Engine;
use crate::job::{JobDefinition, JobOutcome};

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Strand - run action trees against a command substrate", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration
    Config,

    /// Run one command as a process job on the local machine
    Run {
        /// Command to start
        command: String,

        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Terminate the job after this many seconds
        #[arg(short = 't', long = "timeout")]
        timeout: Option<u64>,
    },

    /// Run a small job with a function call, a testcase and two concurrent processes
    Demo,
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    run(Cli::parse_from(args)).await
}

/// Load the configuration the same way the commands will
pub fn load_config(path: Option<PathBuf>) -> Result<Config> {
    Config::builder()
        .config_path(path)
        .build()
        .context("Failed to load configuration")
}

/// Execute a parsed command line
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }

        Commands::Run {
            command,
            args,
            timeout,
        } => {
            let engine = Engine::builder(config).build();
            let outcome = run_with_timeout(&engine, run_definition(&command, &args)?, timeout).await;
            engine.shutdown();
            print_outcome(&outcome)?;
        }

        Commands::Demo => {
            let engine = Engine::builder(config).build();
            let outcome = engine.run_job(demo_definition()).await;
            engine.shutdown();
            print_outcome(&outcome)?;
        }
    }

    Ok(())
}

async fn run_with_timeout(
    engine: &Arc<Engine>,
    definition: JobDefinition,
    timeout: Option<u64>,
) -> JobOutcome {
    let job = engine.start_job(definition);
    let Some(seconds) = timeout else {
        return job.wait().await;
    };

    match tokio::time::timeout(Duration::from_secs(seconds), job.wait()).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(job_id = job.id(), seconds, "Job timed out, terminating");
            if let Err(e) = engine.terminate_job(job.id()) {
                tracing::warn!(job_id = job.id(), error = %e, "Failed to terminate job");
            }
            job.wait().await
        }
    }
}

fn print_outcome(outcome: &JobOutcome) -> Result<()> {
    println!("Job: {}", outcome.job_id);
    println!("Status: {}", outcome.status);
    println!("\nResult:");
    println!(
        "  {}",
        serde_json::to_string_pretty(&outcome.result).context("Failed to render job result")?
    );
    Ok(())
}

/// Quote `text` as a string literal for the evaluator
fn literal(text: &str) -> Result<String> {
    serde_json::to_string(text).context("Failed to quote expression")
}

fn run_definition(command: &str, args: &[String]) -> Result<JobDefinition> {
    let mut process = ProcessDefinition::new("'local'", literal(command)?).returning_stdout();
    if !args.is_empty() {
        process = process.with_parms(literal(&args.join(" "))?);
    }

    let body: ActionDef = Arc::new(SequenceDefinition::new(vec![
        Arc::new(process),
        Arc::new(ReturnDefinition::new(Some("Result"))),
    ]));
    Ok(JobDefinition::new("run")
        .with_function(FunctionDefinition::new("main").with_body(body))
        .with_default_call("main", None))
}

fn demo_definition() -> JobDefinition {
    let echo = ProcessDefinition::new("'local'", "'echo'")
        .with_parms("'hello from the nested process'")
        .returning_stdout();
    let sleep = ProcessDefinition::new("'local'", "'sleep'")
        .with_parms("'1'")
        .with_nested(Arc::new(echo));

    let greet = FunctionDefinition::new("greet")
        .with_args(ArgSpec::List(vec![
            ArgDecl::required("name"),
            ArgDecl::optional("greeting", "'hello'"),
        ]))
        .with_body(Arc::new(ReturnDefinition::new(Some("greeting"))));

    let testcase_body: ActionDef = Arc::new(SequenceDefinition::new(vec![
        Arc::new(CallDefinition::with_list("'greet'", vec!["'demo'".to_string()])),
        Arc::new(sleep),
        Arc::new(TestcaseStatusDefinition::new("'pass'", Some("'processes finished'"))),
    ]));
    let main: ActionDef = Arc::new(SequenceDefinition::new(vec![
        Arc::new(TestcaseDefinition::new("'demo'", testcase_body).with_mode("'strict'")),
        Arc::new(ReturnDefinition::new(Some("RC"))),
    ]));

    JobDefinition::new("demo")
        .with_function(FunctionDefinition::new("main").with_body(main))
        .with_function(greet)
        .with_default_call("main", None)
}
