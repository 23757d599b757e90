use std::io::IsTerminal;

use clap::Parser;
use facet::Facet;
use tracing_subscriber::EnvFilter;

use ragnatramp::cli::{Cli, Command, selection_of};
use ragnatramp::commands::{self, Context};
use ragnatramp::config::{self, ResolvedConfig};
use ragnatramp::control_plane::client::{CommandEcho, PowerShell};
use ragnatramp::error::RagnatrampError;
use ragnatramp::observer::{OutputMode, ProgressObserver};
use ragnatramp::report::{self, ApplyReport};

#[derive(Facet)]
struct ValidateJson {
    valid: bool,
    project: String,
    machines: Vec<String>,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Tracing shares stderr with the spinners; keep it quiet unless asked.
    let filter = if cli.verbose {
        EnvFilter::new("ragnatramp=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ragnatramp=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let code = e.exit_code();
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(code);
        }
    }
}

fn output_mode(cli: &Cli) -> OutputMode {
    if cli.json {
        OutputMode::Silent
    } else if cli.verbose || !std::io::stderr().is_terminal() {
        OutputMode::Plain
    } else {
        OutputMode::Interactive
    }
}

/// Run the command; the returned value is the process exit code.
async fn run(cli: &Cli) -> Result<i32, RagnatrampError> {
    let config = config::load_config(&cli.config)?;

    let echo = if cli.verbose {
        CommandEcho::stderr()
    } else {
        CommandEcho::disabled()
    };
    let client = PowerShell::new().with_echo(echo);
    let ctx = Context::new(&client, &config);
    let mut observer = ProgressObserver::new(output_mode(cli));

    let applied = match &cli.command {
        Command::Validate => {
            if cli.json {
                print_json(facet_json::to_string(&ValidateJson {
                    valid: true,
                    project: config.project.clone(),
                    machines: config.machine_names().into_iter().map(String::from).collect(),
                }))?;
            } else {
                print!("{}", commands::describe(&config));
            }
            return Ok(0);
        }
        Command::Plan => {
            let actions = ctx.plan().await?;
            if cli.json {
                println!("{}", report::plan_json(&actions)?);
            } else {
                print!("{}", report::render_plan(&actions));
            }
            return Ok(0);
        }
        Command::Status => {
            let status = ctx.status().await?;
            if cli.json {
                println!("{}", status.to_json()?);
            } else {
                print!("{}", status.render());
            }
            return Ok(0);
        }
        Command::Up => ctx.up(&mut observer).await?,
        Command::Halt { target } => ctx.halt(&target.selection(), &mut observer).await?,
        Command::Destroy { target } => {
            require_explicit(&config, target.is_explicit())?;
            ctx.destroy(&target.selection(), &mut observer).await?
        }
        Command::Checkpoint { name, machine } => {
            ctx.checkpoint(&selection_of(machine), name, &mut observer)
                .await?
        }
        Command::Restore { name, machine } => {
            ctx.restore(&selection_of(machine), name, &mut observer)
                .await?
        }
    };

    finish(cli, &applied)
}

fn require_explicit(config: &ResolvedConfig, explicit: bool) -> Result<(), RagnatrampError> {
    if explicit {
        return Ok(());
    }
    Err(RagnatrampError::Validation {
        message: format!(
            "destroy needs a machine name or --all (machines: {})",
            config.machine_names().join(", ")
        ),
    })
}

fn finish(cli: &Cli, report: &ApplyReport) -> Result<i32, RagnatrampError> {
    if cli.json {
        println!("{}", report.to_json()?);
    } else {
        print!("{}", report.render());
    }
    Ok(report.exit_code())
}

fn print_json<E: std::fmt::Display>(json: Result<String, E>) -> Result<(), RagnatrampError> {
    let json = json.map_err(|e| RagnatrampError::Io {
        context: format!("failed to serialize output: {e}"),
        source: std::io::Error::other(e.to_string()),
    })?;
    println!("{json}");
    Ok(())
}
