//! Starpipe CLI entry point

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use starpipe::core::{TaskState, Variables};
use starpipe::pipeline::parse_execution_date;
use starpipe::{CancellationToken, PipelineDef, RunArchive, RunOptions, StarpipeEngine};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "starpipe",
    version,
    about = "Star-schema warehouse pipeline orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline once for an execution date
    Run {
        /// Pipeline YAML file (default: pipeline.yml or .starpipe/pipeline.yml)
        pipeline: Option<PathBuf>,
        /// Logical execution date, YYYY-MM-DD or RFC 3339 (default: now)
        #[arg(short = 'd', long)]
        execution_date: Option<String>,
        /// Maximum number of tasks running at once
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Template variable override, repeatable
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
        /// Explicit run id
        #[arg(long)]
        run_id: Option<String>,
        /// Where run results are archived
        #[arg(long)]
        archive_dir: Option<PathBuf>,
        /// Do not archive the run result
        #[arg(long)]
        no_archive: bool,
    },
    /// Validate a pipeline and print its execution order
    Check {
        pipeline: Option<PathBuf>,
    },
    /// Print the named queries as they would render for an execution date
    Render {
        pipeline: Option<PathBuf>,
        #[arg(short = 'd', long)]
        execution_date: Option<String>,
        #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
        vars: Vec<(String, String)>,
        /// Only render this query
        #[arg(short, long)]
        query: Option<String>,
    },
    /// Show archived runs
    History {
        /// Show one run in detail
        run_id: Option<String>,
        /// Show the most recently archived run in detail
        #[arg(long, conflicts_with = "run_id")]
        latest: bool,
        #[arg(long)]
        archive_dir: Option<PathBuf>,
        /// Number of runs to list
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
    },
}

fn parse_var(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), val.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", value)),
    }
}

fn load_pipeline(path: Option<&Path>) -> Result<(PathBuf, PipelineDef)> {
    match path {
        Some(path) => Ok((path.to_path_buf(), PipelineDef::from_file(path)?)),
        None => PipelineDef::auto_load(),
    }
}

fn options(
    execution_date: Option<&str>,
    vars: Vec<(String, String)>,
) -> Result<RunOptions> {
    let date = match execution_date {
        Some(value) => parse_execution_date(value)?,
        None => Utc::now(),
    };
    let mut options = RunOptions::new(date);
    options.variables = vars.into_iter().collect::<Variables>();
    Ok(options)
}

fn archive_at(dir: Option<PathBuf>) -> RunArchive {
    dir.map(RunArchive::new).unwrap_or_else(RunArchive::open_default)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            pipeline,
            execution_date,
            concurrency,
            vars,
            run_id,
            archive_dir,
            no_archive,
        } => {
            let (path, pipeline) = load_pipeline(pipeline.as_deref())?;
            log::info!("starpipe v{}", env!("CARGO_PKG_VERSION"));
            log::info!("Loaded pipeline from: {}", path.display());

            let mut options = options(execution_date.as_deref(), vars)?;
            options.concurrency = concurrency;
            options.run_id = run_id;

            let engine = StarpipeEngine::new(pipeline);
            let ctx = engine.default_context(&options)?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupt received, cancelling run");
                    on_interrupt.cancel();
                }
            });

            let result = engine.run(ctx, options.concurrency, cancel).await?;
            print!("{}", result.summary());

            if !no_archive {
                let archive = archive_at(archive_dir);
                match archive.save(&result) {
                    Ok(path) => log::info!("Run archived at {}", path.display()),
                    Err(e) => log::error!("Failed to archive run {}: {:#}", result.run_id, e),
                }
            }

            std::process::exit(result.exit_code());
        }
        Commands::Check { pipeline } => {
            let (path, pipeline) = load_pipeline(pipeline.as_deref())?;
            let graph = pipeline
                .build_graph()
                .with_context(|| format!("Pipeline {} is invalid", path.display()))?;

            println!(
                "Pipeline '{}' is valid: {} tasks",
                pipeline.name(),
                graph.len()
            );
            for (i, id) in graph.topological_order().into_iter().enumerate() {
                if let Some(node) = graph.get(id) {
                    let upstream = if node.upstream().is_empty() {
                        String::new()
                    } else {
                        format!(" <- {}", node.upstream().join(", "))
                    };
                    println!(
                        "  {:>2}. {} [{}]{}",
                        i + 1,
                        id,
                        node.operator().kind(),
                        upstream
                    );
                }
            }
            Ok(())
        }
        Commands::Render {
            pipeline,
            execution_date,
            vars,
            query,
        } => {
            let (_, pipeline) = load_pipeline(pipeline.as_deref())?;
            let options = options(execution_date.as_deref(), vars)?;
            let engine = StarpipeEngine::new(pipeline);
            let vars = engine.render_variables(&options);

            let mut names: Vec<&String> = engine.pipeline().queries.keys().collect();
            names.sort();
            if let Some(only) = &query {
                if !engine.pipeline().queries.contains_key(only) {
                    anyhow::bail!("Unknown query '{}'", only);
                }
                names.retain(|name| *name == only);
            }

            for name in names {
                let rendered = starpipe::core::template::render(&engine.pipeline().queries[name], &vars)?;
                println!("-- {}\n{}\n", name, rendered.trim());
            }
            Ok(())
        }
        Commands::History {
            run_id,
            latest,
            archive_dir,
            limit,
        } => {
            let archive = archive_at(archive_dir);
            if latest {
                print!("{}", archive.latest()?.summary());
                return Ok(());
            }
            if let Some(id) = run_id {
                print!("{}", archive.load(&id)?.summary());
                return Ok(());
            }

            let runs = archive.list()?;
            if runs.is_empty() {
                println!("No runs archived in {}", archive.dir().display());
            }
            for run in runs.into_iter().take(limit) {
                println!(
                    "{}  {:<10} {}  {}  {}/{} succeeded",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.status.to_string(),
                    run.pipeline,
                    run.run_id,
                    run.count(TaskState::Succeeded),
                    run.tasks.len()
                );
            }
            Ok(())
        }
    }
}
