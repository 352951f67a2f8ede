//! # Fixlog CLI
//!
//! Batch materialisation and queries over Datalog programs with
//! tab-separated fact files.
//!
//! ```bash
//! fixlog materialize --program tc.dl --facts ./facts --output ./out --decompress
//! fixlog query --program tc.dl "tc(a, Y)"
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use fixlog::text::load_facts_dir;
use fixlog::{parse_goal, parse_program, Config, Reasoner, SemiNaiveEngine};

#[derive(Parser)]
#[command(name = "fixlog", about = "Bottom-up Datalog materialisation engine", version)]
struct Cli {
    /// Configuration file (defaults to config.toml + FIXLOG_* env)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Saturate a program and write the derived tables to files
    Materialize {
        /// Datalog program (rules and optional inline facts)
        #[arg(long)]
        program: PathBuf,

        /// Directory of tab-separated fact files, one per relation
        #[arg(long)]
        facts: Option<PathBuf>,

        /// Output directory, one text file per non-empty IDB predicate
        #[arg(long)]
        output: PathBuf,

        /// Write dictionary text instead of numeric term ids
        #[arg(long)]
        decompress: bool,

        /// Skip blocks below this iteration
        #[arg(long, default_value_t = 0)]
        min_iteration: usize,

        /// Intra-rule threads (overrides config)
        #[arg(long)]
        threads: Option<usize>,

        /// Inter-rule threads (overrides config)
        #[arg(long)]
        inter_rule_threads: Option<usize>,
    },

    /// Answer a single goal, dispatching between magic and on-demand
    Query {
        /// Datalog program (rules and optional inline facts)
        #[arg(long)]
        program: PathBuf,

        /// Directory of tab-separated fact files, one per relation
        #[arg(long)]
        facts: Option<PathBuf>,

        /// Goal atom, e.g. 'tc(a, Y)'
        goal: String,

        /// Size cutoff for the dispatcher (overrides config)
        #[arg(long)]
        threshold: Option<u64>,
    },
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load(program_path: &PathBuf, facts: Option<&PathBuf>) -> Result<fixlog::ParsedProgram> {
    let source = std::fs::read_to_string(program_path)
        .with_context(|| format!("reading program {}", program_path.display()))?;
    let mut parsed = parse_program(&source).context("parsing program")?;
    if let Some(dir) = facts {
        load_facts_dir(dir, &mut parsed)
            .with_context(|| format!("loading facts from {}", dir.display()))?;
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_file(path).context("loading configuration")?,
        None => Config::load().unwrap_or_default(),
    };
    init_logging(&config);

    match cli.command {
        Command::Materialize {
            program,
            facts,
            output,
            decompress,
            min_iteration,
            threads,
            inter_rule_threads,
        } => {
            let parsed = load(&program, facts.as_ref())?;
            let mut opts = config.engine_options();
            if let Some(t) = threads {
                opts.nthreads = t.max(1);
            }
            if let Some(t) = inter_rule_threads {
                opts.inter_rule_threads = t.max(1);
            }

            let engine = SemiNaiveEngine::new(Arc::new(parsed.program), Arc::new(parsed.edb), opts)?;
            engine.run().context("saturation failed")?;
            info!(derivations = engine.count_all_idb(), "materialisation complete");
            engine
                .store_on_files(&output, decompress, min_iteration)
                .context("persisting derived tables")?;
            println!("{} derivations written to {}", engine.count_all_idb(), output.display());
        }

        Command::Query {
            program,
            facts,
            goal,
            threshold,
        } => {
            let mut parsed = load(&program, facts.as_ref())?;
            let goal = parse_goal(&goal, &mut parsed).context("parsing goal")?;
            let reasoner = Reasoner::new(threshold.unwrap_or(config.engine.threshold));

            let edb = Arc::new(parsed.edb);
            let answers = reasoner.answer(&goal, &parsed.program, edb.clone(), &config.engine_options())?;
            info!(mode = ?answers.mode, "answering query");
            let mut n = 0usize;
            for row in answers {
                let rendered: Vec<String> = row
                    .iter()
                    .map(|&t| {
                        fixlog::edb::term_text(edb.as_ref(), t).unwrap_or_else(|_| t.to_string())
                    })
                    .collect();
                println!("{}", rendered.join("\t"));
                n += 1;
            }
            println!("{n} answers");
        }
    }
    Ok(())
}
