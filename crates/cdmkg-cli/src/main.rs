//! cdmkg CLI - Command-line interface
//!
//! Usage:
//!   cdmkg segment <manual.txt> --out segments/
//!   cdmkg extract <manual.txt> --table triples.csv
//!   cdmkg annotate --table triples.csv list
//!   cdmkg annotate --table triples.csv good 3 4 7
//!   cdmkg stats --table triples.csv
//!   cdmkg evaluate --table triples.csv --queries queries.json

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use cdmkg_core::{
    AppConfig, ContextMode, LoggingConfig, MatchMode, ReextractPolicy, RowFilter, Segment,
    SegmentationMode,
};
use cdmkg_extractor::{ExtractionPipeline, ExtractionSchema, LlmExtractionService, TripleExtractor};
use cdmkg_rag::{create_llm_client, load_queries, RetrievalEvaluator};
use cdmkg_segmenter::{load_presegmented, read_source, segment, write_segments, SegmentationPolicy};
use cdmkg_table::{Aggregator, ResultTable};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cdmkg")]
#[command(about = "Milestone knowledge-graph extraction and retrieval evaluation")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split the manual into segments and optionally write them out
    Segment {
        #[command(flatten)]
        source: SourceArgs,

        /// Directory for segment_{id}.txt files and segments.json
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Extract triples from every segment into the result table
    Extract {
        #[command(flatten)]
        source: SourceArgs,

        /// Result table (CSV)
        #[arg(long, default_value = "triples.csv")]
        table: PathBuf,

        /// What to do with segments already in the table
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Segments extracted concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        /// Only extract these segment ids
        #[arg(long, value_delimiter = ',')]
        only: Option<Vec<usize>>,

        /// Write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Label extracted triples as good or bad
    Annotate {
        /// Result table (CSV)
        #[arg(long, default_value = "triples.csv")]
        table: PathBuf,

        #[command(subcommand)]
        action: AnnotateAction,
    },
    /// Show annotation coverage and precision
    Stats {
        /// Result table (CSV)
        #[arg(long, default_value = "triples.csv")]
        table: PathBuf,
    },
    /// Run the query set against the result table
    Evaluate {
        /// Result table (CSV)
        #[arg(long, default_value = "triples.csv")]
        table: PathBuf,

        /// JSON query set: [{"question", "expected_answer"}]
        #[arg(long)]
        queries: PathBuf,

        /// Context mode(s) to evaluate
        #[arg(long, value_enum, default_value_t = ModeArg::Both)]
        mode: ModeArg,

        /// Rows eligible for retrieval
        #[arg(long, value_enum)]
        filter: Option<FilterArg>,

        /// Require an exact subject/object match instead of fuzzy matching
        #[arg(long)]
        exact: bool,

        /// Answer from the window with the configured LLM
        #[arg(long)]
        llm: bool,

        /// Triples in the short window
        #[arg(long)]
        short_window: Option<usize>,

        /// Write the full report as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AnnotateAction {
    /// List rows that have no label yet
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark rows as good
    Good {
        #[arg(required = true)]
        row_ids: Vec<u64>,
    },
    /// Mark rows as bad
    Bad {
        #[arg(required = true)]
        row_ids: Vec<u64>,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Converted manual (plain UTF-8 text)
    #[arg(required_unless_present = "presegmented")]
    input: Option<PathBuf>,

    /// Directory of pre-segmented {prefix}{i}.txt files instead of a manual
    #[arg(long, conflicts_with = "input")]
    presegmented: Option<PathBuf>,

    /// File name prefix of pre-segmented files
    #[arg(long, default_value = "milestone")]
    prefix: String,

    /// Segmentation mode
    #[arg(long, value_enum)]
    split: Option<SplitArg>,

    /// Segment length threshold in characters
    #[arg(long)]
    max_chars: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SplitArg {
    Markers,
    MaxLength,
}

impl From<SplitArg> for SegmentationMode {
    fn from(arg: SplitArg) -> Self {
        match arg {
            SplitArg::Markers => Self::Markers,
            SplitArg::MaxLength => Self::MaxLength,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Reject,
    Overwrite,
}

impl From<PolicyArg> for ReextractPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Reject => Self::Reject,
            PolicyArg::Overwrite => Self::Overwrite,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum FilterArg {
    GoodOnly,
    All,
}

impl From<FilterArg> for RowFilter {
    fn from(arg: FilterArg) -> Self {
        match arg {
            FilterArg::GoodOnly => Self::GoodOnly,
            FilterArg::All => Self::All,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Short,
    Long,
    Both,
}

impl ModeArg {
    fn modes(self) -> Vec<ContextMode> {
        match self {
            Self::Short => vec![ContextMode::Short],
            Self::Long => vec![ContextMode::Long],
            Self::Both => vec![ContextMode::Short, ContextMode::Long],
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json_logs {
        config.logging.json_format = true;
    }
    init_tracing(&config.logging);

    match cli.command {
        Commands::Segment { source, out } => {
            let segments = load_segments(&source, &mut config)?;
            for segment in &segments {
                println!(
                    "segment {:>3}  bytes {:>7}..{:<7}  chars {:>6}",
                    segment.id,
                    segment.start,
                    segment.end,
                    segment.char_len()
                );
            }
            if let Some(out) = out {
                let paths = write_segments(&out, &segments)?;
                println!("Wrote {} segments to {}", paths.len(), out.display());
            }
        }
        Commands::Extract {
            source,
            table,
            policy,
            concurrency,
            only,
            report,
        } => {
            if let Some(policy) = policy {
                config.extraction.reextract_policy = policy.into();
            }
            if let Some(concurrency) = concurrency {
                config.extraction.concurrency = concurrency;
            }
            config.validate()?;

            let mut segments = load_segments(&source, &mut config)?;
            if let Some(only) = only {
                segments.retain(|s| only.contains(&s.id));
            }
            run_extraction(&config, &segments, &table, report.as_deref()).await?;
        }
        Commands::Annotate { table, action } => annotate(&table, action)?,
        Commands::Stats { table } => {
            let results = open_table(&table)?;
            println!("{} rows in {}", results.len(), table.display());
            print!("{}", results.annotation_summary());
        }
        Commands::Evaluate {
            table,
            queries,
            mode,
            filter,
            exact,
            llm,
            short_window,
            output,
        } => {
            if let Some(filter) = filter {
                config.evaluation.row_filter = filter.into();
            }
            if exact {
                config.evaluation.match_mode = MatchMode::Exact;
            }
            if llm {
                config.evaluation.llm_answers = true;
            }
            if let Some(n) = short_window {
                config.evaluation.short_window = n;
            }

            let queries = load_queries(&queries)?;
            let mut evaluator = RetrievalEvaluator::new(config.evaluation.clone());
            if config.evaluation.llm_answers {
                evaluator = evaluator.with_llm(create_llm_client(&config.llm)?);
            }

            let report = evaluator
                .evaluate_path(&table, &queries, &mode.modes())
                .await
                .with_context(|| format!("evaluation against {} failed", table.display()))?;

            print!("{report}");
            if let Some(output) = output {
                std::fs::write(&output, report.to_json()?)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                info!(path = %output.display(), "Evaluation report written");
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

fn init_tracing(config: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    if config.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_segments(source: &SourceArgs, config: &mut AppConfig) -> anyhow::Result<Vec<Segment>> {
    if let Some(dir) = &source.presegmented {
        return Ok(load_presegmented(dir, &source.prefix, None)?);
    }

    let input = source
        .input
        .as_ref()
        .context("either a manual or --presegmented is required")?;

    if let Some(split) = source.split {
        config.segmentation.mode = split.into();
    }
    if let Some(max_chars) = source.max_chars {
        config.segmentation.max_segment_chars = Some(max_chars);
    }
    config.validate()?;

    let policy = SegmentationPolicy::from_config(&config.segmentation)?;
    let text = read_source(input)?;
    let segmentation = segment(&text, &policy);

    if !segmentation.violations.is_empty() {
        warn!(
            oversize = segmentation.violations.len(),
            threshold = ?policy.threshold(),
            "Some segments exceed the length threshold"
        );
    }
    Ok(segmentation.into_segments())
}

async fn run_extraction(
    config: &AppConfig,
    segments: &[Segment],
    table: &Path,
    report_path: Option<&Path>,
) -> anyhow::Result<()> {
    let llm = create_llm_client(&config.llm)?;
    let service = Arc::new(LlmExtractionService::new(llm));
    let extractor =
        TripleExtractor::with_config(service, ExtractionSchema::acdm(), &config.extraction);
    let pipeline = ExtractionPipeline::from_config(extractor, &config.extraction);

    let mut aggregator = Aggregator::open(table, config.extraction.reextract_policy)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, letting in-flight segments finish");
            on_interrupt.cancel();
        }
    });

    let report = pipeline.run(segments, &mut aggregator, &cancel).await?;
    print!("{report}");

    if let Some(path) = report_path {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Run report written");
    }

    // Committed segments are already durable; exit non-zero so scripts notice
    if report.was_cancelled() {
        warn!(
            remaining = report.cancelled.len(),
            "Run interrupted, rerun the same command to extract the remaining segments"
        );
    }
    report.check_cancelled()?;
    Ok(())
}

fn annotate(table: &Path, action: AnnotateAction) -> anyhow::Result<()> {
    let mut results = open_table(table)?;

    let (row_ids, good) = match action {
        AnnotateAction::List { limit } => {
            let pending: Vec<_> = results.unlabelled().collect();
            for row in pending.iter().take(limit) {
                println!(
                    "{:>5}  [seg {:>3}]  {}",
                    row.row_id,
                    row.segment_id,
                    cdmkg_rag::render_triple(row)
                );
            }
            println!("{} of {} rows unlabelled", pending.len(), results.len());
            return Ok(());
        }
        AnnotateAction::Good { row_ids } => (row_ids, true),
        AnnotateAction::Bad { row_ids } => (row_ids, false),
    };

    // All or nothing: the table is only written once every label applied
    for row_id in &row_ids {
        results.annotate(*row_id, good)?;
    }
    results.save(table)?;
    println!("Labelled {} rows as good={good}", row_ids.len());
    Ok(())
}

fn open_table(path: &Path) -> anyhow::Result<ResultTable> {
    ResultTable::load(path).with_context(|| format!("cannot open result table {}", path.display()))
}
