use std::io::{self, Write};
use std::path::PathBuf;

use ab_survey_api::{ConfigOverrides, RunOutcome, SurveyApi, SurveyConfig, SurveyRunner};
use ab_survey_core::TesterId;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

mod terminal;

use terminal::TerminalSurface;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "ABT_LOG";

#[derive(Debug, Parser)]
#[command(name = "abt")]
#[command(about = "Blinded pairwise image comparison survey")]
struct Cli {
    /// TOML config file; `abt.toml` in the working directory is used when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "ABT_DB")]
    db: Option<PathBuf>,

    #[arg(long, global = true, env = "ABT_VARIANT_A_DIR")]
    variant_a_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "ABT_VARIANT_B_DIR")]
    variant_b_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "ABT_RESULTS_CSV")]
    results_csv: Option<PathBuf>,

    #[arg(long, global = true, env = "ABT_TESTER_RESULTS_DIR")]
    tester_results_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "ABT_SEED")]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            variant_a_dir: self.variant_a_dir.clone(),
            variant_b_dir: self.variant_b_dir.clone(),
            db_path: self.db.clone(),
            results_csv: self.results_csv.clone(),
            tester_results_dir: self.tester_results_dir.clone(),
            seed: self.seed,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the survey interactively on stdin/stdout.
    Run(RunArgs),
    /// Print the presentation order a session would use.
    Pool,
    Summary(SummaryArgs),
    Export(ExportArgs),
    Import(ImportArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    tester: Option<String>,
    /// Print the final summary as JSON on stdout; prompts move to stderr.
    #[arg(long, default_value_t = false)]
    json_summary: bool,
}

#[derive(Debug, Args)]
struct SummaryArgs {
    #[arg(long)]
    tester: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    tester: Option<String>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SurveyConfig::load(cli.config.as_deref())?.with_overrides(cli.overrides());
    tracing::debug!(?config, "configuration resolved");
    let api = SurveyApi::new(config);

    match cli.command {
        Command::Run(args) => run_survey(&api, &args),
        Command::Pool => run_pool(&api),
        Command::Summary(args) => run_summary(&api, &args),
        Command::Export(args) => run_export(&api, &args),
        Command::Import(args) => run_import(&api, &args),
        Command::Db { command } => run_db(&api, command),
    }
}

fn run_survey(api: &SurveyApi, args: &RunArgs) -> Result<()> {
    let (pool, session) = api.start_session()?;
    let stdin = io::stdin();
    let prompts: Box<dyn Write> =
        if args.json_summary { Box::new(io::stderr()) } else { Box::new(io::stdout()) };

    let mut runner =
        SurveyRunner::new(api, pool, session, TerminalSurface::new(stdin.lock(), prompts));
    if let Some(tester) = args.tester.as_deref() {
        runner.on_identity(tester)?;
    }
    let outcome = runner.run()?;
    drop(runner);

    match outcome {
        RunOutcome::Completed(report) => {
            if args.json_summary {
                emit_json(serde_json::to_value(&report).context("failed to serialize summary")?)?;
            }
            Ok(())
        }
        RunOutcome::Abandoned { answered, total } => Err(anyhow!(
            "survey ended after {answered} of {total} comparisons; nothing was saved"
        )),
    }
}

fn run_pool(api: &SurveyApi) -> Result<()> {
    let mut rng = api.config().rng();
    let pool = api.load_pool(&mut rng)?;
    emit_json(serde_json::json!({
        "variant_a_dir": api.config().variant_a_dir,
        "variant_b_dir": api.config().variant_b_dir,
        "seed": api.config().seed,
        "order": pool.order(),
        "skipped": pool.skipped()
    }))
}

fn run_summary(api: &SurveyApi, args: &SummaryArgs) -> Result<()> {
    let tester = TesterId::parse(&args.tester)?;
    let summary = api.tester_summary(&tester)?;
    emit_json(serde_json::to_value(&summary).context("failed to serialize summary")?)
}

fn run_export(api: &SurveyApi, args: &ExportArgs) -> Result<()> {
    let tester = args.tester.as_deref().map(TesterId::parse).transpose()?;
    let rows = api.export_csv(&args.out, tester.as_ref())?;
    emit_json(serde_json::json!({
        "out": args.out,
        "tester": tester,
        "rows": rows
    }))
}

fn run_import(api: &SurveyApi, args: &ImportArgs) -> Result<()> {
    let summary = api.import_csv(&args.input)?;
    emit_json(serde_json::json!({
        "in": args.input,
        "results_csv": api.config().results_csv,
        "summary": summary
    }))
}

fn run_db(api: &SurveyApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migration")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
    }
}
