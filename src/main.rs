use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

mod aggregate;
mod catalog;
mod config;
mod db;
mod error;
mod mapping;
mod matcher;
mod models;
mod pipeline;
mod reconcile;
mod report;
mod scoring;
mod standardize;

use catalog::Catalog;
use config::AppConfig;
use error::PipelineError;
use models::{ActorRole, ColumnRule};
use scoring::HttpScoringGateway;

#[derive(Parser)]
#[command(name = "futureguard")]
#[command(about = "At-risk student tracking pipeline for FutureGuard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load the default field catalog and demo accounts
    Seed,
    /// Build a draft column mapping from a spreadsheet's headers
    Draft {
        #[arg(long)]
        csv: PathBuf,
        /// Draft on behalf of an institute; rejected while its mapping is locked
        #[arg(long)]
        institute: Option<String>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Save a reviewed column mapping for an institute
    SaveMapping {
        #[arg(long)]
        institute: String,
        #[arg(long)]
        rules: PathBuf,
    },
    /// Lock or unlock an institute's column mapping
    SetLock {
        #[arg(long)]
        institute: String,
        #[arg(long, action = clap::ArgAction::Set)]
        locked: bool,
        #[arg(long)]
        role: String,
    },
    /// Import one or more CSV uploads on behalf of a mentor
    Import {
        #[arg(long, num_args = 1.., required = true)]
        csv: Vec<PathBuf>,
        #[arg(long)]
        mentor: String,
    },
    /// Activate or deactivate a mentor or an institute
    #[command(group(
        ArgGroup::new("scope")
            .args(["mentor", "institute"])
            .required(true)
            .multiple(false)
    ))]
    SetActive {
        #[arg(long)]
        mentor: Option<String>,
        #[arg(long)]
        institute: Option<String>,
        #[arg(long, action = clap::ArgAction::Set)]
        active: bool,
    },
    /// Remove a mentor and correct the parent counters
    RemoveMentor {
        #[arg(long)]
        email: String,
    },
    /// Remove an institute with all of its accounts and students
    RemoveInstitute {
        #[arg(long)]
        name: String,
    },
    /// Generate a markdown report for a scope
    #[command(group(
        ArgGroup::new("scope")
            .args(["mentor", "institute"])
            .multiple(false)
    ))]
    Report {
        #[arg(long)]
        mentor: Option<String>,
        #[arg(long)]
        institute: Option<String>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Verify stored counters against the student ledger
    Audit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Draft {
            csv,
            institute,
            out,
        } => {
            if let Some(name) = institute {
                let institute = require_institute(&pool, &name).await?;
                mapping::ensure_unlocked(&pool, institute.id).await?;
            }
            let headers = pipeline::read_headers(&csv)?;
            let catalog = Catalog::load(&pool).await?;
            let draft = matcher::build_draft(&headers, &catalog);

            let payload = serde_json::json!({
                "columns": draft.rules,
                "missingFields": draft.missing_fields,
            });
            let rendered = serde_json::to_string_pretty(&payload)?;

            match out {
                Some(path) => {
                    std::fs::write(&path, &rendered)?;
                    println!("Draft written to {}.", path.display());
                }
                None => println!("{rendered}"),
            }
            if !draft.missing_fields.is_empty() {
                println!(
                    "Required fields still unmapped: {}.",
                    draft.missing_fields.join(", ")
                );
            }
        }
        Commands::SaveMapping { institute, rules } => {
            let institute = require_institute(&pool, &institute).await?;
            let rules = load_rules(&rules)?;
            let catalog = Catalog::load(&pool).await?;
            mapping::save_mapping(&pool, institute.id, &rules, &catalog).await?;
            println!("Mapping saved for {}.", institute.name);
        }
        Commands::SetLock {
            institute,
            locked,
            role,
        } => {
            let actor_role = ActorRole::parse(&role)
                .with_context(|| format!("unknown role {role:?} (mentor, admin, super_admin)"))?;
            let institute = require_institute(&pool, &institute).await?;
            let catalog = Catalog::load(&pool).await?;
            mapping::set_lock(&pool, institute.id, locked, actor_role, &catalog).await?;
            println!(
                "Mapping {} for {}.",
                if locked { "locked" } else { "unlocked" },
                institute.name
            );
        }
        Commands::Import { csv, mentor } => {
            let scoring_url = config.require_scoring_url()?;
            let gateway = HttpScoringGateway::new(scoring_url, config.scoring_timeout)?;
            let outcomes = pipeline::ingest_files(&pool, &gateway, &mentor, &csv).await?;

            let mut failures = 0usize;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(summary) => println!(
                        "- {}: {} rows (high {}, medium {}, low {}), {} successes",
                        summary.file_name,
                        summary.total_rows,
                        summary.risk_high,
                        summary.risk_medium,
                        summary.risk_low,
                        summary.success_events
                    ),
                    Err(err) if err.is_skip() => {
                        println!("- {}: skipped ({})", outcome.file_name, err)
                    }
                    Err(err) => {
                        failures += 1;
                        println!("- {}: [{}] {}", outcome.file_name, err.kind(), err);
                    }
                }
            }
            if failures > 0 && failures == outcomes.len() {
                anyhow::bail!("all {failures} files failed to import");
            }
        }
        Commands::SetActive {
            mentor,
            institute,
            active,
        } => {
            let changed = if let Some(email) = mentor {
                aggregate::set_mentor_active(&pool, &email, active).await?
            } else if let Some(name) = institute {
                aggregate::set_institute_active(&pool, &name, active).await?
            } else {
                unreachable!("clap enforces the scope group");
            };
            if changed {
                println!("Status updated.");
            } else {
                println!("Status unchanged; counters untouched.");
            }
        }
        Commands::RemoveMentor { email } => {
            let removal = aggregate::remove_mentor(&pool, &email).await?;
            let subtracted = removal.counters_subtracted;
            println!(
                "Removed {} and {} students; backed high/medium/low {}/{}/{} out of the parent counters.",
                removal.mentor_email,
                removal.students_removed,
                subtracted.risk_high,
                subtracted.risk_medium,
                subtracted.risk_low
            );
        }
        Commands::RemoveInstitute { name } => {
            let removal = aggregate::remove_institute(&pool, &name).await?;
            println!(
                "Removed {} with {} accounts and {} students; platform counters corrected.",
                removal.institute_name, removal.actors_removed, removal.students_removed
            );
        }
        Commands::Report {
            mentor,
            institute,
            out,
        } => {
            let (label, actor, students) = if let Some(email) = mentor {
                let actor = db::fetch_actor(&pool, &email)
                    .await?
                    .filter(|a| a.role == ActorRole::Mentor)
                    .ok_or_else(|| PipelineError::UnknownActor(email.clone()))?;
                let students = db::fetch_students(&pool, Some(actor.id), None).await?;
                (format!("mentor {email}"), actor, students)
            } else if let Some(name) = institute {
                let institute = require_institute(&pool, &name).await?;
                let admin = db::fetch_admin(&pool, institute.id)
                    .await?
                    .ok_or_else(|| PipelineError::UnknownActor(format!("no admin for {name}")))?;
                let students = db::fetch_students(&pool, None, Some(institute.id)).await?;
                (institute.name.clone(), admin, students)
            } else {
                let root = db::fetch_actor_by_id(&pool, db::SUPER_ADMIN_ID)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::UnknownActor("platform super admin".to_string())
                    })?;
                let students = db::fetch_students(&pool, None, None).await?;
                ("the whole platform".to_string(), root, students)
            };

            let rendered = report::render_report(&label, &actor, &students);
            std::fs::write(&out, rendered)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Audit => {
            let rows = db::audit_counters(&pool).await?;
            let drifted = rows.iter().filter(|r| r.has_drift()).count();
            print!("{}", report::render_audit(&rows));
            if drifted > 0 {
                anyhow::bail!("{drifted} actors have drifted counters");
            }
        }
    }

    Ok(())
}

async fn require_institute(pool: &PgPool, name: &str) -> anyhow::Result<models::Institute> {
    Ok(db::fetch_institute(pool, name)
        .await?
        .ok_or_else(|| PipelineError::UnknownActor(format!("institute {name}")))?)
}

/// Accepts either a bare rule array or a full draft payload with a
/// `columns` key, so `draft --out` files feed straight back in.
fn load_rules(path: &Path) -> anyhow::Result<Vec<ColumnRule>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rules from {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let rules = match value.get("columns") {
        Some(columns) => serde_json::from_value(columns.clone())?,
        None => serde_json::from_value(value)?,
    };
    Ok(rules)
}
