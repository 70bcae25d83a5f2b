use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use statevault::{ArchiveOptions, ArchiveOutcome, JobKind, MaintenanceScheduler, VaultConfig};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "vault-tool")]
#[command(about = "Operator tooling for StateVault data directories")]
struct Cli {
    /// JSON configuration file. Environment overrides apply on top.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding configuration and environment.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print quota usage, archive totals and writer counters
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Print the health verdict; exits non-zero when unhealthy
    Health,
    /// Archive every over-quota document
    Enforce,
    /// Archive old records of one document
    Archive {
        name: String,
        #[arg(long)]
        force: bool,
    },
    /// Run the configured archive pass over all target documents
    ArchiveAll,
    /// Delete archives past retention
    Clean,
    ListArchives,
    /// Decompress an archive and print or save its records
    Restore {
        file_name: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Roll back or finish commits interrupted by a crash
    Recover,
    /// Start the scheduler and run until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.data_dir)?;
    let vault = MaintenanceScheduler::new(config);

    match cli.command {
        Command::Status { json } => {
            let status = vault.check_status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("{}", status);
            }
        }
        Command::Health => {
            let health = vault.health();
            println!("{}", health);
            if !health.healthy {
                std::process::exit(1);
            }
        }
        Command::Enforce => {
            let results = vault.enforce_quotas().await;
            if results.is_empty() {
                println!("No documents over quota");
            }
            for result in results {
                let verdict = if result.still_over_quota { "STILL OVER QUOTA" } else { "ok" };
                match (&result.outcome, &result.error) {
                    (_, Some(err)) => println!("{}: failed: {}", result.name, err),
                    (Some(outcome), None) => println!("{}: {} ({})", result.name, describe(outcome), verdict),
                    (None, None) => println!("{}: {}", result.name, verdict),
                }
            }
        }
        Command::Archive { name, force } => {
            let options = ArchiveOptions {
                force,
                threshold_bytes: None,
            };
            let outcome = vault
                .archiver()
                .archive_file(&name, options)
                .await
                .with_context(|| format!("archiving {}", name))?;
            println!("{}: {}", name, describe(&outcome));
        }
        Command::ArchiveAll => {
            for (name, outcome) in vault.archive_old_data().await {
                match outcome {
                    Ok(outcome) => println!("{}: {}", name, describe(&outcome)),
                    Err(err) => println!("{}: failed: {}", name, err),
                }
            }
        }
        Command::Clean => {
            let report = vault.clean_old_archives();
            println!(
                "Deleted {} archives, freed {} KiB",
                report.deleted.len(),
                report.freed_bytes / 1024
            );
            for name in &report.failed {
                println!("Could not delete {}", name);
            }
        }
        Command::ListArchives => {
            let archives = vault.archiver().list_archives()?;
            if archives.is_empty() {
                println!("No archives in {}", vault.archiver().archive_dir().display());
            }
            for entry in archives {
                let created = entry
                    .created
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}\t{}\t{} KiB\t{}", entry.file_name, entry.document, entry.size_bytes / 1024, created);
            }
        }
        Command::Restore { file_name, out } => {
            let records = vault.archiver().restore_archive(&file_name)?;
            let pretty = serde_json::to_string_pretty(&records)?;
            match out {
                Some(path) => {
                    ensure_parent_dir(&path)?;
                    std::fs::write(&path, pretty)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Restored {} to {}", file_name, path.display());
                }
                None => println!("{}", pretty),
            }
        }
        Command::Recover => {
            let report = vault.recover().await?;
            if report.is_clean() {
                println!("Nothing to recover");
            } else {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            if !report.unresolved.is_empty() {
                return Err(anyhow!("{} commits could not be resolved", report.unresolved.len()));
            }
        }
        Command::Run => {
            vault.initialize().await?;
            vault.run_job(JobKind::StatusReport).await?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            if !vault.shutdown().await {
                return Err(anyhow!("shutdown flush timed out"));
            }
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("statevault=info,vault_tool=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<VaultConfig> {
    let config = match path {
        Some(path) => VaultConfig::from_file(path)?,
        None => VaultConfig::default(),
    };
    let mut config = config.apply_env()?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    config.validate()?;
    Ok(config)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

fn describe(outcome: &ArchiveOutcome) -> String {
    match outcome {
        ArchiveOutcome::Archived(report) => format!(
            "archived {} records to {} ({} -> {} KiB, {}% compression)",
            report.old_entries,
            report.archive_path.display(),
            report.original_size / 1024,
            report.new_size / 1024,
            report.compression_ratio
        ),
        ArchiveOutcome::Skipped(reason) => format!("skipped ({:?})", reason),
    }
}
