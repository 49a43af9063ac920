use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use gitsync::cache::{CacheMessage, DeletionReport, NoAgents, apply_message, describe};
use gitsync::types::AccessData;
use gitsync::{Host, OperationsProvider, SyncConfig, SyncServices};

#[derive(Parser)]
#[command(
    name = "gitsync",
    about = "Keep shared git caches in sync and check out build sources"
)]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the cache directory of a repository
    CacheDir {
        /// Configured repository name or URL
        repo: String,
    },

    /// Print the latest revision of the configured branch
    Latest { repo: String },

    /// Check out a revision into a directory
    Checkout {
        repo: String,
        /// Target directory
        dir: PathBuf,
        /// Revision to check out; the latest one when omitted
        #[arg(long)]
        revision: Option<String>,
        /// History depth the build needs
        #[arg(long, default_value_t = 1)]
        depth: u32,
        /// Behave like a remote agent
        #[arg(long)]
        remote: bool,
    },

    /// List commits since a revision
    Changes {
        repo: String,
        /// Revision of the previous build
        #[arg(long)]
        since: Option<String>,
        /// Stop at this revision instead of the branch head
        #[arg(long)]
        to: Option<String>,
    },

    /// List the branches on the remote
    Branches { repo: String },

    /// Inspect and clean up cache directories
    Caches {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Describe every cache directory
    List,

    /// Delete the named caches
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Delete caches no configured repository uses
    Prune,

    /// Apply a cache message received from another host
    Apply {
        /// The message as JSON
        message: String,
    },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig::resolve(cli.config.as_deref())?;
    let services = Arc::new(SyncServices::new(config));

    match cli.command {
        Commands::CacheDir { repo } => cmd_cache_dir(&services, &repo),
        Commands::Latest { repo } => cmd_latest(&services, &repo),
        Commands::Checkout {
            repo,
            dir,
            revision,
            depth,
            remote,
        } => cmd_checkout(&services, &repo, &dir, revision.as_deref(), depth, remote),
        Commands::Changes { repo, since, to } => {
            cmd_changes(&services, &repo, since.as_deref(), to.as_deref())
        }
        Commands::Branches { repo } => cmd_branches(&services, &repo),
        Commands::Caches { command } => match command {
            CacheCommands::List => cmd_caches_list(&services),
            CacheCommands::Delete { keys } => cmd_caches_delete(&services, &keys),
            CacheCommands::Prune => cmd_caches_prune(&services),
            CacheCommands::Apply { message } => cmd_caches_apply(&services, &message),
        },
    }
}

/// A configured repository by name, or an ad-hoc one by URL.
fn access_for(services: &SyncServices, repo: &str) -> Result<AccessData, Box<dyn std::error::Error>> {
    if let Some(configured) = services.config().repository(repo) {
        return Ok(configured.to_access()?);
    }
    if repo.contains("://") || repo.contains('@') || Path::new(repo).is_absolute() {
        return Ok(AccessData::builder(repo).build()?);
    }
    Err(format!("Unknown repository: {}", repo).into())
}

fn cmd_cache_dir(services: &SyncServices, repo: &str) -> Result<(), Box<dyn std::error::Error>> {
    let access = access_for(services, repo)?;
    println!("{}", services.paths().cache_dir(&access).display());
    Ok(())
}

fn cmd_latest(services: &Arc<SyncServices>, repo: &str) -> Result<(), Box<dyn std::error::Error>> {
    let access = access_for(services, repo)?;
    let ops = services.operations_for(&access);
    println!("{}", ops.obtain_latest_revision()?);
    Ok(())
}

fn cmd_checkout(
    services: &Arc<SyncServices>,
    repo: &str,
    dir: &Path,
    revision: Option<&str>,
    depth: u32,
    remote: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let access = access_for(services, repo)?;
    let host = if remote { Host::Remote } else { Host::Local };
    let checked_out = services
        .repository(access, host)
        .retrieve_source(revision, dir, depth)?;

    println!("Checked out {} into {}", checked_out, dir.display());
    Ok(())
}

fn cmd_changes(
    services: &Arc<SyncServices>,
    repo: &str,
    since: Option<&str>,
    to: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let access = access_for(services, repo)?;
    let changes = services
        .repository(access, Host::Local)
        .collect_changes(since, to)?;

    println!("Revision: {}", changes.revision);
    for commit in &changes.commits {
        println!(
            "  {}  {}  {}",
            short(&commit.id),
            commit.timestamp.format("%Y-%m-%d %H:%M"),
            commit.summary()
        );
        println!("      {}", commit.author);
        for file in &commit.files {
            println!("      {}", file.path);
        }
    }
    if changes.skipped > 0 {
        println!("  ... {} more commits not shown", changes.skipped);
    }
    Ok(())
}

fn cmd_branches(services: &Arc<SyncServices>, repo: &str) -> Result<(), Box<dyn std::error::Error>> {
    let access = access_for(services, repo)?;
    for branch in services.repository(access, Host::Local).open_branches()? {
        println!("{}", branch);
    }
    Ok(())
}

fn cmd_caches_list(services: &SyncServices) -> Result<(), Box<dyn std::error::Error>> {
    let caches = services.lifecycle(Arc::new(NoAgents))?.describe_all()?;
    if caches.is_empty() {
        println!("No caches");
        return Ok(());
    }

    for cache in caches {
        println!("{}", cache.key);
        println!("  Path:        {}", cache.path.display());
        println!("  Description: {}", cache.description);
        if cache.is_orphaned() {
            println!("  Used by:     (unused)");
        } else {
            println!("  Used by:     {}", cache.used_by.join(", "));
        }
    }
    Ok(())
}

fn cmd_caches_delete(services: &SyncServices, keys: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let report = services.lifecycle(Arc::new(NoAgents))?.delete_specific(keys);
    print_report(&report)
}

fn cmd_caches_prune(services: &SyncServices) -> Result<(), Box<dyn std::error::Error>> {
    for repo in &services.config().repositories {
        log::debug!("Keeping cache of {}: {}", repo.name, describe(&repo.to_access()?));
    }
    let report = services.lifecycle(Arc::new(NoAgents))?.delete_unused()?;
    print_report(&report)
}

fn cmd_caches_apply(services: &SyncServices, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let message = CacheMessage::from_json(message)?;
    let report = apply_message(&message, services.paths(), services.locks())?;
    print_report(&report)
}

fn print_report(report: &DeletionReport) -> Result<(), Box<dyn std::error::Error>> {
    for line in report.messages() {
        println!("{}", line);
    }
    let failed: Vec<&str> = report.failed().collect();
    if !failed.is_empty() {
        return Err(format!("Failed to delete: {}", failed.join(", ")).into());
    }
    Ok(())
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
