use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use warden::error::Result;
use warden::manager::LeaseManager;
use warden::model::EmbedPolicy;
use warden::output::{self, Format};
use warden::Settings;
use warden::sweeper::Sweeper;

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Advisory file-lease coordination for agent fleets"
)]
struct Cli {
    /// Output format
    #[arg(long, global = true, value_enum, default_value = "json")]
    format: Format,
    /// Storage root (default: $WARDEN_STORAGE_ROOT or ./storage)
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an agent under a project
    Register {
        /// Project key (usually the absolute repo path)
        project: String,
        /// Agent name (omit for a generated codename)
        #[arg(long)]
        name: Option<String>,
        /// Program driving the agent
        #[arg(long, default_value = "")]
        program: String,
        /// Model behind the agent
        #[arg(long, default_value = "")]
        model: String,
        /// One-line task description
        #[arg(long, default_value = "")]
        task: String,
    },
    /// Request leases on path patterns
    Claim {
        /// Project key
        project: String,
        /// Requesting agent
        #[arg(long, required = true)]
        agent: String,
        /// Path patterns to lease (comma-separated)
        #[arg(required = true, value_delimiter = ',')]
        paths: Vec<String>,
        /// Lease lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: i64,
        /// Allow other shared holders on overlapping patterns
        #[arg(long)]
        shared: bool,
        /// Why the lease is needed
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Release leases (all active for the agent when no filter is given)
    Release {
        /// Project key
        project: String,
        /// Releasing agent
        #[arg(long, required = true)]
        agent: String,
        /// Lease ids to release (comma-separated)
        #[arg(long, value_delimiter = ',')]
        id: Vec<i64>,
        /// Exact path patterns to release (comma-separated)
        #[arg(long, value_delimiter = ',')]
        path: Vec<String>,
    },
    /// List active leases for a project
    Claims {
        /// Project key
        project: String,
    },
    /// List every project that has held a lease
    Projects,
    /// Send a message between agents, with optional image attachments
    Send {
        /// Project key
        project: String,
        /// Sending agent
        #[arg(long, required = true)]
        from: String,
        /// Recipient agents (comma-separated)
        #[arg(long, required = true, value_delimiter = ',')]
        to: Vec<String>,
        /// Message subject
        #[arg(long, required = true)]
        subject: String,
        /// Markdown body
        #[arg(long, default_value = "")]
        body: String,
        /// Image files to attach (repeatable)
        #[arg(long = "attach")]
        attach: Vec<PathBuf>,
        /// Force attachments inline regardless of size
        #[arg(long, conflicts_with = "file_attachments")]
        inline_attachments: bool,
        /// Force attachments to file references regardless of size
        #[arg(long)]
        file_attachments: bool,
    },
    /// Expire stale leases
    Sweep {
        /// Sweep a single project once (omit to sweep everything)
        #[arg(long, conflicts_with = "interval")]
        project: Option<String>,
        /// Keep running, sweeping every N seconds
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn settings_for(cli: &Cli) -> Settings {
    match &cli.root {
        Some(root) => Settings {
            storage_root: root.clone(),
            ..Settings::from_env()
        },
        None => Settings::from_env(),
    }
}

fn run(cli: Cli, format: Format) -> Result<()> {
    let settings = settings_for(&cli);
    let manager = LeaseManager::new(settings)?;

    match cli.command {
        Commands::Register {
            project,
            name,
            program,
            model,
            task,
        } => {
            let (project, agent) =
                manager.register_agent(&project, name.as_deref(), &program, &model, &task)?;
            output::print_agent(&project, &agent, format)?;
        }
        Commands::Claim {
            project,
            agent,
            paths,
            ttl,
            shared,
            reason,
        } => {
            let outcome = manager.request(&project, &agent, &paths, ttl, !shared, &reason)?;
            output::print_outcome(&outcome, format)?;
        }
        Commands::Release {
            project,
            agent,
            id,
            path,
        } => {
            let receipt = manager.release(&project, &agent, &id, &path)?;
            output::print_receipt(&receipt, format)?;
        }
        Commands::Claims { project } => {
            let leases = manager.list_active(&project)?;
            output::print_leases(&leases, format)?;
        }
        Commands::Projects => {
            let projects = manager.db().projects_with_leases()?;
            output::print_projects(&projects, format)?;
        }
        Commands::Send {
            project,
            from,
            to,
            subject,
            body,
            attach,
            inline_attachments,
            file_attachments,
        } => {
            let policy = if inline_attachments {
                EmbedPolicy::Inline
            } else if file_attachments {
                EmbedPolicy::File
            } else {
                EmbedPolicy::Auto
            };
            let mut attachments = Vec::with_capacity(attach.len());
            for path in &attach {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("bin")
                    .to_string();
                attachments.push((std::fs::read(path)?, ext));
            }
            let commit =
                manager.send_message(&project, &from, &to, &subject, &body, &attachments, policy)?;
            match format {
                Format::Json => println!("{}", serde_json::json!({ "commit": commit })),
                Format::Pretty => println!("sent '{}' to {}", subject, to.join(", ")),
            }
        }
        Commands::Sweep { project, interval } => {
            if let Some(secs) = interval {
                let pause = std::time::Duration::from_secs(secs.max(1));
                loop {
                    let expired = Sweeper::sweep_once(&manager)?;
                    output::print_sweep(expired, format)?;
                    std::thread::sleep(pause);
                }
            }
            let expired = match project {
                Some(project) => manager.expire_stale(&project)?,
                None => Sweeper::sweep_once(&manager)?,
            };
            output::print_sweep(expired, format)?;
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = cli.format;
    if let Err(e) = run(cli, format) {
        match format {
            Format::Json => {
                eprintln!(
                    "{}",
                    serde_json::json!({
                        "error": e.code(),
                        "message": e.to_string()
                    })
                );
            }
            Format::Pretty => eprintln!("error: {e}"),
        }
        std::process::exit(1);
    }
}
