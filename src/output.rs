use clap::ValueEnum;
use colored::Colorize;

use crate::error::Result;
use crate::model::{Agent, BatchOutcome, Lease, Project, ReleaseReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
}

pub fn print_agent(project: &Project, agent: &Agent, format: Format) -> Result<()> {
    match format {
        Format::Json => println!(
            "{}",
            serde_json::json!({ "project": project, "agent": agent })
        ),
        Format::Pretty => {
            println!("Registered '{}' in {}", agent.name.cyan().bold(), project.slug);
            if !agent.program.is_empty() {
                println!("  {} {} ({})", "program:".dimmed(), agent.program, agent.model);
            }
            if !agent.task_description.is_empty() {
                println!("  {} {}", "task:".dimmed(), agent.task_description);
            }
        }
    }
    Ok(())
}

pub fn print_outcome(outcome: &BatchOutcome, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(outcome)?),
        Format::Pretty => {
            for grant in &outcome.granted {
                let mode = if grant.exclusive { "exclusive" } else { "shared" };
                println!(
                    "{} {} ({mode}, until {})",
                    "granted".green().bold(),
                    grant.path_pattern,
                    grant.expires_ts.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            for conflict in &outcome.conflicts {
                println!("{} {}", "blocked".red().bold(), conflict.path);
                for holder in &conflict.holders {
                    let mode = if holder.exclusive { "exclusive" } else { "shared" };
                    println!(
                        "  held by {} as '{}' ({mode}, until {})",
                        holder.agent.cyan(),
                        holder.path_pattern,
                        holder.expires_ts.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
            }
            if outcome.granted.is_empty() && outcome.conflicts.is_empty() {
                println!("nothing requested");
            }
        }
    }
    Ok(())
}

pub fn print_leases(leases: &[Lease], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(leases)?),
        Format::Pretty => {
            if leases.is_empty() {
                println!("no active leases");
                return Ok(());
            }
            for lease in leases {
                let mode = if lease.exclusive { "exclusive" } else { "shared" };
                println!(
                    "{:>4} {} {} ({mode}, until {})",
                    lease.id,
                    lease.agent_name.cyan(),
                    lease.path_pattern,
                    lease.expires_ts.format("%Y-%m-%d %H:%M:%S UTC")
                );
                if !lease.reason.is_empty() {
                    println!("     {} {}", "reason:".dimmed(), lease.reason);
                }
            }
        }
    }
    Ok(())
}

pub fn print_receipt(receipt: &ReleaseReceipt, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(receipt)?),
        Format::Pretty => println!("released {} lease(s)", receipt.released),
    }
    Ok(())
}

pub fn print_projects(projects: &[Project], format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string(projects)?),
        Format::Pretty => {
            for project in projects {
                println!("{} ({})", project.slug.bold(), project.human_key);
            }
            if projects.is_empty() {
                println!("no projects with leases");
            }
        }
    }
    Ok(())
}

pub fn print_sweep(expired: usize, format: Format) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::json!({ "expired": expired })),
        Format::Pretty => println!("expired {} stale lease(s)", expired),
    }
    Ok(())
}
