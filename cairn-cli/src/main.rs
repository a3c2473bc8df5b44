use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;

use cairn_state::{
    Backend, BackendConfig, DEFAULT_WORKSPACE, RemoteState, StateManager, create_backend,
};

#[derive(Parser)]
#[command(name = "cairn")]
#[command(about = "Manage workspaces in a remote state backend", long_about = None)]
struct Cli {
    /// Path to the backend configuration (JSON)
    #[arg(long, short, global = true, default_value = "backend.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Workspace management commands
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// State inspection commands
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Release a lock left behind by an interrupted operation
    ForceUnlock {
        /// Lock ID reported by the failed operation
        lock_id: String,

        /// Workspace the lock belongs to
        #[arg(long, short, default_value = DEFAULT_WORKSPACE)]
        workspace: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// List all workspaces
    List,
    /// Create a workspace, writing its initial empty state
    New {
        /// Workspace name
        name: String,
    },
    /// Delete a workspace's state
    Delete {
        /// Workspace name
        name: String,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Print the stored state of a workspace
    Show {
        /// Workspace to read
        #[arg(long, short, default_value = DEFAULT_WORKSPACE)]
        workspace: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let result = match load_backend(&cli.config).await {
        Ok(backend) => match cli.command {
            Commands::Workspace { command } => run_workspace_command(&backend, command).await,
            Commands::State { command } => run_state_command(&backend, command).await,
            Commands::ForceUnlock {
                lock_id,
                workspace,
                force,
            } => run_force_unlock(&backend, &workspace, &lock_id, force).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn read_config(path: &Path) -> Result<BackendConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    BackendConfig::from_json(&content).map_err(|e| e.to_string())
}

async fn load_backend(path: &Path) -> Result<Backend, String> {
    let config = read_config(path)?;
    log::debug!("using {} backend, bucket {}", config.backend_type, config.bucket);
    create_backend(config).await.map_err(|e| e.to_string())
}

async fn run_workspace_command(backend: &Backend, command: WorkspaceCommands) -> Result<(), String> {
    match command {
        WorkspaceCommands::List => {
            let workspaces = backend.workspaces().await.map_err(|e| e.to_string())?;
            for line in format_workspaces(&workspaces) {
                println!("{}", line);
            }
            Ok(())
        }
        WorkspaceCommands::New { name } => {
            if backend
                .workspaces()
                .await
                .map_err(|e| e.to_string())?
                .contains(&name)
            {
                return Err(format!("Workspace \"{}\" already exists", name));
            }
            backend.state_mgr(&name).await.map_err(|e| e.to_string())?;
            println!("{}", created_message(&name).green());
            Ok(())
        }
        WorkspaceCommands::Delete { name } => {
            backend
                .delete_workspace(&name)
                .await
                .map_err(|e| e.to_string())?;
            println!("{}", format!("Deleted workspace \"{}\"!", name).green());
            Ok(())
        }
    }
}

async fn run_state_command(backend: &Backend, command: StateCommands) -> Result<(), String> {
    match command {
        StateCommands::Show { workspace } => {
            // plain read, never initializes the workspace
            let client = backend
                .remote_client(&workspace)
                .await
                .map_err(|e| e.to_string())?;
            let mut state_mgr = RemoteState::new(client);
            state_mgr.refresh_state().await.map_err(|e| e.to_string())?;

            match state_mgr.state() {
                Some(state) => {
                    let json = serde_json::to_string_pretty(state).map_err(|e| e.to_string())?;
                    println!("{}", json);
                }
                None => println!("{}", "No state.".yellow()),
            }
            Ok(())
        }
    }
}

async fn run_force_unlock(
    backend: &Backend,
    workspace: &str,
    lock_id: &str,
    force: bool,
) -> Result<(), String> {
    if let Some(holder) = backend
        .lock_info(workspace)
        .await
        .map_err(|e| e.to_string())?
    {
        println!("Lock Info:");
        println!("  ID:        {}", holder.id);
        println!("  Path:      {}", holder.path);
        println!("  Operation: {}", holder.operation);
        println!("  Who:       {}", holder.who);
        println!("  Created:   {}", holder.created);
        println!();
    }

    if !force {
        println!("{}", "Do you really want to force-unlock?".yellow().bold());
        println!(
            "  {}",
            "Removing the lock while another operation runs may corrupt the state. Type 'yes' to confirm."
                .yellow()
        );
        print!("\n  Enter a value: ");
        std::io::stdout().flush().map_err(|e| e.to_string())?;

        let mut input = String::new();
        std::io::stdin()
            .read_line(&mut input)
            .map_err(|e| e.to_string())?;

        if input.trim() != "yes" {
            println!();
            println!("{}", "Force-unlock cancelled.".yellow());
            return Ok(());
        }
        println!();
    }

    backend
        .force_unlock(workspace, lock_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", "The state has been successfully unlocked!".green().bold());
    Ok(())
}

fn created_message(name: &str) -> String {
    format!("Created workspace \"{}\"!", name)
}

/// One output line per workspace; the default workspace is marked
fn format_workspaces(workspaces: &[String]) -> Vec<String> {
    workspaces
        .iter()
        .map(|name| {
            if name == DEFAULT_WORKSPACE {
                format!("* {}", name)
            } else {
                format!("  {}", name)
            }
        })
        .collect()
}
