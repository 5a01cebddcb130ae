// src/main.rs

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use vaultsync::engine::FileNode;
use vaultsync::{Coordinator, CoordinatorConfig, DeleteOutcome, LocalBackend};

const USAGE: &str = "Usage: vaultsync [--config <file>] <command>

Commands:
  list                          List registered vaults
  create <name>                 Create a managed vault
  add <path> <name>             Register an existing folder as a vault
  open <id>                     Open a vault and print its tree
  delete <id> [--files] [--force]
  health                        Report vaults whose folder is missing
  cleanup                       Drop all broken vaults from the registry";

fn print_nodes(nodes: &[FileNode], depth: usize) {
    for node in nodes {
        let marker = if node.is_cycle {
            " ↺"
        } else if node.error.is_some() {
            " ⚠"
        } else if node.is_directory {
            "/"
        } else {
            ""
        };
        println!("{}{}{}", "  ".repeat(depth), node.name, marker);
        if let Some(children) = &node.children {
            print_nodes(children, depth + 1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let mut config_path: Option<PathBuf> = None;
    if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            eprintln!("{}", USAGE);
            return Ok(());
        }
        config_path = Some(PathBuf::from(args.remove(1)));
        args.remove(0);
    }
    if args.is_empty() {
        eprintln!("{}", USAGE);
        return Ok(());
    }

    // ========== CONFIG + BACKEND ==========
    let config = CoordinatorConfig::load_or_default(config_path.as_deref())?;
    let data_dir = config.resolved_data_dir();
    let backend = LocalBackend::open(data_dir.clone())?;
    if backend.recovery().recovered {
        tracing::warn!(
            "Recovered from an interrupted operation: {}",
            backend.recovery().message.as_deref().unwrap_or("no details")
        );
    }
    tracing::debug!("Data directory: {}", data_dir.display());

    let coordinator = Coordinator::new(config, Arc::new(backend));
    let vaults = coordinator.vault_controller();

    let flag = |name: &str| args.iter().any(|a| a == name);
    let positional: Vec<&str> = args
        .iter()
        .skip(1)
        .filter(|a| !a.starts_with("--"))
        .map(String::as_str)
        .collect();

    match (args[0].as_str(), positional.as_slice()) {
        ("list", []) => {
            let list = vaults.list_vaults().await?;
            let last = coordinator.state.vault().last_vault_id.clone();
            if list.is_empty() {
                println!("No vaults registered.");
            }
            for v in list {
                let mark = if last.as_deref() == Some(v.id.as_str()) { "*" } else { " " };
                println!("{} {}  {}  {}", mark, v.id, v.name, v.path);
            }
        }
        ("create", [name]) => {
            let vault = vaults.create_vault(name).await?;
            println!("Created {} at {}", vault.id, vault.path);
        }
        ("add", [path, name]) => {
            let vault = vaults.add_external_vault(path, name).await?;
            println!("Added {} at {}", vault.id, vault.path);
        }
        ("open", [id]) => {
            let vault = vaults.open_vault(id).await?;
            println!("{} ({})", vault.name, vault.path);
            let fs = coordinator.state.file_system();
            if let Some(err) = &fs.tree_error {
                println!("Tree could not be loaded: {}", err);
            }
            if let Some(tree) = &fs.tree {
                print_nodes(&tree.nodes, 1);
                println!(
                    "{} entries in {}ms{}",
                    tree.total_nodes,
                    tree.elapsed_ms,
                    if tree.truncated { " (truncated)" } else { "" }
                );
            }
        }
        ("delete", [id]) => match vaults.delete_vault(id, flag("--files"), flag("--force")).await? {
            DeleteOutcome::Deleted => println!("Deleted {}", id),
            DeleteOutcome::NeedsConfirmation { message } => {
                println!("{}", message);
                println!("Re-run with --force to proceed.");
            }
        },
        ("health", []) => {
            let report = vaults.check_health().await?;
            println!("{} healthy, {} broken", report.healthy.len(), report.broken.len());
            for b in report.broken {
                println!("  {}  {}  {} ({})", b.id, b.name, b.path, b.reason);
            }
        }
        ("cleanup", []) => {
            let report = vaults.cleanup_broken_vaults().await?;
            println!("Removed {} broken vault(s)", report.cleaned);
        }
        _ => eprintln!("{}", USAGE),
    }

    Ok(())
}
