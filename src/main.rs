//! wsfs command line front end
//!
//! One-shot operations print JSON to stdout. `serve` speaks the request
//! protocol as JSON lines over stdin/stdout; logs always go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use wsfs::filesystem::config::{ConfigOverrides, FileSystemConfig};
use wsfs::filesystem::operations::{CreateOptions, ReadOptions, TreeOptions};
use wsfs::filesystem::FileSystemService;
use wsfs::protocol::{FileEncoding, FileSystemError, FsRequest, FsResponse, NodeType};

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "wsfs")]
#[command(about = "Workspace-scoped filesystem for remote clients", version)]
struct Cli {
    /// Workspace root (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// JSON config file merged over the defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the directory tree
    Tree {
        #[arg(default_value = ".")]
        path: String,
        #[arg(long)]
        depth: Option<usize>,
        #[arg(long)]
        hidden: bool,
        /// List entries matched by .gitignore too
        #[arg(long)]
        no_gitignore: bool,
    },
    /// Read a file
    Open {
        path: String,
        #[arg(long)]
        max_length: Option<u64>,
        #[arg(long)]
        base64: bool,
    },
    /// Create a file, or a directory with --dir
    Create {
        path: String,
        #[arg(long, conflicts_with = "dir")]
        content: Option<String>,
        #[arg(long)]
        dir: bool,
        #[arg(long)]
        overwrite: bool,
    },
    /// Delete a file or directory
    Delete {
        path: String,
        /// Only unlink a single file
        #[arg(long)]
        strict: bool,
    },
    /// Rename or move a path inside the workspace
    Rename { source: String, destination: String },
    /// Show metadata
    Stats {
        path: String,
        #[arg(long)]
        dir_size: bool,
    },
    /// Stream change events until Ctrl+C
    Watch {
        #[arg(default_value = ".")]
        path: String,
    },
    /// Answer JSON requests on stdin, one per line
    Serve,
    /// Inspect or persist the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    Show,
    Save { path: PathBuf },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = effective_config(&cli);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            if let Some(FileSystemError::SecurityDenied { suggestions, .. }) =
                e.downcast_ref::<FileSystemError>()
            {
                for suggestion in suggestions {
                    eprintln!("  {} {}", "hint:".cyan(), suggestion);
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn effective_config(cli: &Cli) -> FileSystemConfig {
    let mut config = FileSystemConfig::from_env();
    if let Some(path) = &cli.config {
        config = FileSystemConfig::load(path, config);
    }
    config.merge(ConfigOverrides {
        workspace_root: cli.root.clone(),
        debug: cli.debug.then_some(true),
        ..Default::default()
    })
}

async fn run(command: Command, config: FileSystemConfig) -> CliResult {
    if let Command::Config { action } = &command {
        return match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Save { path } => {
                config.save(path)?;
                println!("{} {}", "Saved".green(), path.display());
                Ok(())
            }
        };
    }

    let service = FileSystemService::new(config)?;

    match command {
        Command::Tree {
            path,
            depth,
            hidden,
            no_gitignore,
        } => {
            let options = TreeOptions {
                max_depth: depth,
                show_hidden: Some(hidden),
                respect_gitignore: no_gitignore.then_some(false),
            };
            print_json(&service.tree(&path, options).await?)
        }
        Command::Open {
            path,
            max_length,
            base64,
        } => {
            let options = ReadOptions {
                max_length,
                encoding: base64.then_some(FileEncoding::Base64),
            };
            print_json(&service.open(&path, options).await?)
        }
        Command::Create {
            path,
            content,
            dir,
            overwrite,
        } => {
            let options = CreateOptions {
                content,
                kind: Some(if dir { NodeType::Directory } else { NodeType::File }),
                encoding: None,
                overwrite,
            };
            service.create(&path, options).await?;
            println!("{} {}", "Created".green(), path);
            Ok(())
        }
        Command::Delete { path, strict } => {
            service.delete(&path, Some(!strict)).await?;
            println!("{} {}", "Deleted".green(), path);
            Ok(())
        }
        Command::Rename {
            source,
            destination,
        } => {
            service.rename(&source, &destination).await?;
            println!("{} {} -> {}", "Renamed".green(), source, destination);
            Ok(())
        }
        Command::Stats { path, dir_size } => print_json(&service.stats(&path, dir_size).await?),
        Command::Watch { path } => watch(&service, &path).await,
        Command::Serve => serve(&service).await,
        Command::Config { .. } => Ok(()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn watch(service: &FileSystemService, path: &str) -> CliResult {
    const CLIENT_ID: &str = "cli";
    let mut events = service.events(CLIENT_ID);
    let watched = service.watch(CLIENT_ID, path).await?;
    eprintln!("{} {} (Ctrl+C to stop)", "Watching".cyan(), watched);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
        }
    }

    service.disconnect(CLIENT_ID);
    Ok(())
}

/// JSON lines over stdio. Watch events are written as `{"event": ...}`
/// lines between responses.
async fn serve(service: &FileSystemService) -> CliResult {
    let client_id = uuid::Uuid::new_v4().to_string();
    let mut events = service.events(&client_id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    tracing::info!("Serving client {} over stdio", client_id);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<FsRequest>(&line) {
                    Ok(request) => service.handle(&client_id, request).await,
                    Err(e) => {
                        tracing::debug!("Unparseable request: {}", e);
                        FsResponse::failure(
                            None,
                            FileSystemError::IoError {
                                message: format!("Invalid request: {}", e),
                            },
                        )
                    }
                };
                write_line(&mut stdout, &serde_json::to_string(&response)?).await?;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let line = serde_json::to_string(&serde_json::json!({ "event": event }))?;
                write_line(&mut stdout, &line).await?;
            }
        }
    }

    let removed = service.disconnect(&client_id);
    tracing::info!("Client {} closed stdin, {} watch(es) released", client_id, removed);
    Ok(())
}

async fn write_line(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
