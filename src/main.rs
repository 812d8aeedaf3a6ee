use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use mmdex::index::search::SearchOptions;
use mmdex::resync::{ProgressEvent, ResyncOptions};
use mmdex::{DistanceMetric, EmbedOptions, Mmdex};

#[derive(Parser)]
#[command(name = "mmdex", version, about = "Multimodal document ingestion and retrieval")]
struct Cli {
    /// Increase logging verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a file into a documents folder.
    Ingest {
        /// Path to the file to ingest.
        file: PathBuf,
        /// Target folder under the documents root.
        #[arg(long, default_value = "custom-documents")]
        folder: String,
    },
    /// Rescan the documents tree and rebuild the folder caches.
    Resync {
        /// Ignore caches and rescan everything.
        #[arg(long)]
        force: bool,
        /// Restrict the scan to one folder.
        #[arg(long)]
        folder: Option<String>,
        /// Batch size override.
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Embed documents into a workspace collection.
    Embed {
        /// Workspace name (collection namespace).
        #[arg(long)]
        workspace: String,
        /// Document record paths to embed.
        paths: Vec<PathBuf>,
        /// Re-embed even when cached vectors exist.
        #[arg(long)]
        force: bool,
    },
    /// Query workspace collections.
    Search {
        /// Workspace namespaces to search.
        #[arg(long, required = true)]
        namespace: Vec<String>,
        /// Distance metric: cosine, l2, or dot.
        #[arg(long, default_value = "cosine")]
        metric: String,
        /// Maximum results.
        #[arg(long, default_value_t = 4)]
        limit: usize,
        /// Metric threshold.
        #[arg(long, default_value_t = 0.25)]
        threshold: f32,
        /// The query text.
        query: String,
    },
    /// Show storage and collection status.
    Status,
    /// Purge vector-cache entries.
    PurgeCache {
        /// Purge a single source path instead of everything.
        path: Option<String>,
    },
    /// Watch the documents tree and keep folder caches coherent.
    Watch,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = mmdex::logging::init(cli.verbose) {
        eprintln!("{}: {e}", "warning".yellow());
    }

    if let Err(e) = run(cli).await {
        eprintln!("{} {e}", "error:".red().bold());
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let app = Mmdex::open().await?;

    match cli.command {
        Command::Ingest { file, folder } => {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_string();
            let written = app.ingest_file(&file, &name, &folder).await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "written": written.display().to_string() })
                );
            } else {
                println!("{} {}", "ingested".green(), written.display());
            }
        }

        Command::Resync {
            force,
            folder,
            batch_size,
        } => {
            let mut events = app.resync().subscribe();
            let session_id = app.resync().start(ResyncOptions {
                batch_size,
                force_refresh: force,
                folder_filter: folder,
            })?;

            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
                )?
                .progress_chars("=> "),
            );
            let bar_task = tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        ProgressEvent::Progress {
                            files_processed,
                            total_files,
                            ..
                        } => {
                            bar.set_length(total_files);
                            bar.set_position(files_processed);
                        }
                        ProgressEvent::BatchComplete { folder, .. } => {
                            bar.set_message(folder);
                        }
                        ProgressEvent::Complete { .. }
                        | ProgressEvent::Failed { .. }
                        | ProgressEvent::Cancelled { .. } => {
                            bar.finish_and_clear();
                            break;
                        }
                        _ => {}
                    }
                }
            });

            let tree = app.resync().wait(&session_id).await?;
            let _ = bar_task.await;
            let progress = app.resync().status(&session_id)?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&progress)?);
            } else {
                let files: usize = tree.iter().map(|f| f.items.len()).sum();
                println!(
                    "{} {} folders, {} files, {} errors ({:?})",
                    "resync".green(),
                    tree.len(),
                    files,
                    progress.errors.len(),
                    progress.status,
                );
                for error in progress.errors.iter().take(10) {
                    println!("  {} {} [{}]: {}", "!".red(), error.file, error.phase, error.message);
                }
            }
        }

        Command::Embed {
            workspace,
            paths,
            force,
        } => {
            let session_id = app.embed_sessions().start(
                &workspace,
                &workspace,
                paths,
                EmbedOptions {
                    force_re_embed: force,
                    prefix: None,
                },
            )?;
            let progress = app.embed_sessions().wait(&session_id).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&progress)?);
            } else {
                println!(
                    "{} embedded {}, failed {} ({:?})",
                    "embed".green(),
                    progress.embedded.len(),
                    progress.failed.len(),
                    progress.status,
                );
                for error in &progress.errors {
                    println!("  {} {}: {}", "!".red(), error.file, error.message);
                }
            }
        }

        Command::Search {
            namespace,
            metric,
            limit,
            threshold,
            query,
        } => {
            let metric: DistanceMetric = metric.parse()?;
            let options = SearchOptions {
                top_n: limit,
                threshold,
                ..Default::default()
            };
            let results = app.search_many(&namespace, &query, metric, &options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.sources.is_empty() {
                println!("{}", "no results".yellow());
            } else {
                for (i, source) in results.sources.iter().enumerate() {
                    let title = source
                        .metadata
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or("<untitled>");
                    println!(
                        "{} {} {}",
                        format!("{}.", i + 1).bold(),
                        title.cyan(),
                        format!("(score {:.3})", source.score).dimmed(),
                    );
                    let preview: String = source.text.chars().take(160).collect();
                    println!("   {preview}");
                }
            }
        }

        Command::Status => {
            let localfiles = app.localfiles_json().await?;
            let namespaces = app.vector_index().list_namespaces()?;
            if cli.json {
                let statuses: Vec<_> = namespaces
                    .iter()
                    .filter_map(|ns| app.vector_index().status(ns).ok().flatten())
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "localFiles": localfiles["localFiles"],
                        "collections": statuses,
                    }))?
                );
            } else {
                println!("{}", "collections".bold());
                if namespaces.is_empty() {
                    println!("  (none)");
                }
                for ns in &namespaces {
                    if let Some(status) = app.vector_index().status(ns)? {
                        println!(
                            "  {} {} vectors, {} documents, dim {}",
                            ns.cyan(),
                            status.vector_count,
                            status.document_count,
                            status.dimensions,
                        );
                    }
                }
                println!(
                    "{} cached vector files: {}",
                    "vector-cache".bold(),
                    app.vector_cache().has_cached_files()
                );
            }
        }

        Command::PurgeCache { path } => {
            let removed = match path {
                Some(path) => usize::from(app.vector_cache().purge(&path)?),
                None => app.vector_cache().purge_all()?,
            };
            println!("{} {} entries removed", "purge".green(), removed);
        }

        Command::Watch => {
            let cancel = CancellationToken::new();
            app.start_change_plumbing(cancel.clone());

            let ctrlc_cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                ctrlc_cancel.cancel();
            });

            println!("{} watching documents, ctrl-c to stop", "watch".green());
            app.watch(cancel).await?;
        }
    }

    Ok(())
}
