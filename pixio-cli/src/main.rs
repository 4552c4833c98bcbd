use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use pixio_core::{
    BatchUploadOperation, BatchUploadOutcome, BatchUploadRequest, HttpRemote, RepoConfig, TagStore,
    UploadEvent, UploadItem,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "pixio")]
#[command(about = "Image hosting on a git-backed remote repository")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pixio.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more images
    Upload {
        /// Image files to upload
        files: Vec<PathBuf>,

        /// Destination directory in the repository
        #[arg(short, long)]
        dir: Option<String>,

        /// Tags to attach to every uploaded image
        #[arg(short, long)]
        tag: Vec<String>,
    },
    /// Replace the tags of an image
    Tag {
        /// Repository-relative image path
        path: String,
        /// New tag list
        tags: Vec<String>,
    },
    /// Remove an image from the tag document
    Untag { path: String },
    /// Show tags for one image, or the whole tag document
    Show {
        /// Repository-relative image path
        path: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match RepoConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!("Failed to load config: {}", error);
            std::process::exit(1);
        }
    };

    if let Err(error) = run(config, cli.command).await {
        tracing::error!("{:#}", error);
        std::process::exit(1);
    }
}

async fn run(config: RepoConfig, command: Commands) -> anyhow::Result<()> {
    let remote: Arc<HttpRemote> = Arc::new(HttpRemote::new(&config)?);
    let store = TagStore::new(remote.clone(), config.clone());
    store.initialize().await?;

    match command {
        Commands::Upload { files, dir, tag } => {
            let dir = dir.unwrap_or_else(|| config.upload_dir.clone());
            upload(&config, remote, store, files, dir, tag).await
        }
        Commands::Tag { path, tags } => {
            let outcome = store.set_tags(&path, tags).await?;
            anyhow::ensure!(outcome.is_success(), "tag write was not persisted");
            println!("tagged {}", path);
            Ok(())
        }
        Commands::Untag { path } => {
            let outcome = store.remove_path(&path).await?;
            anyhow::ensure!(outcome.is_success(), "tag removal was not persisted");
            println!("untagged {}", path);
            Ok(())
        }
        Commands::Show { path } => {
            match path {
                Some(path) => {
                    for tag in store.tags_for(&path) {
                        println!("{}", tag);
                    }
                }
                None => {
                    let doc = store.document().context("tag store not initialized")?;
                    for (path, tags) in &doc.images {
                        println!("{}: {}", path, tags.join(", "));
                    }
                }
            }
            Ok(())
        }
    }
}

async fn upload(
    config: &RepoConfig,
    remote: Arc<HttpRemote>,
    store: TagStore,
    files: Vec<PathBuf>,
    dir: String,
    tags: Vec<String>,
) -> anyhow::Result<()> {
    anyhow::ensure!(!files.is_empty(), "nothing to upload");

    let mut items = Vec::with_capacity(files.len());
    for file in &files {
        let filename = file
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("bad filename: {}", file.display()))?
            .to_string();
        let content = tokio::fs::read(file)
            .await
            .with_context(|| format!("cannot read {}", file.display()))?;
        items.push(UploadItem {
            filename,
            content: Bytes::from(content),
            tags: tags.clone(),
            prior_sha: None,
        });
    }

    let operation = BatchUploadOperation::new(remote, store, config.branch.clone());
    let mut events = operation.subscribe();

    let outcome = operation
        .run(BatchUploadRequest {
            items,
            destination_dir: dir,
        })
        .await?;

    match &outcome {
        BatchUploadOutcome::Committed {
            commit_sha,
            uploaded,
        } => {
            for path in uploaded {
                println!("uploaded {}", path);
            }
            println!("commit {}", commit_sha);
        }
        BatchUploadOutcome::FellBack { results } => {
            for (path, ok) in results {
                println!("{} {}", if *ok { "uploaded" } else { "FAILED" }, path);
            }
        }
    }

    let any_ok = match &outcome {
        BatchUploadOutcome::Committed { .. } => true,
        BatchUploadOutcome::FellBack { results } => results.iter().any(|(_, ok)| *ok),
    };
    if !any_ok {
        anyhow::bail!("all uploads failed");
    }

    // Let the detached side effects (tag attachment, listing refresh)
    // report before exiting.
    let drain = async {
        while let Ok(event) = events.recv().await {
            match event {
                UploadEvent::TagsAttached { path, ok } => {
                    if !ok {
                        tracing::warn!("tags were not attached for {}", path);
                    }
                }
                UploadEvent::ListingRefreshed { dir, images, ok } => {
                    if ok {
                        tracing::info!("{} now holds {} images", dir, images);
                    }
                    break;
                }
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(10), drain).await;

    anyhow::ensure!(outcome.is_success(), "some uploads failed");
    Ok(())
}
