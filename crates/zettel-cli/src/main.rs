use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::{Parser, Subcommand, ValueEnum};
use miette::{IntoDiagnostic, Result};
use tracing::{debug, info, warn};
use zettel_common::telemetry::{self, TelemetryConfig};
use zettel_common::transport::{SessionParams, WsConnector};
use zettel_common::{ClientConfig, FileStore};
use zettel_editor_core::render_html;
use zettel_editor_crdt::{
    Comments, DocumentSession, ReplicatedDoc, RichTextBinding, SessionNotice, SnapshotSource,
    random_peer_id,
};

#[derive(Parser)]
#[command(version, about = "Zettel - collaborative note documents from the command line", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the client configuration file (.toml or .json)
    #[arg(long, global = true, env = "ZETTEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a document snapshot
    Export {
        /// Snapshot file written by `watch --save`
        snapshot: PathBuf,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = ExportFormat::Markdown)]
        format: ExportFormat,
    },
    /// List the comment threads stored in a snapshot
    Comments {
        snapshot: PathBuf,

        /// Print the threads as JSON
        #[arg(long)]
        json: bool,
    },
    /// Join a live document session and report its activity
    Watch {
        /// Document id
        document: String,

        /// Credential presented to the relay
        #[arg(long, env = "ZETTEL_TOKEN", hide_env_values = true)]
        token: String,

        /// Hydrate from this snapshot before connecting
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Save a snapshot here when the session ends
        #[arg(long)]
        save: Option<PathBuf>,

        /// Print the document as Markdown after every change
        #[arg(long)]
        print: bool,
    },
    /// Print the effective client configuration
    Config {
        /// Write the default configuration if the file does not exist
        #[arg(long)]
        init: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Markdown,
    Html,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_miette();
    telemetry::init(TelemetryConfig::from_env("zettel"));

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Export {
            snapshot,
            out,
            format,
        } => export(&snapshot, out.as_deref(), format).await?,
        Commands::Comments { snapshot, json } => list_comments(&snapshot, json).await?,
        Commands::Watch {
            document,
            token,
            snapshot,
            save,
            print,
        } => {
            let config = load_config(&config_path).await?;
            let params = SessionParams {
                url: config.server_url.clone(),
                document: document.into(),
                token: token.into(),
                replica: 0,
                display_name: config.display_name.clone(),
                color: config.color.unwrap_or(0),
            };
            watch(&config, params, snapshot, save, print).await?;
        }
        Commands::Config { init } => {
            let store = FileStore::new(&config_path);
            if init && !config_path.exists() {
                ClientConfig::default().save(&store).await?;
                println!("Wrote default configuration to {}", config_path.display());
            }
            let config = load_config(&config_path).await?;
            println!("# {}", config_path.display());
            println!("{}", serde_json::to_string_pretty(&config).into_diagnostic()?);
        }
    }

    Ok(())
}

/// File config when present, defaults otherwise, then `ZETTEL_*` overrides.
async fn load_config(path: &Path) -> Result<ClientConfig> {
    let config = if path.exists() {
        ClientConfig::load(&FileStore::new(path)).await?
    } else {
        debug!(path = %path.display(), "no configuration file, using defaults");
        ClientConfig::default()
    };
    Ok(config.with_env_overrides()?)
}

async fn read_snapshot(path: &Path) -> Result<ReplicatedDoc> {
    let bytes = tokio::fs::read(path).await.into_diagnostic()?;
    Ok(ReplicatedDoc::from_snapshot(&bytes, random_peer_id())?)
}

async fn export(snapshot: &Path, out: Option<&Path>, format: ExportFormat) -> Result<()> {
    let binding = RichTextBinding::new(Rc::new(read_snapshot(snapshot).await?));
    let rendered = match format {
        ExportFormat::Markdown => binding.to_markdown(),
        ExportFormat::Html => render_html(&binding.render()),
    };

    match out {
        Some(path) => {
            tokio::fs::write(path, rendered).await.into_diagnostic()?;
            println!("✓ Exported to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

async fn list_comments(snapshot: &Path, json: bool) -> Result<()> {
    let store = Rc::new(read_snapshot(snapshot).await?);
    let comments = Comments::new(store.clone());
    let threads = comments.threads();

    if json {
        println!("{}", serde_json::to_string_pretty(&threads).into_diagnostic()?);
        return Ok(());
    }

    if threads.is_empty() {
        println!("No comments");
    }
    for thread in &threads {
        let state = if thread.resolved { "resolved" } else { "open" };
        let anchor: Vec<String> = comments
            .anchor_ranges(&thread.id)
            .into_iter()
            .filter_map(|range| store.slice(range))
            .collect();
        println!("[{state}] {}: {}", thread.author, thread.text);
        if !anchor.is_empty() {
            println!("  on \"{}\"", anchor.join("…"));
        }
        for reply in &thread.replies {
            println!("  ↳ {}: {}", reply.author, reply.text);
        }
    }
    Ok(())
}

/// Reads a snapshot file, if one was given.
struct FileSnapshot(Option<PathBuf>);

impl SnapshotSource for FileSnapshot {
    async fn load_snapshot(
        &self,
        _document: &str,
    ) -> Result<Option<Vec<u8>>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        match &self.0 {
            Some(path) => Ok(Some(tokio::fs::read(path).await?)),
            None => Ok(None),
        }
    }
}

async fn watch(
    config: &ClientConfig,
    params: SessionParams,
    snapshot: Option<PathBuf>,
    save: Option<PathBuf>,
    print: bool,
) -> Result<()> {
    println!("Joining {} at {} ...", params.document, params.url);
    let session = DocumentSession::open(
        WsConnector,
        params,
        config.session_config(),
        &FileSnapshot(snapshot),
    )
    .await?;

    let dirty = Rc::new(Cell::new(print));
    let _notices = {
        let dirty = dirty.clone();
        session.subscribe(move |notice| match notice {
            SessionNotice::Status(status) => info!(?status, "connection status"),
            SessionNotice::DocumentChanged { origin } => {
                debug!(?origin, "document changed");
                dirty.set(true);
            }
            SessionNotice::CommentsChanged => info!("comments changed"),
            SessionNotice::LinksChanged { targets } => info!(?targets, "references changed"),
            SessionNotice::PresenceChanged => debug!("presence changed"),
            SessionNotice::AuthRejected { reason } => {
                warn!(%reason, "relay rejected the token");
            }
        })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            more = session.step() => {
                if !more {
                    warn!("session ended");
                    break;
                }
            }
            res = &mut ctrl_c => {
                res.into_diagnostic()?;
                info!("interrupted");
                break;
            }
        }
        if print && dirty.replace(false) {
            println!("{}", session.binding().to_markdown());
        }
    }

    session.close().await;

    if let Some(path) = save {
        let bytes = session.store().snapshot()?;
        tokio::fs::write(&path, bytes).await.into_diagnostic()?;
        println!("✓ Snapshot saved to {}", path.display());
    }
    Ok(())
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("zettel")
        .join("config.toml")
}

fn init_miette() {
    let hook = miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }));
    if hook.is_err() {
        eprintln!("couldn't set the miette hook");
    }
    miette::set_panic_hook();
}
