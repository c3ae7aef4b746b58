//! Store administration for kestrel sessions.
//!
//! - `sessions`: list stored sessions
//! - `show`: meta, history summary and open tool calls of one session
//! - `events`: dump a session's event log as JSON lines
//! - `recover`: replay WAL entries left by an unclean shutdown
//! - `seal`: close every orphaned tool call of a crashed session

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, Level};

use kestrel_core::errors::ProviderError;
use kestrel_core::events::Channel;
use kestrel_core::ids::SessionId;
use kestrel_core::messages::{find_last_sfp, pending_tool_calls, Message};
use kestrel_core::provider::{CompleteOptions, ModelProvider, ModelResponse};
use kestrel_engine::{LocalSandbox, LocalSandboxOptions, ResumeOptions, Session, SessionConfig, SessionDeps};
use kestrel_settings::loader::expand_home;
use kestrel_settings::{load_settings, load_settings_from_path, KestrelSettings};
use kestrel_store::{EventQuery, FileStore, FileStoreOptions, Store};
use kestrel_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Debug, Parser)]
#[command(name = "kestrel", about = "Inspect and repair kestrel session stores")]
struct Args {
    /// Settings file; defaults to `~/.kestrel/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Store root; overrides `store.root` from settings.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List stored sessions.
    Sessions {
        /// Only ids starting with this prefix.
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Show one session.
    Show { session: String },
    /// Print a session's events, one JSON object per line.
    Events {
        session: String,
        #[arg(long, value_enum)]
        channel: Option<ChannelArg>,
        /// Only events with a cursor greater than this.
        #[arg(long)]
        since: Option<u64>,
    },
    /// Replay WAL entries into their targets.
    Recover,
    /// Seal orphaned tool calls of a session left behind by a crash.
    Seal { session: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ChannelArg {
    Progress,
    Control,
    Monitor,
}

impl From<ChannelArg> for Channel {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::Progress => Channel::Progress,
            ChannelArg::Control => Channel::Control,
            ChannelArg::Monitor => Channel::Monitor,
        }
    }
}

/// Stands in for a model when the CLI needs a session but never calls one.
struct OfflineProvider;

#[async_trait]
impl ModelProvider for OfflineProvider {
    fn name(&self) -> &str {
        "offline"
    }

    async fn complete(
        &self,
        _messages: &[Message],
        _options: &CompleteOptions,
    ) -> std::result::Result<ModelResponse, ProviderError> {
        Err(ProviderError::InvalidRequest(
            "no model provider is configured for the CLI".into(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = match &args.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings: {}", path.display()))?,
        None => load_settings().context("failed to load settings")?,
    };

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: settings.logging.level.parse().unwrap_or(Level::INFO),
        module_levels: Vec::new(),
        json: settings.logging.json,
    })?;

    let root = args
        .store
        .clone()
        .unwrap_or_else(|| expand_home(&settings.store.root));
    let store = FileStore::open(&root, store_options(&settings))
        .with_context(|| format!("failed to open store: {}", root.display()))?;
    info!(root = %root.display(), "store opened");

    match args.command {
        Command::Sessions { prefix } => list_sessions(&store, prefix.as_deref()).await?,
        Command::Show { session } => show(&store, &SessionId::from_raw(session)).await?,
        Command::Events {
            session,
            channel,
            since,
        } => {
            let query = EventQuery {
                channel: channel.map(Channel::from),
                since,
                until: None,
            };
            dump_events(&store, &SessionId::from_raw(session), &query).await?;
        }
        Command::Recover => {
            let report = store.recover_all().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Seal { session } => seal(store.clone(), &settings, SessionId::from_raw(session)).await?,
    }

    store.flush_all().await?;
    Ok(())
}

fn store_options(settings: &KestrelSettings) -> FileStoreOptions {
    FileStoreOptions::default()
        .with_flush_interval(std::time::Duration::from_millis(settings.store.flush_interval_ms))
        .with_max_buffered_events(settings.store.max_buffered_events)
        .with_recover_on_open(false)
}

async fn list_sessions(store: &FileStore, prefix: Option<&str>) -> Result<()> {
    for id in store.list(prefix).await? {
        match store.load_meta(&id).await? {
            Some(meta) => println!(
                "{id}\tsteps={}\tupdated={}",
                meta.step_count,
                meta.updated_at.to_rfc3339()
            ),
            None => println!("{id}\t(no meta)"),
        }
    }
    Ok(())
}

async fn show(store: &FileStore, id: &SessionId) -> Result<()> {
    if !store.exists(id).await? {
        anyhow::bail!("session not found: {id}");
    }
    let meta = store.load_meta(id).await?;
    let messages = store.load_messages(id).await?;
    let records = store.load_tool_calls(id).await?;
    let open: Vec<_> = pending_tool_calls(&messages)
        .into_iter()
        .map(|call| json!({"id": call.id, "name": call.name}))
        .collect();
    let calls: Vec<_> = records
        .iter()
        .map(|r| json!({"id": r.id, "name": r.name, "state": r.state, "isError": r.is_error}))
        .collect();
    let summary = json!({
        "sessionId": id,
        "meta": meta,
        "messageCount": messages.len(),
        "lastSfpIndex": find_last_sfp(&messages),
        "openToolCalls": open,
        "toolCalls": calls,
        "cursor": store.last_cursor(id).await?,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn dump_events(store: &FileStore, id: &SessionId, query: &EventQuery) -> Result<()> {
    for envelope in store.read_events(id, query).await? {
        println!("{}", serde_json::to_string(&envelope)?);
    }
    Ok(())
}

async fn seal(store: FileStore, settings: &KestrelSettings, id: SessionId) -> Result<()> {
    let sandbox = LocalSandbox::new(LocalSandboxOptions::from_settings(&settings.sandbox));
    let deps = SessionDeps::new(Arc::new(OfflineProvider), Arc::new(store), Arc::new(sandbox));
    let config = SessionConfig::from_settings(&settings.session);
    let session = Session::resume(id, config, deps, ResumeOptions::crash())
        .await
        .context("failed to resume session")?;
    let sealed: Vec<_> = session
        .history(None, None)
        .into_iter()
        .filter_map(|e| match e.event {
            kestrel_core::events::AgentEvent::Resume { sealed, .. } => Some(sealed),
            _ => None,
        })
        .flatten()
        .map(|call| json!({"id": call.tool_use_id, "name": call.name}))
        .collect();
    session.dispose().await;
    println!("{}", serde_json::to_string_pretty(&json!({"sealed": sealed}))?);
    Ok(())
}
