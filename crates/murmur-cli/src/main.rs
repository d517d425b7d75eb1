mod config;
mod console;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use murmur_engine::{
    LoadOlderOutcome, PresenceAggregator, PresenceConfig, SkipReason, Timeline, TimelineConfig,
    TimelineEngine, TimelineView, run_presence, run_timeline,
};
use murmur_hub::LocalHub;
use murmur_store::{Database, SqliteStore};
use murmur_types::Channel;

use crate::config::Config;
use crate::console::{ConsoleView, PresenceLine, format_presence};

const HELP: &str = "commands: /older  /channels  /join <channel>  /create <name>  /who  /quit";

/// The channel currently on screen and the task draining its events.
struct Open {
    channel: Channel,
    timeline: Arc<Timeline>,
    events: JoinHandle<()>,
}

impl Open {
    async fn close(self) {
        self.timeline.close();
        let _ = self.events.await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout is the chat.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    let db = Arc::new(Database::open(&PathBuf::from(&config.db_path))?);
    let hub = LocalHub::new();
    let store = SqliteStore::new(db).with_hub(hub.clone());
    let me = store.ensure_user(&config.username).await?;
    let store = Arc::new(store.signed_in_as(me.id));
    info!("Signed in as {} ({})", config.username, me.id);

    let engine = TimelineEngine::new(
        store.clone(),
        store.clone(),
        Arc::new(hub.clone()),
        TimelineConfig::default().with_page_size(config.page_size),
    );
    let presence = PresenceAggregator::new(
        Arc::new(hub.clone()),
        store.clone(),
        PresenceConfig::default(),
    );

    let room = Arc::new(presence.subscribe(&config.presence_room).await?);
    let presence_task = {
        let room = room.clone();
        tokio::spawn(async move {
            run_presence(&room, &PresenceLine).await;
        })
    };

    let view = Arc::new(ConsoleView::new());
    let channel = find_or_create(&store, &config.channel).await?;
    let mut current = Some(open_channel(&engine, &view, channel).await?);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, arg) = match line.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" => break,
            "/help" => println!("{}", HELP),
            "/who" => println!("{}", format_presence(&room.snapshot())),
            "/channels" => {
                let active = current.as_ref().map(|c| c.channel.id);
                for channel in store.channels().await? {
                    let marker = if Some(channel.id) == active { "*" } else { " " };
                    println!("{} #{}", marker, channel.slug);
                }
            }
            "/older" => {
                let Some(open) = &current else { continue };
                match open.timeline.load_older().await {
                    Ok(LoadOlderOutcome::Loaded { added, .. }) => {
                        view.on_timeline_changed(&open.timeline.snapshot(), false);
                        info!("Loaded {} older messages", added);
                    }
                    Ok(LoadOlderOutcome::Skipped(SkipReason::Exhausted)) => {
                        println!("-- start of #{} --", open.channel.slug)
                    }
                    Ok(other) => info!("Nothing loaded: {:?}", other),
                    Err(e) => warn!("{}", e),
                }
            }
            "/join" | "/create" => {
                let channel = if command == "/create" {
                    match store.create_channel(arg).await {
                        Ok(channel) => channel,
                        Err(e) => {
                            warn!("{}", e);
                            continue;
                        }
                    }
                } else {
                    match store.channel_by_slug(arg.trim_start_matches('#')).await? {
                        Some(channel) => channel,
                        None => {
                            println!("No channel #{}", arg);
                            continue;
                        }
                    }
                };
                if let Some(open) = current.take() {
                    open.close().await;
                }
                view.reset();
                current = Some(open_channel(&engine, &view, channel).await?);
            }
            _ if command.starts_with('/') => println!("{}", HELP),
            _ => {
                let Some(open) = &current else { continue };
                if let Err(e) = open.timeline.send_as_me(line).await {
                    warn!("{}", e);
                    if let Some(draft) = e.into_draft() {
                        println!("(not sent: {})", draft);
                    }
                }
            }
        }
    }

    if let Some(open) = current.take() {
        open.close().await;
    }
    room.unsubscribe();
    let _ = presence_task.await;
    info!("Bye");
    Ok(())
}

async fn find_or_create(store: &SqliteStore, slug: &str) -> anyhow::Result<Channel> {
    if let Some(channel) = store.channel_by_slug(slug).await? {
        return Ok(channel);
    }
    Ok(store.create_channel(slug).await?)
}

async fn open_channel(
    engine: &TimelineEngine,
    view: &Arc<ConsoleView>,
    channel: Channel,
) -> anyhow::Result<Open> {
    let opened = engine.open(channel.id).await?;
    if let Some(e) = &opened.history_error {
        warn!("{}", e);
    }
    println!("== #{} ==", channel.slug);

    let timeline = Arc::new(opened.timeline);
    let events = {
        let timeline = timeline.clone();
        let view = view.clone();
        tokio::spawn(async move {
            run_timeline(&timeline, view.as_ref()).await;
        })
    };

    Ok(Open {
        channel,
        timeline,
        events,
    })
}
