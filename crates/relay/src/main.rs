#![allow(clippy::print_stdout)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use nostr::RelayDescriptor;
use nostr::nip11::verify_descriptor;
use openagents_dht::{Bep44Transport, DhtClient, MainlineDht};
use openagents_relay::config::parse_key_hex;
use openagents_relay::store::{self, EventStore, RelayStore, SqliteStore, StoreError};
use openagents_relay::{
    Config, DagDispatcher, Discovery, Dispatcher, NoteRetriever, RelayIdentity, Scheduler,
    SyncContext, SyncRelay, UnconfiguredDagDownloader, WebSocketQuery, dial, publish_relay_list,
    run_initiator,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "openagents-relay")]
#[command(about = "Relay peer discovery over the Mainline DHT and negentropy event sync")]
struct Cli {
    /// Load environment variables from this file instead of `./.env`.
    #[arg(long, global = true)]
    env: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish this relay, accept sync streams and run the periodic loops.
    Serve,
    /// Print this relay's keys.
    Identity,
    /// Generate a fresh secret key for `RELAY_SECRET_KEY`.
    Keygen,
    AddAuthor {
        pubkey: String,
    },
    /// Store a signed descriptor read from a JSON file.
    AddRelay {
        descriptor: PathBuf,
    },
    /// Look up a descriptor in the DHT by its publication key.
    Discover {
        dht_key: String,
    },
    /// Fetch a descriptor from a relay's NIP-11 endpoint.
    DiscoverHttp {
        url: String,
    },
    /// Reconcile once with a relay, by DHT publication key or `host:port`.
    Sync {
        target: String,
    },
    FetchNote {
        event_id: String,
        author: String,
    },
    /// Publish this relay's nostr key relay list to the DHT.
    PublishRelayList {
        #[arg(required = true)]
        urls: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match &cli.env {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| format!("load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    let config = Config::from_env().context("load relay config")?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Identity => identity(&config),
        Commands::Keygen => keygen(),
        Commands::AddAuthor { pubkey } => add_author(&config, &pubkey).await,
        Commands::AddRelay { descriptor } => add_relay(&config, &descriptor).await,
        Commands::Discover { dht_key } => discover(&config, &dht_key).await,
        Commands::DiscoverHttp { url } => discover_http(&config, &url).await,
        Commands::Sync { target } => sync(&config, &target).await,
        Commands::FetchNote { event_id, author } => fetch_note(&config, &event_id, &author).await,
        Commands::PublishRelayList { urls } => publish_list(&config, &urls).await,
    }
}

fn now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    store::sqlite(&config.db_path)
        .with_context(|| format!("open store {}", config.db_path.display()))
}

fn transport(config: &Config) -> Result<Bep44Transport> {
    let client: Arc<dyn DhtClient> = Arc::new(MainlineDht::client().context("join mainline DHT")?);
    Ok(Bep44Transport::new(client, config.dht_timeout))
}

fn sync_context(config: &Config, events: Arc<dyn EventStore>) -> Arc<SyncContext> {
    Arc::new(SyncContext {
        events,
        dag: DagDispatcher::new(Arc::new(UnconfiguredDagDownloader), config.dag_kinds.clone()),
        frame_size_limit: config.frame_size_limit,
        idle_timeout: config.session_idle_timeout,
    })
}

fn scheduler(config: &Config, store: &Arc<SqliteStore>, transport: Bep44Transport) -> Scheduler {
    let discovery = Arc::new(Discovery::new(
        transport.clone(),
        store.clone(),
        config.http_timeout,
    ));
    Scheduler::new(store.clone(), transport, discovery, sync_context(config, store.clone()))
        .with_bootstrap_keys(config.bootstrap_keys.clone())
        .with_connect_timeout(config.http_timeout)
}

async fn serve(config: Config) -> Result<()> {
    let identity = RelayIdentity::from_secret(config.require_secret_key()?)?;
    let store = open_store(&config)?;

    let descriptor = identity.descriptor(&config, now())?;
    match store.add_uploadable(identity.uploadable(&descriptor)?).await {
        Ok(()) => {}
        Err(StoreError::StaleSequence { current, attempted, .. }) => {
            warn!(current, attempted, "clock is behind the stored descriptor; keeping the stored one");
        }
        Err(error) => return Err(error).context("store own descriptor"),
    }

    let transport = transport(&config)?;
    let scheduler = Arc::new(
        scheduler(&config, &store, transport).with_own_pubkey(identity.pubkey()),
    );
    let dispatcher = Dispatcher::bind(config.sync_bind, sync_context(&config, store.clone()))
        .await
        .with_context(|| format!("bind {}", config.sync_bind))?;

    info!(
        pubkey = %identity.pubkey(),
        dht_key = %hex::encode(identity.dht_public_key()),
        bind = %config.sync_bind,
        "relay started"
    );
    let (upload, sync) = scheduler.spawn(config.upload_interval, config.sync_interval);

    let outcome = tokio::select! {
        result = dispatcher.run() => result.context("sync dispatcher stopped"),
        result = tokio::signal::ctrl_c() => {
            info!("shutting down");
            result.context("wait for ctrl-c")
        }
    };
    upload.abort();
    sync.abort();
    outcome
}

fn identity(config: &Config) -> Result<()> {
    let identity = RelayIdentity::from_secret(config.require_secret_key()?)?;
    println!("pubkey:         {}", identity.pubkey());
    println!("dht public key: {}", hex::encode(identity.dht_public_key()));
    println!("dht key:        {}", identity.dht_key()?);
    println!("dht key (pub):  {}", identity.dht_key_for_public_key());
    Ok(())
}

fn keygen() -> Result<()> {
    let secret = nostr::generate_secret_key();
    let identity = RelayIdentity::from_secret(secret)?;
    println!("RELAY_SECRET_KEY={}", hex::encode(secret));
    println!("pubkey:         {}", identity.pubkey());
    Ok(())
}

async fn add_author(config: &Config, pubkey: &str) -> Result<()> {
    parse_key_hex(pubkey).map_err(anyhow::Error::msg).context("invalid author pubkey")?;
    open_store(config)?.add_author(pubkey).await?;
    info!(author = %pubkey, "author added");
    Ok(())
}

async fn add_relay(config: &Config, path: &Path) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let descriptor = RelayDescriptor::from_json(&bytes)?;
    verify_descriptor(&descriptor).context("descriptor signature")?;
    let relay = SyncRelay::new(descriptor);
    open_store(config)?.add_relay(relay.clone()).await?;
    info!(relay = %relay.pubkey, "relay added");
    Ok(())
}

async fn discover(config: &Config, dht_key: &str) -> Result<()> {
    let key = parse_key_hex(dht_key).map_err(anyhow::Error::msg)?;
    let store = open_store(config)?;
    let discovery = Discovery::new(transport(config)?, store, config.http_timeout);
    let relay = discovery.discover_from_dht(&key).await?;
    println!("{}", serde_json::to_string_pretty(&relay.descriptor)?);
    Ok(())
}

async fn discover_http(config: &Config, url: &str) -> Result<()> {
    let store = open_store(config)?;
    let discovery = Discovery::new(transport(config)?, store, config.http_timeout);
    let relay = discovery.discover_from_http(url).await?;
    println!("{}", serde_json::to_string_pretty(&relay.descriptor)?);
    Ok(())
}

async fn sync(config: &Config, target: &str) -> Result<()> {
    let store = open_store(config)?;

    let report = if let Ok(key) = parse_key_hex(target) {
        let transport = transport(config)?;
        let scheduler = scheduler(config, &store, transport.clone());
        let Some(filter) = scheduler.author_filter().await? else {
            bail!("no authors configured; add one with add-author");
        };
        let discovery = Discovery::new(transport, store.clone(), config.http_timeout);
        let relay = discovery.discover_from_dht(&key).await?;
        scheduler.sync_relay(&relay, filter).await?
    } else {
        let authors = store.authors().await?;
        if authors.is_empty() {
            bail!("no authors configured; add one with add-author");
        }
        let stream = dial(target, config.http_timeout).await?;
        let filter = nostr::Filter::new().authors(authors);
        run_initiator(stream, sync_context(config, store.clone()), filter).await?
    };

    println!(
        "rounds={} received={} sent={} rejected={}",
        report.rounds, report.events_received, report.events_sent, report.events_rejected
    );
    Ok(())
}

async fn fetch_note(config: &Config, event_id: &str, author: &str) -> Result<()> {
    let store = open_store(config)?;
    let retriever = NoteRetriever::new(
        store,
        transport(config)?,
        Arc::new(WebSocketQuery {
            wait: config.http_timeout,
        }),
    );
    match retriever.retrieve_missing_note(event_id, author).await {
        Some(event) => println!("{}", serde_json::to_string_pretty(&event)?),
        None => bail!("note {event_id} not found"),
    }
    Ok(())
}

async fn publish_list(config: &Config, urls: &[String]) -> Result<()> {
    let secret = config.require_secret_key()?;
    let target = publish_relay_list(&transport(config)?, &secret, urls, now()).await?;
    info!(dht_target = %target, relays = urls.len(), "relay list published");
    Ok(())
}
