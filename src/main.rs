//! Menu Sync CLI - follows realtime order and menu updates from a terminal.
//!
//! This is the main binary entry point. See the `menu_sync` library for the
//! core functionality.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use menu_sync::broadcast::BroadcastCallback;
use menu_sync::notifications::{HttpNotifier, LogNotifier, Notifier};
use menu_sync::polling::DataChangeCallback;
use menu_sync::ws::TungsteniteConnector;
use menu_sync::{
    ApiClient, BroadcastHub, Config, CredentialStore, FileStore, KeyValueStore, MemoryStore,
    PollOptions, PollingSyncChannel, RealtimeCoordinator,
};
use mimalloc::MiMalloc;
use serde_json::Value;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "menu-sync")]
#[command(version)]
#[command(about = "Real-time order and menu sync client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save the API bearer token
    Login {
        /// Bearer token issued by the menu API
        #[arg(long)]
        token: String,
    },
    /// Forget the saved token
    Logout,
    /// Stream realtime updates for restaurants, orders and menu items
    Watch {
        /// Subscribe to pushes for this restaurant
        #[arg(long)]
        restaurant: Option<i64>,
        /// Endpoint to seed the restaurant list from before connecting
        #[arg(long)]
        restaurants: Option<String>,
        /// Endpoint to seed the order list from before connecting
        #[arg(long)]
        orders: Option<String>,
    },
    /// Poll an endpoint and print changes
    Poll {
        /// Endpoint path relative to the server URL
        endpoint: String,
        /// Poll interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Print a shared value
    Get {
        /// Storage key
        key: String,
    },
    /// Set a shared value (parsed as JSON)
    Set {
        /// Storage key
        key: String,
        /// JSON value
        value: String,
    },
    /// Print changes to a shared value made by other processes
    Follow {
        /// Storage key
        key: String,
    },
}

/// Credentials for API calls. A token from the environment is used as-is
/// and never persisted.
fn credentials(config: &Config, store: Arc<dyn KeyValueStore>) -> Result<CredentialStore> {
    match &config.token {
        Some(token) => {
            let overlay = CredentialStore::new(Arc::new(MemoryStore::new()));
            overlay.set_token(token)?;
            Ok(overlay)
        }
        None => Ok(CredentialStore::new(store)),
    }
}

fn notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    match &config.notify_url {
        Some(url) => {
            let client = reqwest::Client::builder()
                .timeout(menu_sync::constants::HTTP_REQUEST_TIMEOUT)
                .build()?;
            Ok(Arc::new(HttpNotifier::new(client, url.clone())))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

async fn watch(
    config: &Config,
    credentials: CredentialStore,
    restaurant: Option<i64>,
    restaurants: Option<String>,
    orders: Option<String>,
) -> Result<()> {
    let coordinator = Arc::new(RealtimeCoordinator::new(
        Arc::new(TungsteniteConnector::new()),
        config.connection_options(),
        notifier(config)?,
    ));

    if restaurants.is_some() || orders.is_some() {
        let api = ApiClient::new(config.server_url.clone(), credentials.clone())?;
        if let Some(endpoint) = restaurants {
            coordinator.set_restaurants(api.fetch_collection(&endpoint).await?);
        }
        if let Some(endpoint) = orders {
            coordinator.set_orders(api.fetch_collection(&endpoint).await?);
        }
    }

    let token = credentials.token()?;
    if token.is_none() {
        log::warn!("No token saved; connecting unauthenticated. Run `menu-sync login` first.");
    }
    if let Some(id) = restaurant {
        coordinator.subscribe_to_restaurant(id);
    }

    let runner = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run().await })
    };
    coordinator.connect(&config.ws_url(), token.as_deref());

    let mut changes = coordinator.subscribe();
    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = changes.borrow_and_update().clone();
                println!("{}", serde_json::to_string(&snapshot)?);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    coordinator.disconnect().await;
    runner.abort();
    Ok(())
}

async fn poll(
    config: &Config,
    credentials: CredentialStore,
    endpoint: String,
    interval_ms: Option<u64>,
) -> Result<()> {
    let api = ApiClient::new(config.server_url.clone(), credentials)?;
    let interval = interval_ms.map_or_else(|| config.poll_interval(), Duration::from_millis);
    let on_change: DataChangeCallback = Box::new(|new: &Value, _old: &Value| {
        println!("{new}");
    });

    let channel = PollingSyncChannel::start(
        api,
        PollOptions::new(endpoint).with_interval(interval),
        Some(on_change),
    );

    // The callback reports changes; the baseline is printed from the snapshot.
    let mut snapshots = channel.subscribe();
    let mut baseline_printed = false;
    let mut reported = 0;
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if !baseline_printed {
                    if let Some(data) = &snapshot.data {
                        println!("{data}");
                        baseline_printed = true;
                    }
                }
                if snapshot.fetches > reported {
                    reported = snapshot.fetches;
                    if let Some(error) = snapshot.error {
                        eprintln!("Poll failed: {error}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    channel.stop();
    Ok(())
}

async fn follow(hub: &BroadcastHub, key: String) -> Result<()> {
    let listener = hub.spawn_storage_listener()?;
    let on_change: BroadcastCallback = Arc::new(|new: &Value, _old: Option<&Value>| {
        println!("{new}");
    });
    let channel = hub.channel(key, Some(on_change));
    if let Some(current) = channel.data() {
        println!("{current}");
    }

    tokio::signal::ctrl_c().await?;
    listener.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let config_dir = Config::config_dir()?;
    let config = Config::load_from(&config_dir)?;
    let store: Arc<dyn KeyValueStore> =
        Arc::new(FileStore::open(Config::storage_path(&config_dir))?);
    let hub = BroadcastHub::new(Arc::clone(&store));

    match cli.command {
        Commands::Login { token } => {
            CredentialStore::new(store).set_token(&token)?;
            println!("Token saved successfully.");
        }
        Commands::Logout => {
            CredentialStore::new(store).clear_token()?;
            println!("Token removed.");
        }
        Commands::Watch {
            restaurant,
            restaurants,
            orders,
        } => {
            let credentials = credentials(&config, store)?;
            watch(&config, credentials, restaurant, restaurants, orders).await?;
        }
        Commands::Poll {
            endpoint,
            interval_ms,
        } => {
            let credentials = credentials(&config, store)?;
            poll(&config, credentials, endpoint, interval_ms).await?;
        }
        Commands::Get { key } => match hub.channel(key, None).data() {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => println!("(unset)"),
        },
        Commands::Set { key, value } => {
            let value: Value = serde_json::from_str(&value)
                .with_context(|| format!("Value is not valid JSON: {value}"))?;
            let changed = hub.channel(key, None).update_data(value)?;
            if !changed {
                println!("Unchanged.");
            }
        }
        Commands::Follow { key } => follow(&hub, key).await?,
    }

    Ok(())
}
