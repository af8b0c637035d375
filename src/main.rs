use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

use larder::config::Config;
use larder::connectivity::ConnectivityMonitor;
use larder::recipe::RecipeClient;
use larder::storage::{Database, DatabaseError, DatabaseHandle, MembershipStore};
use larder::sync::{EventBus, Favourites, SyncCoordinator, SyncEvent};
use larder::worker::{Interceptor, WorkerHandle};

/// Get the config directory path (~/.config/larder/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("larder"))
}

#[derive(Parser, Debug)]
#[command(name = "larder", about = "Offline favourites for the recipe library")]
struct Args {
    /// Config file (defaults to ~/.config/larder/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Reset the offline store (delete and recreate)
    #[arg(long)]
    reset_db: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the Recipe Service and show what is available offline
    Status,
    /// Favourite or unfavourite a recipe
    Toggle { id: String },
    /// List recipes available offline
    List,
    /// Print a cached recipe as JSON
    Show { id: String },
    /// Fetch missing favourites and evict stale entries
    Reconcile,
    /// Remove every favourite and everything cached for them
    Clear,
    /// Write a cached recipe image to a file
    Image {
        id: String,
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Keep probing and syncing until Ctrl+C
    Watch,
}

struct Services {
    db: Database,
    config: Config,
    http: reqwest::Client,
    client: RecipeClient,
    favourites: Favourites,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // User-only access: the store holds cached recipes of a signed-in user
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = config
        .database_path
        .clone()
        .unwrap_or_else(|| config_dir.join("larder.db"));
    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete offline store")?;
        println!("Offline store reset.");
    }

    let services = build_services(config, &db_path).await?;

    match args.command {
        Command::Status => status(&services).await,
        Command::Toggle { id } => toggle(&services, &id).await,
        Command::List => list(&services).await,
        Command::Show { id } => show(&services, &id).await,
        Command::Reconcile => reconcile(&services).await,
        Command::Clear => {
            let evicted = services.favourites.clear_all().await?;
            println!("Cleared all favourites ({evicted} cached recipes evicted).");
            Ok(())
        }
        Command::Image { id, output } => image(&services, &id, &output).await,
        Command::Watch => watch(services).await,
    }
}

async fn build_services(config: Config, db_path: &std::path::Path) -> Result<Services> {
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    let handle = DatabaseHandle::new(db_path_str);
    let db = match handle.get().await {
        Ok(db) => db,
        Err(e) if matches!(*e.0, DatabaseError::Locked) => {
            eprintln!(
                "Error: The offline store is in use by another process. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open offline store: {}", e)),
    };

    let endpoints = config.endpoints()?;
    let http = reqwest::Client::builder()
        .timeout(config.network_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    let client = RecipeClient::new(http.clone(), endpoints)
        .with_retries(config.fetch_retries)
        .with_timeout(config.network_timeout());

    let membership = MembershipStore::new(db.clone());
    let coordinator = SyncCoordinator::new(
        db.clone(),
        client.clone(),
        membership.clone(),
        EventBus::default(),
    )
    .with_concurrency(config.sync_concurrency);
    coordinator.set_credential(config.credential());
    let favourites = Favourites::new(membership, coordinator);

    Ok(Services {
        db,
        config,
        http,
        client,
        favourites,
    })
}

fn new_monitor(services: &Services) -> ConnectivityMonitor {
    ConnectivityMonitor::new(
        services.http.clone(),
        services.client.endpoints().clone(),
        services.config.probe_settings(),
    )
}

async fn status(services: &Services) -> Result<()> {
    let monitor = new_monitor(services);
    let online = monitor.check_now().await;
    let favourites = services.favourites.membership().load().await?;
    let stats = services.db.storage_stats().await?;

    println!("Recipe Service: {}", services.client.endpoints().origin());
    println!("Connectivity:   {}", if online { "online" } else { "offline" });
    println!("Favourites:     {}", favourites.len());
    println!("Cached recipes: {}", stats.cached_recipes);
    println!(
        "Cached images:  {} ({} bytes)",
        stats.cached_binaries, stats.binary_bytes
    );
    println!(
        "Cached pages:   {} ({} bytes)",
        stats.cached_pages, stats.page_bytes
    );
    Ok(())
}

async fn toggle(services: &Services, id: &str) -> Result<()> {
    let outcome = services.favourites.toggle(id, None).await?;
    let is_member = outcome.is_member();
    if is_member {
        println!("Added {id} to favourites.");
    } else {
        println!("Removed {id} from favourites.");
    }

    // The sync side effect is detached; a CLI has to wait for it before exiting
    outcome.task.await.context("Sync task failed")?;

    let cached = services.db.has_recipe(id).await?;
    match (is_member, cached) {
        (true, true) => println!("Available offline."),
        (true, false) => println!("Not cached yet; run `larder reconcile` when online."),
        (false, _) => {}
    }
    Ok(())
}

async fn list(services: &Services) -> Result<()> {
    let items = services.db.cached_recipe_list().await?;
    if items.is_empty() {
        println!("No recipes available offline.");
    }
    for item in &items {
        let image = if item.has_image { " [image]" } else { "" };
        println!("{}  {}{}", item.id, item.name, image);
    }

    let members = services.favourites.membership().load().await?;
    let pending = members
        .iter()
        .filter(|id| !items.iter().any(|item| &item.id == *id))
        .count();
    if pending > 0 {
        println!("{pending} favourite(s) not cached yet.");
    }
    Ok(())
}

async fn show(services: &Services, id: &str) -> Result<()> {
    match services.db.get_recipe(id).await? {
        Some(recipe) => {
            println!("{}", serde_json::to_string_pretty(&recipe)?);
            Ok(())
        }
        None => anyhow::bail!("Recipe {id} is not available offline"),
    }
}

async fn reconcile(services: &Services) -> Result<()> {
    let report = services.favourites.coordinator().reconcile().await?;
    println!(
        "Reconciled: {} missing, {} cached, {} failed, {} evicted.",
        report.missing, report.succeeded, report.failed, report.orphans_removed
    );
    Ok(())
}

async fn image(services: &Services, id: &str, output: &std::path::Path) -> Result<()> {
    let url = services.client.endpoints().image_url(id);
    let Some(binary) = services.db.get_binary(url.as_str()).await? else {
        anyhow::bail!("No cached image for recipe {id}");
    };
    std::fs::write(output, &binary.bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {} bytes ({}) to {}",
        binary.bytes.len(),
        binary.content_type.as_deref().unwrap_or("unknown type"),
        output.display()
    );
    Ok(())
}

async fn watch(services: Services) -> Result<()> {
    let monitor = new_monitor(&services);
    let probe_task = monitor.start();
    let mut connectivity = monitor.subscribe();

    let interceptor = Interceptor::new(
        services.http.clone(),
        services.client.endpoints().clone(),
        services.db.clone(),
        &services.config.cache_version,
    )
    .with_timeout(services.config.network_timeout());
    let (worker, worker_task) = WorkerHandle::spawn(interceptor);

    let coordinator = services.favourites.coordinator().clone();
    let mut events = coordinator.events().subscribe();

    match coordinator.reconcile().await {
        Ok(report) => println!(
            "Startup reconcile: {} cached, {} failed, {} evicted.",
            report.succeeded, report.failed, report.orphans_removed
        ),
        Err(e) => eprintln!("Startup reconcile failed: {e}"),
    }

    if worker.wait_until_running().await.is_ok() {
        println!("Request Interceptor running.");
    }
    println!("Watching connectivity. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = connectivity.borrow_and_update().is_online;
                println!("{}", if online { "Online" } else { "Offline" });
                if online {
                    // Catch up on anything that failed while offline
                    if let Err(e) = coordinator.reconcile().await {
                        tracing::warn!(error = %e, "Reconcile after reconnect failed");
                    }
                }
            }
            event = events.recv() => match event {
                Ok(SyncEvent::EntityCached { id }) => println!("Cached {id}"),
                Ok(SyncEvent::EntityUncached { id }) => println!("Evicted {id}"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    probe_task.abort();
    worker_task.abort();
    println!("Goodbye!");
    Ok(())
}
