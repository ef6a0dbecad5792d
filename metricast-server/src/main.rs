use std::{net::SocketAddr, path::Path, time::Duration};

use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use tokio::{net::TcpListener, signal};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{services::ServeDir, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{Instrument, debug, debug_span, info, trace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    broadcast::{Broadcaster, SubscriberRegistry},
    config::Conf,
};

mod broadcast;
mod config;
mod route;
mod simulator;

#[derive(Debug, Parser)]
#[command(name = "metricast-server")]
struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Path to config file")]
    config_path: Option<String>,
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the simulation and stream samples to viewers
    Serve,

    /// Validate the configuration and print the simulated fleet
    CheckConfig,
}

#[derive(Clone, Debug)]
pub(crate) struct AppState {
    pub registry: SubscriberRegistry,
    pub subscriber_buffer: usize,
    pub ws_graceful_shutdown: WebsocketGraceful,
}

#[derive(Clone, Debug)]
pub(crate) struct WebsocketGraceful {
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

fn app(state: AppState, static_dir: Option<&Path>) -> Router {
    let router = Router::new()
        .route("/health", get(route::health))
        .nest(
            "/ws/v1",
            Router::new().route("/metrics", get(route::metrics_ws)),
        );

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };

    router
        .layer((
            TraceLayer::new_for_http(),
            // Prevent requests to hang forever
            TimeoutLayer::new(Duration::from_secs(60)),
        ))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    trace!("using command line arguments {:?}", cli);

    let config = config::load(&cli.config_path.unwrap_or("config.toml".to_owned()))?;
    trace!("using config {:?}", config);

    match cli.commands {
        Commands::Serve => serve(config).await?,
        Commands::CheckConfig => check_config(&config)?,
    }

    Ok(())
}

async fn serve(config: Conf) -> anyhow::Result<()> {
    let fleet = config.simulation.fleet()?;

    let addr = SocketAddr::from((config.address, config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    let shutdown = CancellationToken::new();
    let registry = SubscriberRegistry::new();
    let (samples_tx, samples_rx) = broadcast::sample_channel(config.simulation.channel_capacity);

    let simulators = TaskTracker::new();
    simulator::spawn_fleet(
        &fleet,
        config.simulation.tick_interval(),
        samples_tx,
        &shutdown,
        &simulators,
    );
    simulators.close();

    let broadcaster = tokio::spawn(
        Broadcaster::new(registry.clone(), config.simulation.encoding)
            .run(samples_rx, shutdown.child_token())
            .instrument(debug_span!("broadcaster")),
    );

    let state = AppState {
        registry: registry.clone(),
        subscriber_buffer: config.simulation.subscriber_buffer,
        ws_graceful_shutdown: WebsocketGraceful {
            token: shutdown.child_token(),
            tracker: TaskTracker::new(),
        },
    };

    let served = axum::serve(
        listener,
        app(state.clone(), config.static_dir.as_deref())
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await;
    // the server may also have stopped on an I/O error
    shutdown.cancel();

    trace!("waiting {} simulator shutdown", simulators.len());
    simulators.wait().await;
    broadcaster.await?;

    let ws_tracker = state.ws_graceful_shutdown.tracker.clone();
    ws_tracker.close();

    trace!("waiting {} websocket connection shutdown", ws_tracker.len());
    ws_tracker.wait().await;

    let leftover = registry.close_all().await;
    if leftover > 0 {
        debug!(leftover, "closed remaining subscribers");
    }

    served?;
    info!("shutdown complete");
    Ok(())
}

fn check_config(config: &Conf) -> anyhow::Result<()> {
    let fleet = config.simulation.fleet()?;

    println!("listen:            {}:{}", config.address, config.port);
    match &config.static_dir {
        Some(dir) => println!("static dir:        {}", dir.display()),
        None => println!("static dir:        (none)"),
    }
    println!("tick interval:     {:?}", config.simulation.tick_interval());
    println!("channel capacity:  {}", config.simulation.channel_capacity);
    println!("subscriber buffer: {}", config.simulation.subscriber_buffer);
    println!("encoding:          {}", config.simulation.encoding);
    println!();
    for spec in fleet {
        println!(
            "{:<16} {:<17} starts {}",
            spec.hostname,
            spec.class,
            spec.class.initial_status()
        );
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                #[cfg(debug_assertions)]
                let default_log_level = format!(
                    "{}=debug,tower_http=debug,axum=trace",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                #[cfg(not(debug_assertions))]
                let default_log_level = format!(
                    "{}=info,tower_http=info,axum=info",
                    env!("CARGO_CRATE_NAME")
                )
                .into();

                default_log_level
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

async fn shutdown_signal(token: CancellationToken) {
    let _shutdown_guard = token.drop_guard();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
