#![forbid(unsafe_code)]

use std::{io, time::Duration};

use argh::FromArgs;
use printer::SamplePrinter;
use simple_logger::SimpleLogger;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

mod connect;
mod printer;
mod stream;

#[derive(FromArgs, Debug)]
#[argh(description = "Watch the live sample stream of a metricast server.")]
struct ViewerConfig {
    #[argh(
        option,
        short = 'a',
        default = "\"127.0.0.1:8080\".to_string()",
        description = "server address to connect to"
    )]
    pub server_addr: String,
    #[argh(
        switch,
        short = 't',
        description = "use TLS to connect to server (wss instead of ws)"
    )]
    pub tls: bool,
    #[argh(
        switch,
        short = '6',
        description = "prefer IPv6 when resolving server address"
    )]
    pub prefer_ipv6: bool,
    #[argh(
        option,
        short = 'H',
        description = "only print samples from this host, may be repeated"
    )]
    pub host: Vec<String>,
    #[argh(
        option,
        default = "1",
        description = "minimum interval between two connection retries in seconds"
    )]
    pub retry_minimum_interval: u64, // in seconds
    #[argh(
        option,
        default = "60",
        description = "maximum interval between two connection retries in seconds"
    )]
    pub retry_maximum_interval: u64, // in seconds
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new().env().init()?;

    let cfg: ViewerConfig = argh::from_env();
    log::debug!("Viewer config: {cfg:#?}");

    if cfg.retry_minimum_interval > cfg.retry_maximum_interval {
        anyhow::bail!("retry minimum interval must not exceed the maximum interval");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for ctrl-c: {e}");
                return;
            }
            shutdown.cancel();
        }
    });

    let mut printer = SamplePrinter::new(io::stdout(), cfg.host.clone());
    let mut reconnect_timer = ReconnectTimer::new(
        Duration::from_secs(cfg.retry_minimum_interval),
        Duration::from_secs(cfg.retry_maximum_interval),
    );

    loop {
        let res: anyhow::Result<()> = async {
            let socket = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                socket = connect::connect(&cfg.server_addr, cfg.tls, cfg.prefer_ipv6) => socket?,
            };
            log::info!("connected to {}", connect::metrics_url(&cfg.server_addr, cfg.tls));
            reconnect_timer.reset();

            // watch owns shutdown from here on, so the server gets a close frame
            stream::watch(socket, &mut printer, &shutdown).await
        }
        .await;

        if let Err(e) = res {
            log::warn!("Error occurred: {e}");
            log::info!(
                "Reconnecting in {} seconds...",
                reconnect_timer.interval().as_secs()
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = reconnect_timer.wait() => {}
            }
        } else {
            return Ok(()); // means graceful shutdown
        }
    }
}

struct ReconnectTimer {
    minimal_interval: Duration,
    maximal_interval: Duration,
    curr_interval: Duration,
}

impl ReconnectTimer {
    fn new(minimal_interval: Duration, maximal_interval: Duration) -> Self {
        debug_assert!(minimal_interval <= maximal_interval);

        Self {
            minimal_interval,
            maximal_interval,
            curr_interval: minimal_interval,
        }
    }

    async fn wait(&mut self) {
        sleep(self.curr_interval).await;
        self.curr_interval = (self.curr_interval * 2).min(self.maximal_interval);
    }

    fn reset(&mut self) {
        self.curr_interval = self.minimal_interval;
    }

    fn interval(&self) -> Duration {
        self.curr_interval
    }
}
