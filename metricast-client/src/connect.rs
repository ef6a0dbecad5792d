use std::{net::SocketAddr, time::Duration};

use itertools::Itertools;
use log::{debug, trace};
use tokio::{
    net::{TcpStream, lookup_host},
    task::JoinSet,
};
use tokio_native_tls::native_tls::TlsConnector;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config,
    tungstenite::client::IntoClientRequest,
};

const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(150);

pub type MetricsSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn metrics_url(server_addr: &str, tls: bool) -> String {
    format!(
        "{}://{server_addr}/ws/v1/metrics",
        if tls { "wss" } else { "ws" }
    )
}

/// Open the metrics websocket, racing every resolved address.
pub async fn connect(
    server_addr: &str,
    tls: bool,
    prefer_ipv6: bool,
) -> anyhow::Result<MetricsSocket> {
    let req = metrics_url(server_addr, tls).into_client_request()?;
    let host = req
        .uri()
        .host()
        .ok_or_else(|| anyhow::anyhow!("URL error: no host name"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();
    let port = req.uri().port_u16().unwrap_or(if tls { 443 } else { 80 });

    trace!("connecting to ({host}, {port})");
    let stream = connect_happy_eyeballs(&host, port, prefer_ipv6).await?;

    let connector = if tls {
        Connector::NativeTls(TlsConnector::new()?)
    } else {
        Connector::Plain
    };
    let (socket, _) = client_async_tls_with_config(req, stream, None, Some(connector)).await?;
    Ok(socket)
}

async fn connect_happy_eyeballs(
    host: &str,
    port: u16,
    prefer_ipv6: bool,
) -> anyhow::Result<TcpStream> {
    let (v4, v6): (Vec<_>, Vec<_>) = lookup_host((host, port)).await?.partition(|a| a.is_ipv4());
    let (first, second) = if prefer_ipv6 { (v6, v4) } else { (v4, v6) };

    let mut attempts = JoinSet::new();
    for addr in first.into_iter().interleave(second) {
        attempts.spawn(attempt(addr));

        let head_start = tokio::time::sleep(HAPPY_EYEBALLS_DELAY);
        tokio::pin!(head_start);
        loop {
            tokio::select! {
                biased;

                res = attempts.join_next() => match res {
                    Some(Ok(Some(stream))) => return Ok(stream),
                    Some(_) => continue,
                    // everything in flight failed, try the next address now
                    None => break,
                },
                _ = &mut head_start => break,
            }
        }
    }

    while let Some(res) = attempts.join_next().await {
        if let Ok(Some(stream)) = res {
            return Ok(stream);
        }
    }

    Err(anyhow::anyhow!("I/O error: all connection attempts failed"))
}

async fn attempt(addr: SocketAddr) -> Option<TcpStream> {
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            debug!("connection established with {addr}");
            Some(stream)
        }
        Err(e) => {
            trace!("connection attempt to {addr} failed: {e}");
            None
        }
    }
}
