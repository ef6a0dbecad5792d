use std::io::Write;

use futures_util::{SinkExt, StreamExt};
use log::{debug, trace};
use metricast_proto::Encoding;
use tokio_tungstenite::tungstenite::{Message, protocol::CloseFrame};
use tokio_util::sync::CancellationToken;

use crate::{connect::MetricsSocket, printer::SamplePrinter};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("server closed the stream: code={code}, reason={reason}")]
    ClosedByServer { code: u16, reason: String },
    #[error("connection lost")]
    ConnectionLost,
}

/// Print samples until the user asks to stop or the connection ends.
///
/// `Ok` means a requested shutdown; every other end is an error so the
/// caller reconnects.
pub async fn watch<W: Write>(
    socket: MetricsSocket,
    printer: &mut SamplePrinter<W>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let (mut write, mut read) = socket.split();

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("closing metrics stream");
                write.send(Message::Close(None)).await.ok();
                write.close().await.ok();
                return Ok(());
            }
            msg = read.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => printer.handle(Encoding::Json, text.as_bytes())?,
            Some(Ok(Message::Binary(bytes))) => printer.handle(Encoding::Postcard, &bytes)?,
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(CloseFrame { code, reason }) => (code.into(), reason.as_str().to_owned()),
                    None => (1005, String::new()),
                };
                return Err(StreamError::ClosedByServer { code, reason }.into());
            }
            Some(Ok(other)) => trace!("ignoring frame: {other:?}"),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(StreamError::ConnectionLost.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::connect;

    #[tokio::test]
    async fn shutdown_sends_close_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                shutdown.cancel();
                ws.next().await
            }
        });

        let socket = connect::connect(&addr.to_string(), false, false)
            .await
            .unwrap();
        let mut printer = SamplePrinter::new(Vec::new(), Vec::new());
        watch(socket, &mut printer, &shutdown).await.unwrap();

        let frame = server.await.unwrap();
        assert!(matches!(frame, Some(Ok(Message::Close(_)))), "{frame:?}");
    }

    #[tokio::test]
    async fn server_close_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let sample = metricast_proto::Sample {
                timestamp: 1_700_000_000,
                cpu_usage: 50.0,
                memory_usage: 50.0,
                disk_io: 100.0,
                network_in: 30.0,
                network_out: 30.0,
                uptime: 3,
                hostname: "server-4".to_owned(),
            };
            let Ok(metricast_proto::Payload::Text(text)) = Encoding::Json.encode(&sample) else {
                panic!("json encodes to text");
            };
            ws.send(Message::Text(text.into())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Away,
                reason: "server shutting down".into(),
            }))
            .await
            .unwrap();
            // keep the connection open until the viewer has read the close
            while ws.next().await.is_some() {}
        });

        let socket = connect::connect(&addr.to_string(), false, false)
            .await
            .unwrap();
        let mut printer = SamplePrinter::new(Vec::new(), Vec::new());
        let err = watch(socket, &mut printer, &CancellationToken::new())
            .await
            .unwrap_err();

        match err.downcast_ref::<StreamError>() {
            Some(StreamError::ClosedByServer { code, reason }) => {
                assert_eq!(*code, 1001);
                assert_eq!(reason, "server shutting down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // the sample ahead of the close frame was still printed
        let out = String::from_utf8(printer.into_inner()).unwrap();
        assert!(out.contains("server-4") && out.contains("up 3s"), "{out}");
    }
}
