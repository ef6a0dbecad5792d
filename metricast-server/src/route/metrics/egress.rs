use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::SinkExt;
use metricast_proto::Payload;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{AppState, broadcast::ChannelSubscriber};

pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let _tracker_token = state.ws_graceful_shutdown.tracker.token();
    let cancellation_token = state.ws_graceful_shutdown.token.child_token();

    let (subscriber, outbound) = ChannelSubscriber::new(state.subscriber_buffer);
    let id = state.registry.attach(Box::new(subscriber)).await;
    debug!(subscriber = %id, "websocket connected");

    let mut controller = EgressController {
        ws: socket,
        outbound,
        cancellation_token,
    };

    while controller.next().await {}

    // no-op when the broadcaster already evicted us
    state.registry.detach(id).await;
    controller.ws.close().await.ok();
    debug!(subscriber = %id, "websocket disconnected");
}

struct EgressController {
    ws: WebSocket,
    outbound: mpsc::Receiver<Payload>,
    cancellation_token: CancellationToken,
}

impl EgressController {
    async fn close<T: IntoCloseFrame>(&mut self, msg: T) -> anyhow::Result<()> {
        let msg = msg.into_close_frame();
        match msg {
            Some(CloseFrame { code, ref reason }) if code != close_code::NORMAL => {
                debug!(
                    code,
                    %reason,
                    "closing websocket with error"
                );
            }
            _ => {}
        }
        self.ws.send(Message::Close(msg)).await?;
        Ok(())
    }

    async fn next(&mut self) -> bool {
        tokio::select! {
            payload = self.outbound.recv() => {
                let Some(payload) = payload else {
                    // the registry closed our queue
                    self.close(EgressWsError::Evicted).await.ok();
                    return false;
                };

                if let Err(e) = self.ws.send(into_message(payload)).await {
                    debug!(error = %e, "failed to send sample");
                    return false;
                }
                true
            }
            msg = self.ws.recv() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        let reason = EgressWsError::Internal(e.to_string());
                        self.close(reason).await.ok();
                        return false;
                    }
                    None => {
                        return false; // connection closed
                    }
                };

                if let Err(e) = self.process_msg(msg) {
                    self.close(e).await.ok();
                    return false;
                }
                true
            }
            _ = self.cancellation_token.cancelled() => {
                self.close(EgressWsError::Shutdown).await.ok();
                false
            }
        }
    }

    /// Viewers only listen; anything but control frames is a protocol error.
    fn process_msg(&self, msg: Message) -> Result<(), EgressWsError> {
        match msg {
            Message::Close(Some(CloseFrame { code, reason })) => {
                trace!(
                    code,
                    %reason,
                    "websocket closed with frame"
                );
            }
            Message::Text(_) | Message::Binary(_) => {
                return Err(EgressWsError::UnexpectedMessage);
            }
            _ => {} // ping/pong are answered by axum
        }
        Ok(())
    }
}

fn into_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::Text(text.into()),
        Payload::Binary(bytes) => Message::Binary(bytes),
    }
}

trait IntoCloseFrame {
    fn into_close_frame(self) -> Option<CloseFrame>;
}

#[derive(Debug, thiserror::Error)]
enum EgressWsError {
    #[error("server is shutting down")]
    Shutdown,
    #[error("viewer could not keep up with the stream")]
    Evicted,
    #[error("unexpected message from viewer")]
    UnexpectedMessage,
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoCloseFrame for EgressWsError {
    fn into_close_frame(self) -> Option<CloseFrame> {
        Some(match self {
            EgressWsError::Shutdown => CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            },
            EgressWsError::Evicted => CloseFrame {
                code: close_code::AGAIN,
                reason: "viewer could not keep up".into(),
            },
            EgressWsError::UnexpectedMessage => CloseFrame {
                code: close_code::UNSUPPORTED,
                reason: "unexpected message from viewer".into(),
            },
            EgressWsError::Internal(reason) => CloseFrame {
                code: close_code::ERROR,
                reason: format!("internal error: {}", reason).into(),
            },
        })
    }
}
