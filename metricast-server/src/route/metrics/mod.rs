use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::Response,
};
use tracing::{Instrument, debug_span};

use crate::AppState;

mod egress;

pub async fn metrics_ws(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| {
        egress::handle_socket(socket, state).instrument(debug_span!("viewer_ws", %peer))
    })
}
