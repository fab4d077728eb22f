use std::net::SocketAddr;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::api::{routes, websocket};
use crate::state::RelayContext;

pub fn build_router(ctx: RelayContext) -> Router {
    Router::new()
        // Roster
        .route(
            "/api/v1/sessions/:session_id/participants",
            get(routes::participants::get_session_participants),
        )
        // Session room signaling
        .route("/ws/sessions/:session_id/", get(websocket::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Serve the relay on `host:port` until the process exits.
pub async fn start_relay(ctx: RelayContext, host: &str, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!("Signaling relay listening on ws://{}", listener.local_addr()?);
    axum::serve(listener, build_router(ctx)).await
}

/// Serve the relay in the background. Port 0 picks a free port; the bound
/// address is returned.
pub async fn spawn_relay(ctx: RelayContext, addr: &str) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Signaling relay listening on ws://{}", local);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, build_router(ctx)).await {
            error!("Signaling relay stopped: {}", e);
        }
    });
    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn open(addr: SocketAddr, session: &str, token: &str) -> Client {
        let url = format!("ws://{}/ws/sessions/{}/", addr, session);
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        let auth = serde_json::json!({"type": "auth", "token": token}).to_string();
        ws.send(Message::Text(auth)).await.unwrap();
        ws
    }

    async fn next_json(ws: &mut Client) -> serde_json::Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn relays_joins_chat_and_roster() {
        let ctx = RelayContext::new();
        let addr = spawn_relay(ctx.clone(), "127.0.0.1:0").await.unwrap();

        let mut tutor = open(addr, "77", "1:Ada:tutor").await;
        // Wait until the first socket is registered before the second joins.
        while ctx.roster("77").await.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let mut student = open(addr, "77", "2:Ben").await;

        let joined = next_json(&mut tutor).await;
        assert_eq!(joined, serde_json::json!({"type": "user_joined", "user_id": 2, "user_name": "Ben"}));

        student
            .send(Message::Text(r#"{"type":"chat_message","message":"hi"}"#.to_string()))
            .await
            .unwrap();
        let expected = serde_json::json!({"type": "chat_message", "user_id": 2, "user_name": "Ben", "message": "hi"});
        assert_eq!(next_json(&mut tutor).await, expected);
        assert_eq!(next_json(&mut student).await, expected);

        let roster: Vec<serde_json::Value> = {
            let body = http_get(addr, "/api/v1/sessions/77/participants").await;
            serde_json::from_str(&body).unwrap()
        };
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0]["user_name"], "Ada");

        student.close(None).await.unwrap();
        assert_eq!(
            next_json(&mut tutor).await,
            serde_json::json!({"type": "user_left", "user_id": 2})
        );
    }

    /// Minimal HTTP/1.1 GET over a raw socket.
    async fn http_get(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let body_start = response.find("\r\n\r\n").unwrap() + 4;
        response[body_start..].to_string()
    }
}
