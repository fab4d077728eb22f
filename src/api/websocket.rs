use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::{Participant, ParticipantRole};
use crate::signaling::{InboundFrame, OutboundFrame, UserId};
use crate::state::{Audience, RelayContext};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Parse a development token of the form `<user_id>:<user_name>[:tutor]`.
pub fn parse_dev_token(token: &str) -> Option<Participant> {
    let mut parts = token.splitn(3, ':');
    let user_id: UserId = parts.next()?.trim().parse().ok()?;
    let user_name = parts.next().map(str::trim).filter(|n| !n.is_empty())?;
    let role = match parts.next().map(str::trim) {
        None | Some("") | Some("student") => ParticipantRole::Student,
        Some("tutor") => ParticipantRole::Tutor,
        Some(_) => return None,
    };
    Some(Participant::joining(user_id, user_name, role))
}

/// Map a client frame to the frame the room sees and who sees it.
pub fn route_frame(sender: &Participant, frame: OutboundFrame) -> Option<(Audience, InboundFrame)> {
    let user_id = sender.user_id;
    let routed = match frame {
        OutboundFrame::Auth { .. } => return None,
        OutboundFrame::WebrtcSignal {
            target_user_id,
            signal,
        } => (
            Audience::Only(target_user_id),
            InboundFrame::WebrtcSignal {
                from_user_id: user_id,
                signal,
            },
        ),
        OutboundFrame::ChatMessage { message } => (
            Audience::Everyone,
            InboundFrame::ChatMessage {
                user_id,
                user_name: sender.user_name.clone(),
                message,
            },
        ),
        OutboundFrame::HandRaise { hand_raised } => (
            Audience::Everyone,
            InboundFrame::HandRaiseUpdate {
                user_id,
                hand_raised,
            },
        ),
        OutboundFrame::ParticipantState {
            audio_enabled,
            video_enabled,
        } => (
            Audience::Others(user_id),
            InboundFrame::ParticipantStateUpdate {
                user_id,
                audio_enabled,
                video_enabled,
            },
        ),
        OutboundFrame::ScreenShare { screen_sharing } => (
            Audience::Others(user_id),
            InboundFrame::ScreenShareUpdate {
                user_id,
                screen_sharing,
            },
        ),
    };
    Some(routed)
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(ctx): State<RelayContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, session_id))
}

/// Wait for the `auth` frame that must open every connection.
async fn authenticate(socket: &mut WebSocket) -> Option<Participant> {
    let first = tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await.ok()??;
    let Ok(Message::Text(text)) = first else {
        return None;
    };
    match serde_json::from_str::<OutboundFrame>(&text) {
        Ok(OutboundFrame::Auth { token }) => parse_dev_token(&token),
        Ok(_) => {
            warn!("First relay frame was not auth");
            None
        }
        Err(e) => {
            warn!("Malformed auth frame: {}", e);
            None
        }
    }
}

async fn handle_socket(mut socket: WebSocket, ctx: RelayContext, session_id: String) {
    let Some(participant) = authenticate(&mut socket).await else {
        debug!("Rejecting unauthenticated socket for session {}", session_id);
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let user_id = participant.user_id;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let connection_id = ctx.join(&session_id, participant.clone(), tx).await;

    ctx.deliver(
        &session_id,
        Audience::Others(user_id),
        &InboundFrame::UserJoined {
            user_id,
            user_name: participant.user_name.clone(),
        },
    )
    .await;

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                // The sender is dropped when a newer socket replaces this one.
                let Some(text) = outgoing else { break };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<OutboundFrame>(&text) {
                            Ok(frame) => {
                                if let Some((audience, routed)) = route_frame(&participant, frame) {
                                    ctx.deliver(&session_id, audience, &routed).await;
                                }
                            }
                            Err(e) => warn!("Dropping malformed frame from user {}: {}", user_id, e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    if ctx.leave(&session_id, user_id, connection_id).await {
        ctx.deliver(
            &session_id,
            Audience::Others(user_id),
            &InboundFrame::UserLeft { user_id },
        )
        .await;
    }
    info!("Relay socket for user {} in session {} closed", user_id, session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::PeerSignal;

    #[test]
    fn dev_tokens() {
        let p = parse_dev_token("12:Grace:tutor").unwrap();
        assert_eq!((p.user_id, p.user_name.as_str(), p.role), (12, "Grace", ParticipantRole::Tutor));
        assert_eq!(parse_dev_token("3:Sam").unwrap().role, ParticipantRole::Student);
        assert!(parse_dev_token("abc:Sam").is_none());
        assert!(parse_dev_token("3").is_none());
        assert!(parse_dev_token("3:Sam:admin").is_none());
    }

    #[test]
    fn routing_table() {
        let sender = Participant::joining(5, "Lin", ParticipantRole::Student);

        let (audience, frame) = route_frame(
            &sender,
            OutboundFrame::WebrtcSignal {
                target_user_id: 8,
                signal: PeerSignal::renegotiate(),
            },
        )
        .unwrap();
        assert_eq!(audience, Audience::Only(8));
        assert_eq!(frame.user_id(), Some(5));

        let (audience, frame) = route_frame(
            &sender,
            OutboundFrame::ChatMessage {
                message: "hello".into(),
            },
        )
        .unwrap();
        assert_eq!(audience, Audience::Everyone);
        assert_eq!(
            frame,
            InboundFrame::ChatMessage {
                user_id: 5,
                user_name: "Lin".into(),
                message: "hello".into(),
            }
        );

        let (audience, _) = route_frame(&sender, OutboundFrame::ScreenShare { screen_sharing: true }).unwrap();
        assert_eq!(audience, Audience::Others(5));
        assert!(route_frame(&sender, OutboundFrame::Auth { token: "x".into() }).is_none());
    }
}
