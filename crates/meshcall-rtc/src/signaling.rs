//! WebSocket transport for the signaling service.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use url::Url;

use meshcall_core::protocol::{ClientMessage, ServerMessage};
use meshcall_core::{Credential, MeshError, SignalingChannel, SignalingConnector};

/// Connects to the signaling server over `ws://` or `wss://`.
#[derive(Debug, Clone)]
pub struct WsSignalingConnector {
    url: Url,
}

impl WsSignalingConnector {
    pub fn new(url: &str) -> Result<Self, MeshError> {
        let url = Url::parse(url).map_err(|e| MeshError::InvalidUrl(format!("{url}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(MeshError::InvalidUrl(format!(
                "unsupported signaling scheme {other}"
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn request_url(&self, credential: &Credential) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("token", credential.token());
        url
    }
}

impl SignalingConnector for WsSignalingConnector {
    fn connect(&self, credential: &Credential) -> BoxFuture<'static, Result<SignalingChannel, MeshError>> {
        let url = self.request_url(credential);
        let bearer = credential.bearer();
        Box::pin(async move {
            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| MeshError::Connection(format!("bad signaling request: {e}")))?;
            let auth = HeaderValue::from_str(&bearer)
                .map_err(|e| MeshError::Credential(format!("token is not a valid header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, auth);

            tracing::info!("connecting to signaling server {}", url.host_str().unwrap_or("?"));
            let (ws, _) = connect_async(request)
                .await
                .map_err(|e| MeshError::Connection(format!("websocket connect failed: {e}")))?;
            let (mut write, mut read) = ws.split();

            let connection_id = loop {
                let frame = match read.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        return Err(MeshError::Connection(format!("handshake failed: {e}")));
                    }
                    None => {
                        return Err(MeshError::Connection(
                            "socket closed before welcome".into(),
                        ));
                    }
                };
                match frame {
                    Message::Text(text) => match parse(text.as_str()) {
                        Some(ServerMessage::Welcome { connection_id }) => break connection_id,
                        Some(ServerMessage::Rejected { reason }) => {
                            return Err(MeshError::Rejected(reason));
                        }
                        Some(other) => {
                            tracing::debug!("ignoring {other:?} before welcome");
                        }
                        None => {}
                    },
                    Message::Close(_) => {
                        return Err(MeshError::Connection(
                            "socket closed before welcome".into(),
                        ));
                    }
                    _ => {}
                }
            };
            tracing::info!("signaling connected as {connection_id}");

            let (outbound, mut to_server) = mpsc::unbounded_channel::<ClientMessage>();
            let (to_session, inbound) = mpsc::unbounded_channel::<ServerMessage>();

            tokio::spawn(async move {
                while let Some(message) = to_server.recv().await {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!("cannot encode {message:?}: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::text(text)).await {
                        tracing::warn!("signaling write failed: {e}");
                        break;
                    }
                }
                let _ = write.close().await;
                tracing::debug!("signaling writer finished");
            });

            tokio::spawn(async move {
                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            let Some(message) = parse(text.as_str()) else {
                                continue;
                            };
                            if to_session.send(message).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("signaling read failed: {e}");
                            break;
                        }
                    }
                }
                tracing::info!("signaling connection closed");
            });

            Ok(SignalingChannel {
                connection_id,
                outbound,
                inbound,
            })
        })
    }
}

fn parse(text: &str) -> Option<ServerMessage> {
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!("skipping malformed signaling frame: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        // {"memName":"Ann"}
        Credential::parse(Some("eyJhbGciOiJIUzI1NiJ9.eyJtZW1OYW1lIjoiQW5uIn0.c2ln")).unwrap()
    }

    #[test]
    fn only_websocket_schemes_are_accepted() {
        assert!(WsSignalingConnector::new("wss://signal.example.org/ws").is_ok());
        assert!(WsSignalingConnector::new("ws://127.0.0.1:9000").is_ok());
        assert!(matches!(
            WsSignalingConnector::new("https://signal.example.org"),
            Err(MeshError::InvalidUrl(_))
        ));
        assert!(matches!(
            WsSignalingConnector::new("not a url"),
            Err(MeshError::InvalidUrl(_))
        ));
    }

    #[test]
    fn token_travels_in_the_query() {
        let connector = WsSignalingConnector::new("wss://signal.example.org/ws?v=2").unwrap();
        let url = connector.request_url(&credential());
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("v".to_string(), "2".to_string()));
        assert_eq!(pairs[1].0, "token");
        assert_eq!(pairs[1].1, credential().token());
    }

    #[test]
    fn malformed_frames_are_skipped() {
        assert!(parse("{\"event\":\"nope\"}").is_none());
        assert_eq!(parse("{\"event\":\"room_force_closed\"}"), Some(ServerMessage::RoomForceClosed));
    }
}
