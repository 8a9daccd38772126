use futures_util::future::BoxFuture;
use serde::Deserialize;
use url::Url;

use crate::credential::Credential;
use crate::errors::MeshError;

/// Response of the room directory lookup.
#[derive(Debug, Deserialize)]
struct RoomInfoResponse {
    #[serde(rename = "roomName")]
    room_name: String,
}

/// Looks up human-readable room details by room id.
pub trait RoomDirectory: Send + Sync {
    /// Resolve the display name of `room_id`.
    fn room_name(
        &self,
        room_id: &str,
        credential: &Credential,
    ) -> BoxFuture<'static, Result<String, MeshError>>;
}

/// Directory backed by the `getRoomInfo` HTTP endpoint.
#[derive(Clone)]
pub struct HttpRoomDirectory {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpRoomDirectory {
    pub fn new(base_url: &str) -> Result<Self, MeshError> {
        let base_url =
            Url::parse(base_url).map_err(|e| MeshError::InvalidUrl(format!("{base_url}: {e}")))?;
        Ok(Self {
            base_url,
            client: reqwest::Client::new(),
        })
    }

    /// `{base}/getRoomInfo/{room_id}` with the room id percent-encoded.
    pub fn room_info_url(&self, room_id: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{base}/getRoomInfo/{}", urlencoding::encode(room_id))
    }
}

impl RoomDirectory for HttpRoomDirectory {
    fn room_name(
        &self,
        room_id: &str,
        credential: &Credential,
    ) -> BoxFuture<'static, Result<String, MeshError>> {
        let url = self.room_info_url(room_id);
        let request = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, credential.bearer());

        Box::pin(async move {
            tracing::info!("requesting room info from {url}");
            let resp = request
                .send()
                .await
                .map_err(|e| MeshError::Http(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(MeshError::Http(format!(
                    "room directory returned status {}",
                    resp.status()
                )));
            }

            let data: RoomInfoResponse = resp
                .json()
                .await
                .map_err(|e| MeshError::Http(format!("invalid room info response: {e}")))?;
            Ok(data.room_name)
        })
    }
}
