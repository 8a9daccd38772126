use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::errors::MeshError;

/// Display name used when the token carries none.
pub const DEFAULT_DISPLAY_NAME: &str = "Guest";

/// Claims this client reads from the token payload. Everything else is left
/// to the issuer and the signaling server.
#[derive(Debug, Default, Deserialize)]
struct Claims {
    #[serde(rename = "memName", default)]
    member_name: Option<String>,
    #[serde(rename = "roomPw", default)]
    room_password: Option<String>,
}

/// Bearer token presented to the signaling and directory services.
///
/// The token is opaque to this client apart from its payload claims, which
/// are decoded without checking the signature.
#[derive(Clone)]
pub struct Credential {
    token: String,
    display_name: String,
    room_password: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

impl Credential {
    /// Validate the token shape and read its claims.
    pub fn parse(token: Option<&str>) -> Result<Self, MeshError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| MeshError::Credential("no token provided".into()))?;

        let re = regex::Regex::new(r"^[A-Za-z0-9_-]+={0,2}\.([A-Za-z0-9_-]+={0,2})\.[A-Za-z0-9_-]*={0,2}$")
            .map_err(|e| MeshError::Credential(e.to_string()))?;
        let payload = re
            .captures(token)
            .and_then(|caps| caps.get(1))
            .ok_or_else(|| MeshError::Credential("token is not a three-part JWT".into()))?
            .as_str()
            .trim_end_matches('=');

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| MeshError::Credential(format!("payload is not base64url: {e}")))?;
        let claims: Claims = serde_json::from_slice(&bytes)
            .map_err(|e| MeshError::Credential(format!("payload is not JSON: {e}")))?;

        let display_name = claims
            .member_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());

        tracing::debug!("credential parsed for {display_name}");
        Ok(Self {
            token: token.to_string(),
            display_name,
            room_password: claims.room_password.filter(|p| !p.is_empty()),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn room_password(&self) -> Option<&str> {
        self.room_password.as_deref()
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}
