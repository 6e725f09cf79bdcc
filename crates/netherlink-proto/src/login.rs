//! Login request model
//!
//! A login request is the identity certificate chain plus a client-data JWT,
//! both length-prefixed inside the Login packet. Signature verification is
//! the session provider's job; this module only builds, splits and reads
//! unverified claims.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::codec::{CodecError, PacketReader, PacketWriter};
use crate::packets::Login;

/// Fixed device profile presented to upstream servers
pub const NORMALIZED_DEVICE_OS: i32 = 7;
pub const NORMALIZED_PLATFORM_TYPE: i32 = 0;
pub const NORMALIZED_DEFAULT_INPUT_MODE: i32 = 1;

/// Build suffix appended to short game versions
const GAME_VERSION_BUILD_SUFFIX: &str = ".24";

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Malformed token: expected three segments")]
    Malformed,

    #[error("Invalid base64 in token: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid login request: {0}")]
    Codec(#[from] CodecError),

    #[error("No identity data in chain")]
    MissingIdentity,
}

/// Chain plus client data as carried in the Login packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub chain: Vec<String>,
    pub client_data_jwt: String,
}

#[derive(Serialize, Deserialize)]
struct ChainEnvelope {
    chain: Vec<String>,
}

impl LoginRequest {
    pub fn new(chain: Vec<String>, client_data_jwt: impl Into<String>) -> Self {
        Self {
            chain,
            client_data_jwt: client_data_jwt.into(),
        }
    }

    /// Serialize into the connection request bytes of a Login packet
    pub fn encode(&self) -> Result<Vec<u8>, JwtError> {
        let chain = serde_json::to_vec(&ChainEnvelope {
            chain: self.chain.clone(),
        })?;
        let mut w = PacketWriter::new(0);
        w.i32_le_slice(&chain);
        w.i32_le_slice(self.client_data_jwt.as_bytes());
        Ok(w.freeze().to_vec())
    }

    pub fn decode(request: &[u8]) -> Result<Self, JwtError> {
        let mut r = PacketReader::new(request, 0);
        let chain: ChainEnvelope = serde_json::from_slice(r.i32_le_slice()?)?;
        let token = r.i32_le_slice()?;
        let client_data_jwt =
            String::from_utf8(token.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(Self {
            chain: chain.chain,
            client_data_jwt,
        })
    }

    pub fn into_packet(&self, protocol: i32) -> Result<Login, JwtError> {
        Ok(Login {
            client_protocol: protocol,
            connection_request: self.encode()?,
        })
    }

    pub fn from_packet(pk: &Login) -> Result<Self, JwtError> {
        Self::decode(&pk.connection_request)
    }

    /// Identity claims from the chain, without checking signatures
    pub fn identity_unverified(&self) -> Result<IdentityData, JwtError> {
        identity_from_chain(&self.chain)
    }

    pub fn client_data_unverified(&self) -> Result<ClientData, JwtError> {
        decode_claims_unverified(&self.client_data_jwt)
    }
}

/// Identity asserted by the certificate chain
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdentityData {
    #[serde(rename = "XUID", default)]
    pub xuid: String,
    #[serde(default)]
    pub identity: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "titleId", default, skip_serializing_if = "String::is_empty")]
    pub title_id: String,
}

#[derive(Deserialize)]
struct ChainLinkClaims {
    #[serde(rename = "extraData")]
    extra_data: Option<IdentityData>,
}

/// Find the chain link carrying `extraData`
pub fn identity_from_chain(chain: &[String]) -> Result<IdentityData, JwtError> {
    for link in chain {
        let claims: ChainLinkClaims = decode_claims_unverified(link)?;
        if let Some(identity) = claims.extra_data {
            return Ok(identity);
        }
    }
    Err(JwtError::MissingIdentity)
}

/// Client metadata sent alongside the chain
///
/// Only the fields the relay rewrites are typed; every other claim is kept
/// verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClientData {
    #[serde(rename = "DeviceOS", default)]
    pub device_os: i32,
    #[serde(rename = "PlatformType", default)]
    pub platform_type: i32,
    #[serde(rename = "DefaultInputMode", default)]
    pub default_input_mode: i32,
    #[serde(rename = "GameVersion", default)]
    pub game_version: String,
    #[serde(rename = "ServerAddress", default)]
    pub server_address: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientData {
    /// Rewrite device fields to the fixed profile and point the data at `server_address`
    pub fn normalize(&mut self, server_address: &str) {
        self.device_os = NORMALIZED_DEVICE_OS;
        self.platform_type = NORMALIZED_PLATFORM_TYPE;
        self.default_input_mode = NORMALIZED_DEFAULT_INPUT_MODE;
        if !self.game_version.is_empty() && self.game_version.split('.').count() < 4 {
            self.game_version.push_str(GAME_VERSION_BUILD_SUFFIX);
        }
        self.server_address = server_address.to_string();
    }
}

/// Decode the payload segment of a JWT without verifying it
pub fn decode_claims_unverified<T: DeserializeOwned>(jwt: &str) -> Result<T, JwtError> {
    let mut parts = jwt.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(JwtError::Malformed),
    };
    let raw = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Build an unsigned (`alg: none`) JWT
pub fn unsigned_jwt<T: Serialize>(claims: &T) -> Result<String, JwtError> {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    Ok(format!("{}.{}.", header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity_chain() -> Vec<String> {
        vec![
            unsigned_jwt(&json!({"certificateAuthority": true})).unwrap(),
            unsigned_jwt(&json!({
                "extraData": {
                    "XUID": "2535400000000001",
                    "identity": "5d8a1f7e-0000-4000-8000-000000000001",
                    "displayName": "Steve"
                }
            }))
            .unwrap(),
        ]
    }

    #[test]
    fn test_login_request_layout() {
        let request = LoginRequest::new(vec!["a.b.c".into()], "x.y.z");
        let bytes = request.encode().unwrap();

        let chain_json = br#"{"chain":["a.b.c"]}"#;
        assert_eq!(&bytes[..4], &(chain_json.len() as i32).to_le_bytes());
        assert_eq!(&bytes[4..4 + chain_json.len()], chain_json);
        assert_eq!(&bytes[bytes.len() - 5..], b"x.y.z");

        assert_eq!(LoginRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_truncated_request_fails() {
        let bytes = LoginRequest::new(vec![], "x.y.z").encode().unwrap();
        assert!(LoginRequest::decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn test_identity_from_chain() {
        let request = LoginRequest::new(identity_chain(), "");
        let identity = request.identity_unverified().unwrap();
        assert_eq!(identity.xuid, "2535400000000001");
        assert_eq!(identity.display_name, "Steve");
    }

    #[test]
    fn test_identity_missing() {
        let chain = vec![unsigned_jwt(&json!({"nbf": 1})).unwrap()];
        assert!(matches!(
            identity_from_chain(&chain),
            Err(JwtError::MissingIdentity)
        ));
    }

    #[test]
    fn test_malformed_jwt() {
        assert!(matches!(
            decode_claims_unverified::<Value>("only.two"),
            Err(JwtError::Malformed)
        ));
    }

    #[test]
    fn test_client_data_normalize_preserves_other_claims() {
        let claims = json!({
            "DeviceOS": 1,
            "PlatformType": 2,
            "DefaultInputMode": 2,
            "GameVersion": "1.21.90",
            "ServerAddress": "127.0.0.1:19132",
            "SkinId": "custom",
            "LanguageCode": "en_GB"
        });
        let mut data: ClientData = serde_json::from_value(claims).unwrap();
        data.normalize("play.example.net:19132");

        assert_eq!(data.device_os, 7);
        assert_eq!(data.platform_type, 0);
        assert_eq!(data.default_input_mode, 1);
        assert_eq!(data.game_version, "1.21.90.24");
        assert_eq!(data.server_address, "play.example.net:19132");

        let out = serde_json::to_value(&data).unwrap();
        assert_eq!(out["SkinId"], "custom");
        assert_eq!(out["LanguageCode"], "en_GB");
        assert_eq!(out["DeviceOS"], 7);
    }

    #[test]
    fn test_full_game_version_untouched() {
        let mut data = ClientData {
            game_version: "1.21.93.1".into(),
            ..Default::default()
        };
        data.normalize("a:1");
        assert_eq!(data.game_version, "1.21.93.1");
    }
}
