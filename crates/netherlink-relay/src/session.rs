//! Identity collaborator interfaces
//!
//! Token acquisition, refresh and key handling belong to the application.
//! The relay only asks a [`Session`] for short-lived artifacts and never
//! re-authenticates by itself.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use netherlink_proto::login::{unsigned_jwt, JwtError};
use netherlink_proto::{CipherPair, ClientData, IdentityData, LoginRequest};
use serde_json::json;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session token expired")]
    Expired,

    #[error("Authorization rejected: {0}")]
    Rejected(String),

    #[error("Session unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid login: {0}")]
    InvalidLogin(String),

    #[error("Encryption handshake failed: {0}")]
    Handshake(String),
}

impl From<JwtError> for SessionError {
    fn from(e: JwtError) -> Self {
        SessionError::InvalidLogin(e.to_string())
    }
}

/// Opaque access token; only presence and expiry matter to the relay
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Signs what the relay sends upstream on behalf of the user
pub trait LoginSigner: Send + Sync + Debug {
    fn sign_client_data(&self, data: &ClientData) -> Result<String, SessionError>;

    /// Complete the server's encryption handshake, yielding the frame ciphers
    fn accept_handshake(&self, jwt: &[u8]) -> Result<CipherPair, SessionError>;
}

/// Identity chain plus the key that signs with it
#[derive(Debug, Clone)]
pub struct MultiplayerAuthorization {
    pub chain: Vec<String>,
    pub signer: Arc<dyn LoginSigner>,
}

/// Encryption handshake the relay should run with an inbound peer
#[derive(Debug)]
pub struct ServerHandshake {
    pub jwt: Vec<u8>,
    pub ciphers: CipherPair,
}

/// Result of checking an inbound login
#[derive(Debug)]
pub struct VerifiedLogin {
    pub identity: IdentityData,
    pub client_data: ClientData,
    pub handshake: Option<ServerHandshake>,
}

#[async_trait]
pub trait Session: Send + Sync + Debug {
    /// Xbox user id of the logged-in account
    fn xuid(&self) -> String;

    async fn token(&self) -> Result<AuthToken, SessionError>;

    async fn multiplayer_authorization(&self) -> Result<MultiplayerAuthorization, SessionError>;

    /// Token presented to the signaling service when publishing a tunnel
    async fn rendezvous_token(&self) -> Result<String, SessionError>;

    /// Validate the signed chain of an inbound login
    async fn verify_login(&self, request: &LoginRequest) -> Result<VerifiedLogin, SessionError>;
}

/// Session that trusts unsigned (`alg: none`) chains
///
/// For local development and tests only: it accepts any identity the peer
/// claims and cannot run the encryption handshake.
#[derive(Debug, Clone)]
pub struct UnsignedSession {
    identity: IdentityData,
    access_token: String,
    expires_at: DateTime<Utc>,
    rendezvous_token: String,
}

impl UnsignedSession {
    pub fn new(identity: IdentityData) -> Self {
        Self {
            identity,
            access_token: "unsigned".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(24),
            rendezvous_token: "unsigned".to_string(),
        }
    }

    pub fn with_tokens(
        mut self,
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        rendezvous_token: impl Into<String>,
    ) -> Self {
        self.access_token = access_token.into();
        self.expires_at = expires_at;
        self.rendezvous_token = rendezvous_token.into();
        self
    }

    pub fn identity(&self) -> &IdentityData {
        &self.identity
    }

    /// Unsigned chain asserting this session's identity
    pub fn chain(&self) -> Result<Vec<String>, SessionError> {
        Ok(vec![unsigned_jwt(&json!({
            "extraData": self.identity,
            "identityPublicKey": "",
        }))?])
    }
}

#[derive(Debug)]
struct UnsignedSigner;

impl LoginSigner for UnsignedSigner {
    fn sign_client_data(&self, data: &ClientData) -> Result<String, SessionError> {
        Ok(unsigned_jwt(data)?)
    }

    fn accept_handshake(&self, _jwt: &[u8]) -> Result<CipherPair, SessionError> {
        Err(SessionError::Handshake(
            "unsigned sessions cannot negotiate encryption".to_string(),
        ))
    }
}

#[async_trait]
impl Session for UnsignedSession {
    fn xuid(&self) -> String {
        self.identity.xuid.clone()
    }

    async fn token(&self) -> Result<AuthToken, SessionError> {
        let token = AuthToken {
            access_token: self.access_token.clone(),
            expires_at: self.expires_at,
        };
        if token.is_expired() {
            return Err(SessionError::Expired);
        }
        Ok(token)
    }

    async fn multiplayer_authorization(&self) -> Result<MultiplayerAuthorization, SessionError> {
        self.token().await?;
        Ok(MultiplayerAuthorization {
            chain: self.chain()?,
            signer: Arc::new(UnsignedSigner),
        })
    }

    async fn rendezvous_token(&self) -> Result<String, SessionError> {
        self.token().await?;
        Ok(self.rendezvous_token.clone())
    }

    async fn verify_login(&self, request: &LoginRequest) -> Result<VerifiedLogin, SessionError> {
        Ok(VerifiedLogin {
            identity: request.identity_unverified()?,
            client_data: request.client_data_unverified()?,
            handshake: None,
        })
    }
}
