//! File-backed development session
//!
//! Loads the identity the relay logs in as from a small JSON file:
//!
//! ```json
//! { "xuid": "2535400000000001", "displayName": "Steve", "rendezvousToken": "..." }
//! ```
//!
//! Chains are unsigned, so only servers that skip authentication accept it.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use netherlink_proto::IdentityData;
use netherlink_relay::UnsignedSession;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionFile {
    xuid: String,
    display_name: String,
    #[serde(default)]
    identity: String,
    #[serde(default)]
    title_id: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    rendezvous_token: Option<String>,
}

pub fn load(path: &Path) -> Result<UnsignedSession> {
    let json =
        fs::read_to_string(path).context(format!("Failed to read session file: {:?}", path))?;
    parse(&json).context(format!("Failed to parse session file: {:?}", path))
}

fn parse(json: &str) -> Result<UnsignedSession> {
    let file: SessionFile = serde_json::from_str(json)?;
    if file.xuid.is_empty() {
        anyhow::bail!("Session xuid cannot be empty");
    }

    let session = UnsignedSession::new(IdentityData {
        xuid: file.xuid,
        identity: file.identity,
        display_name: file.display_name,
        title_id: file.title_id,
    });

    Ok(session.with_tokens(
        file.access_token.unwrap_or_else(|| "development".to_string()),
        file.expires_at
            .unwrap_or_else(|| Utc::now() + Duration::hours(24)),
        file.rendezvous_token
            .unwrap_or_else(|| "development".to_string()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use netherlink_relay::Session;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_minimal_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("session.json");
        fs::write(&path, r#"{"xuid": "42", "displayName": "Alex"}"#).unwrap();

        let session = load(&path).unwrap();
        assert_eq!(session.xuid(), "42");
        assert_eq!(session.identity().display_name, "Alex");
        assert_eq!(session.rendezvous_token().await.unwrap(), "development");
    }

    #[tokio::test]
    async fn test_expired_tokens_are_kept() {
        let session = parse(
            r#"{"xuid": "1", "displayName": "A", "expiresAt": "2020-01-01T00:00:00Z", "rendezvousToken": "r"}"#,
        )
        .unwrap();
        assert!(session.token().await.is_err());
    }

    #[test]
    fn test_missing_xuid_rejected() {
        assert!(parse(r#"{"xuid": "", "displayName": "A"}"#).is_err());
        assert!(parse(r#"{"displayName": "A"}"#).is_err());
        assert!(load(Path::new("/nonexistent/session.json")).is_err());
    }
}
