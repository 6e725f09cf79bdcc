//! Saved server entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 19132;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_played: Option<DateTime<Utc>>,
}

impl ServerEntry {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            last_played: None,
        }
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn mark_played(&mut self, at: DateTime<Utc>) {
        self.last_played = Some(at);
    }
}

/// Servers offered when no list has been saved yet
pub fn featured_servers() -> Vec<ServerEntry> {
    [
        ("The Hive", "geo.hivebedrock.network"),
        ("Mineville", "play.inpvp.net"),
        ("Lifeboat", "mco.lbsg.net"),
        ("CubeCraft", "mco.cubecraft.net"),
        ("Galaxite", "play.galaxite.net"),
        ("Enchanted Dragons", "play.enchanted.gg"),
    ]
    .into_iter()
    .map(|(name, host)| ServerEntry::new(name, host, DEFAULT_PORT))
    .collect()
}

/// Most recently played first; never played entries keep their order at the end
pub fn sort_by_last_played(servers: &mut [ServerEntry]) {
    servers.sort_by(|a, b| b.last_played.cmp(&a.last_played));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_featured_servers() {
        let servers = featured_servers();
        assert_eq!(servers.len(), 6);
        assert_eq!(servers[0].name, "The Hive");
        assert!(servers.iter().all(|s| s.port == 19132));
    }

    #[test]
    fn test_sort_by_last_played() {
        let mut servers = featured_servers();
        servers[2].mark_played(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        servers[4].mark_played(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        sort_by_last_played(&mut servers);

        assert_eq!(servers[0].name, "Galaxite");
        assert_eq!(servers[1].name, "Lifeboat");
        assert_eq!(servers[2].name, "The Hive");
        assert_eq!(servers[5].name, "Enchanted Dragons");
    }

    #[test]
    fn test_address_brackets_ipv6() {
        assert_eq!(ServerEntry::new("v6", "::1", 19133).address(), "[::1]:19133");
        assert_eq!(ServerEntry::new("v4", "1.2.3.4", 1).address(), "1.2.3.4:1");
    }

    #[test]
    fn test_json_shape() {
        let entry = ServerEntry::new("Local", "127.0.0.1", 19132);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["host"], "127.0.0.1");
        assert!(json.get("lastPlayed").is_none());
    }
}
