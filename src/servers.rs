//! Saved server list
//!
//! Kept as one JSON array in ~/.netherlink/servers.json and always read and
//! written as a whole. A missing file means the featured servers.

use anyhow::{Context, Result};
use chrono::Utc;
use netherlink_proto::servers::{featured_servers, sort_by_last_played, ServerEntry, DEFAULT_PORT};
use std::fs;
use std::net::Ipv6Addr;
use std::path::PathBuf;

pub struct ServerStore {
    path: PathBuf,
}

impl ServerStore {
    pub fn new() -> Result<Self> {
        Ok(Self {
            path: crate::config::data_dir()?.join("servers.json"),
        })
    }

    #[cfg(test)]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Entries, most recently played first
    pub fn list(&self) -> Result<Vec<ServerEntry>> {
        if !self.path.exists() {
            return Ok(featured_servers());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read server list: {:?}", self.path))?;
        let mut servers: Vec<ServerEntry> = serde_json::from_str(&json)
            .context(format!("Failed to parse server list: {:?}", self.path))?;

        sort_by_last_played(&mut servers);
        Ok(servers)
    }

    fn save(&self, servers: &[ServerEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create data directory: {:?}", parent))?;
        }

        let json =
            serde_json::to_string_pretty(servers).context("Failed to serialize server list")?;
        fs::write(&self.path, json)
            .context(format!("Failed to write server list: {:?}", self.path))?;
        Ok(())
    }

    /// Add an entry, replacing any entry with the same name
    pub fn add(&self, entry: ServerEntry) -> Result<()> {
        if entry.name.trim().is_empty() {
            anyhow::bail!("Server name cannot be empty");
        }
        let mut servers = self.list()?;
        servers.retain(|s| s.name != entry.name);
        servers.push(entry);
        self.save(&servers)
    }

    /// Returns whether an entry was removed
    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut servers = self.list()?;
        let before = servers.len();
        servers.retain(|s| s.name != name);
        if servers.len() == before {
            return Ok(false);
        }
        self.save(&servers)?;
        Ok(true)
    }

    /// Stamp every entry pointing at `host:port` as played now
    pub fn mark_played(&self, host: &str, port: u16) -> Result<bool> {
        let mut servers = self.list()?;
        let mut found = false;
        for server in servers.iter_mut() {
            if server.host.eq_ignore_ascii_case(host) && server.port == port {
                server.mark_played(Utc::now());
                found = true;
            }
        }
        if found {
            self.save(&servers)?;
        }
        Ok(found)
    }
}

/// Split `host[:port]`, accepting bracketed or bare IPv6 literals
pub fn split_host_port(server: &str) -> Result<(String, u16)> {
    let server = server.trim();

    if let Some(rest) = server.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .context(format!("Unterminated IPv6 literal: {}", server))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().context(format!("Invalid port in {}", server))?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => anyhow::bail!("Unexpected text after IPv6 literal: {}", server),
        };
        return Ok((host.to_string(), port));
    }

    if server.parse::<Ipv6Addr>().is_ok() {
        return Ok((server.to_string(), DEFAULT_PORT));
    }

    match server.rsplit_once(':') {
        Some((host, port)) => Ok((
            host.to_string(),
            port.parse().context(format!("Invalid port in {}", server))?,
        )),
        None if server.is_empty() => anyhow::bail!("Server address cannot be empty"),
        None => Ok((server.to_string(), DEFAULT_PORT)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (ServerStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ServerStore::with_path(temp_dir.path().join("servers.json"));
        (store, temp_dir)
    }

    #[test]
    fn test_missing_file_lists_featured() {
        let (store, _temp) = create_test_store();
        let servers = store.list().unwrap();
        assert_eq!(servers.len(), 6);
        assert_eq!(servers[0].name, "The Hive");
    }

    #[test]
    fn test_add_and_remove() {
        let (store, _temp) = create_test_store();
        store
            .add(ServerEntry::new("Home", "192.168.1.20", 19132))
            .unwrap();
        let servers = store.list().unwrap();
        assert_eq!(servers.len(), 7);
        assert!(servers.iter().any(|s| s.name == "Home"));

        // Same name replaces
        store.add(ServerEntry::new("Home", "10.0.0.2", 19133)).unwrap();
        let servers = store.list().unwrap();
        assert_eq!(servers.len(), 7);
        let home = servers.iter().find(|s| s.name == "Home").unwrap();
        assert_eq!(home.address(), "10.0.0.2:19133");

        assert!(store.remove("Home").unwrap());
        assert!(!store.remove("Home").unwrap());
        assert_eq!(store.list().unwrap().len(), 6);
    }

    #[test]
    fn test_played_servers_sort_first() {
        let (store, _temp) = create_test_store();
        assert!(store.mark_played("play.galaxite.net", 19132).unwrap());
        assert!(!store.mark_played("unknown.example", 19132).unwrap());

        let servers = store.list().unwrap();
        assert_eq!(servers[0].name, "Galaxite");
        assert!(servers[0].last_played.is_some());
        assert!(servers[1..].iter().all(|s| s.last_played.is_none()));
    }

    #[test]
    fn test_empty_name_rejected() {
        let (store, _temp) = create_test_store();
        assert!(store.add(ServerEntry::new(" ", "h", 1)).is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("play.example.net:19133").unwrap(),
            ("play.example.net".to_string(), 19133)
        );
        assert_eq!(
            split_host_port("play.example.net").unwrap(),
            ("play.example.net".to_string(), 19132)
        );
        assert_eq!(
            split_host_port("[2001:db8::1]:19133").unwrap(),
            ("2001:db8::1".to_string(), 19133)
        );
        assert_eq!(
            split_host_port("2001:db8::1").unwrap(),
            ("2001:db8::1".to_string(), 19132)
        );
        assert!(split_host_port("host:notaport").is_err());
        assert!(split_host_port("").is_err());
    }
}
