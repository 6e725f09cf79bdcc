//! Server status carried in unconnected pongs
//!
//! The payload is a `;` separated list where `\` escapes the following
//! character:
//!
//! ```text
//! MCPE;motd;protocol;version;players;max;guid;world;gamemode;...
//! ```

use std::fmt::Write as _;

use thiserror::Error;

/// Edition tag written at the start of encoded payloads
pub const EDITION: &str = "MCPE";

const MIN_FIELDS: usize = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("Invalid pong data: {0} field(s)")]
    TooFewFields(usize),

    #[error("Invalid player count: {0:?}")]
    InvalidPlayerCount(String),

    #[error("Invalid max player count: {0:?}")]
    InvalidMaxPlayers(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerStatus {
    /// MOTD shown in the server list, may contain formatting codes
    pub server_name: String,
    pub world_name: String,
    pub protocol_id: i32,
    pub version: String,
    pub player_count: u32,
    pub max_players: u32,
    pub raknet_id: i64,
    pub game_mode: String,
}

fn split_fields(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            ';' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn escape_into(out: &mut String, field: &str) {
    for c in field.chars() {
        if c == ';' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

impl ServerStatus {
    /// Decode a pong payload
    ///
    /// Protocol and guid are lenient and fall back to zero; player counts
    /// must be valid integers.
    pub fn parse(data: &[u8]) -> Result<Self, StatusError> {
        let fields = split_fields(&String::from_utf8_lossy(data));
        if fields.len() < MIN_FIELDS {
            return Err(StatusError::TooFewFields(fields.len()));
        }

        let player_count = fields[4]
            .trim()
            .parse()
            .map_err(|_| StatusError::InvalidPlayerCount(fields[4].clone()))?;
        let max_players = fields[5]
            .trim()
            .parse()
            .map_err(|_| StatusError::InvalidMaxPlayers(fields[5].clone()))?;

        let (world_name, game_mode) = if fields.len() >= 9 {
            (fields[7].clone(), fields[8].clone())
        } else {
            (String::new(), "Unknown".to_string())
        };

        Ok(Self {
            server_name: fields[1].clone(),
            world_name,
            protocol_id: fields[2].trim().parse().unwrap_or(0),
            version: fields[3].clone(),
            player_count,
            max_players,
            raknet_id: fields[6].trim().parse().unwrap_or(0),
            game_mode,
        })
    }

    /// Encode as a pong payload, escaping separators
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(64);
        out.push_str(EDITION);
        out.push(';');
        escape_into(&mut out, &self.server_name);
        let _ = write!(out, ";{};", self.protocol_id);
        escape_into(&mut out, &self.version);
        let _ = write!(
            out,
            ";{};{};{};",
            self.player_count, self.max_players, self.raknet_id
        );
        escape_into(&mut out, &self.world_name);
        out.push(';');
        escape_into(&mut out, &self.game_mode);
        out.push(';');
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_payload() {
        let status = ServerStatus::parse(
            b"MCPE;\xc2\xa7bThe Hive;827;1.21.100;12034;100000;11839247264893624;Hive Games;Survival;1;19132;19133;",
        )
        .unwrap();
        assert_eq!(status.server_name, "§bThe Hive");
        assert_eq!(status.protocol_id, 827);
        assert_eq!(status.version, "1.21.100");
        assert_eq!(status.player_count, 12034);
        assert_eq!(status.max_players, 100000);
        assert_eq!(status.raknet_id, 11839247264893624);
        assert_eq!(status.world_name, "Hive Games");
        assert_eq!(status.game_mode, "Survival");
    }

    #[test]
    fn test_parse_seven_fields_defaults() {
        let status = ServerStatus::parse(b"MCPE;motd;xx;1.0;1;10;guid").unwrap();
        assert_eq!(status.protocol_id, 0);
        assert_eq!(status.raknet_id, 0);
        assert_eq!(status.world_name, "");
        assert_eq!(status.game_mode, "Unknown");
    }

    #[test]
    fn test_parse_too_few_fields() {
        assert_eq!(
            ServerStatus::parse(b"MCPE;motd;827;1.0;1;10"),
            Err(StatusError::TooFewFields(6))
        );
    }

    #[test]
    fn test_parse_invalid_player_count() {
        assert!(matches!(
            ServerStatus::parse(b"MCPE;motd;827;1.0;many;10;1"),
            Err(StatusError::InvalidPlayerCount(_))
        ));
    }

    #[test]
    fn test_escaped_separator() {
        let status = ServerStatus::parse(br"MCPE;a\;b\\c;827;1.0;1;10;1;w;Creative;").unwrap();
        assert_eq!(status.server_name, r"a;b\c");
        assert_eq!(status.game_mode, "Creative");
    }

    #[test]
    fn test_encode_escapes_fields() {
        let status = ServerStatus {
            server_name: "semi;colon".into(),
            world_name: r"back\slash".into(),
            protocol_id: 818,
            version: "1.21.90".into(),
            player_count: 3,
            max_players: 20,
            raknet_id: -9,
            game_mode: "Survival".into(),
        };
        let encoded = status.encode();
        assert_eq!(
            String::from_utf8(encoded.clone()).unwrap(),
            r"MCPE;semi\;colon;818;1.21.90;3;20;-9;back\\slash;Survival;"
        );
        assert_eq!(ServerStatus::parse(&encoded).unwrap(), status);
    }
}
