// Relay configuration and list-file loading.
//
// `RelayConfig` carries everything a `RelayServer` needs: where to bind,
// which groups may join, the candidate names for peers that ask the relay to
// name them, and the liveness/backpressure limits. Defaults match the
// protocol constants (port 65042, 5 s watchdog, 102400-byte inbound limit).
//
// Group and name lists can come from plain text files: one entry per line,
// surrounding whitespace trimmed, blank lines and lines starting with `#`
// skipped.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use peerhub_protocol::{DEFAULT_PORT, IN_BUFFER_LIMIT};
use thiserror::Error;

/// How long a client may stay silent before the relay drops it.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(5);

/// Names handed out to peers that join with a blank name.
pub const BUILTIN_NAMES: &[&str] = &[
    "Ant", "Bat", "Bear", "Beaver", "Bee", "Bird", "Bison", "Boar", "Buffalo", "Camel", "Cat",
    "Cheetah", "Chicken", "Cobra", "Cow", "Crab", "Crane", "Crow", "Deer", "Dingo", "Dog",
    "Dolphin", "Dove", "Duck", "Eagle", "Elephant", "Ferret", "Fish", "Fly", "Fox", "Frog",
    "Gecko", "Goat", "Goldfish", "Hamster", "Hawk", "Hippo", "Horse", "Hyena", "Kangaroo",
    "Kitten", "Lion", "Lizard", "Lobster", "Monkey", "Moose", "Mouse", "Octopus", "Otter", "Owl",
    "Ox", "Panda", "Parrot", "Peacock", "Pig", "Pigeon", "Puppy", "Python", "Raccoon", "Rat",
    "Raven", "Scorpion", "Seal", "Shark", "Sheep", "Snail", "Snake", "Spider", "Squirrel",
    "Tiger", "Turkey", "Whale", "Wolf", "Zebra",
];

/// Configuration for a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Interface address to bind to. `0.0.0.0` binds all interfaces.
    pub interface: String,
    /// TCP port. `0` lets the OS pick one (see `RelayServer::local_addr`).
    pub port: u16,
    /// Groups peers are allowed to join.
    pub groups: Vec<String>,
    /// Candidate names for peers that join with a blank name. Shuffled once
    /// per server.
    pub names: Vec<String>,
    /// Seed for the name shuffle. `None` seeds from the clock.
    pub name_seed: Option<u64>,
    /// Idle time after which a client is evicted.
    pub watchdog_timeout: Duration,
    /// Maximum unprocessed inbound bytes per client.
    pub in_buffer_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            groups: Vec::new(),
            names: BUILTIN_NAMES.iter().map(|n| (*n).to_owned()).collect(),
            name_seed: None,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            in_buffer_limit: IN_BUFFER_LIMIT,
        }
    }
}

impl RelayConfig {
    /// Default configuration allowing the given groups.
    pub fn with_groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} contains no entries")]
    Empty { path: PathBuf },
}

/// Parse a newline-separated list, skipping blank and `#` lines.
pub fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

/// Read a list file (see `parse_list`). An empty list is an error: a relay
/// with no groups or no names cannot admit anyone it was meant to.
pub fn load_list(path: &Path) -> Result<Vec<String>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    let entries = parse_list(&text);
    if entries.is_empty() {
        return Err(ConfigError::Empty {
            path: path.to_owned(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parse_list_skips_comments_and_blanks() {
        let text = "# allowed groups\n  net_demo  \n\n\t# indented comment\nclassroom-2\n   \n";
        assert_eq!(parse_list(text), vec!["net_demo", "classroom-2"]);
    }

    #[test]
    fn load_list_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Ant\n# not a name\nBat  ").unwrap();
        assert_eq!(load_list(file.path()).unwrap(), vec!["Ant", "Bat"]);
    }

    #[test]
    fn load_list_rejects_empty_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# nothing here").unwrap();
        let err = load_list(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Empty { .. }));
    }

    #[test]
    fn load_list_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_list(&dir.path().join("groups.txt")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn defaults() {
        let config = RelayConfig::with_groups(["g"]);
        assert_eq!(config.port, 65042);
        assert_eq!(config.groups, vec!["g"]);
        assert_eq!(config.names.len(), BUILTIN_NAMES.len());
        assert_eq!(config.watchdog_timeout, Duration::from_secs(5));
        assert_eq!(config.in_buffer_limit, 102_400);
    }
}
