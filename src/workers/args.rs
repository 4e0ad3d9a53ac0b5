//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap, one subcommand per role
//! - TOML configuration file with `[server]`, `[station]`, `[receiver]`
//!   and `[tokens]` sections
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::{DEFAULT_HTTP_ADDR, DEFAULT_WS_ADDR, HEARTBEAT_INTERVAL};
use crate::core::protocol::TransferMode;
use crate::server::auth::TokenTable;
use crate::server::ServerConfig;
use crate::workers::receiver::ReceiverConfig;
use crate::workers::station::StationConfig;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// capture-relay - coordinate capture-file delivery between stations and receivers.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for persistent data (database, logs, downloads).
    /// Defaults to ~/.capture-relay/
    #[clap(long, global = true)]
    pub conf: Option<PathBuf>,

    /// Configuration file merged under the CLI values.
    #[clap(long, global = true, default_value = "config.toml")]
    pub config: PathBuf,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the coordination server (WebSocket + HTTP API).
    Server(ServerArgs),
    /// Run a data-producing station.
    Station(StationArgs),
    /// Request a capture and download every station's file.
    Receiver(ReceiverArgs),
}

#[derive(clap::Args, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ServerArgs {
    /// WebSocket listen address.
    #[clap(long)]
    pub ws_addr: Option<String>,

    /// HTTP API listen address.
    #[clap(long)]
    pub http_addr: Option<String>,

    /// SQLite database file. Defaults to `relay.db` in the data directory.
    #[clap(long)]
    pub database: Option<PathBuf>,

    /// Keep all state in memory.
    #[clap(long)]
    pub in_memory: bool,

    /// Extra token entry, `TOKEN=role:id`. Repeatable.
    #[clap(long = "token", value_name = "TOKEN=ROLE:ID")]
    #[serde(skip)]
    pub tokens: Vec<String>,
}

#[derive(clap::Args, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct StationArgs {
    /// Server WebSocket URL.
    #[clap(long)]
    pub ws_url: Option<String>,

    #[clap(long)]
    pub station_id: Option<String>,

    #[clap(long)]
    pub token: Option<String>,

    /// Directory the requested capture files are served from.
    #[clap(long)]
    pub capture_dir: Option<PathBuf>,

    /// Base URL under which `capture_dir` is reachable over HTTP. Enables
    /// proxied downloads.
    #[clap(long)]
    pub download_base: Option<String>,

    /// Heartbeat interval in seconds.
    #[clap(long)]
    pub heartbeat_secs: Option<u64>,
}

#[derive(clap::Args, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct ReceiverArgs {
    /// Server WebSocket URL.
    #[clap(long)]
    pub ws_url: Option<String>,

    /// Server HTTP API base URL.
    #[clap(long)]
    pub http_url: Option<String>,

    #[clap(long)]
    pub receiver_id: Option<String>,

    #[clap(long)]
    pub token: Option<String>,

    /// Where downloaded files land, one subdirectory per station.
    #[clap(long)]
    pub output_dir: Option<PathBuf>,

    #[clap(long)]
    pub request_type: Option<String>,

    /// Request parameters as a JSON object.
    #[clap(long)]
    pub parameters: Option<String>,

    /// `proxy` or `direct`.
    #[clap(long)]
    pub transfer_mode: Option<String>,
}

/// Shape of `config.toml`.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct FileConfig {
    verbose: u8,
    conf: Option<PathBuf>,
    server: ServerArgs,
    station: StationArgs,
    receiver: ReceiverArgs,
    /// token → `"role:id"`
    tokens: HashMap<String, String>,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Loaded> {
        let cli = Args::parse();
        let file = Self::from_file(&cli.config)?;
        Ok(Self::merge(file, cli))
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// A missing file is an empty config; a malformed one is an error.
    fn from_file(path: &Path) -> Result<FileConfig> {
        if !path.exists() {
            return Ok(FileConfig::default());
        }
        let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn merge(file: FileConfig, cli: Args) -> Loaded {
        let verbose = if cli.verbose > 0 { cli.verbose } else { file.verbose };
        let conf = cli.conf.or(file.conf).map(Self::resolve_path);
        let command = match cli.command {
            Command::Server(a) => Command::Server(a.merge(file.server)),
            Command::Station(a) => Command::Station(a.merge(file.station)),
            Command::Receiver(a) => Command::Receiver(a.merge(file.receiver)),
        };
        Loaded {
            verbose,
            conf,
            command,
            tokens: file.tokens,
        }
    }
}

/// CLI and file merged.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub verbose: u8,
    pub conf: Option<PathBuf>,
    pub command: Command,
    tokens: HashMap<String, String>,
}

impl Loaded {
    /// The `[tokens]` table plus any `--token` entries (CLI wins on clashes).
    pub fn token_table(&self, extra: &[String]) -> Result<TokenTable> {
        let mut entries = self.tokens.clone();
        for entry in extra {
            let (token, peer) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("expected TOKEN=role:id, got '{entry}'"))?;
            entries.insert(token.to_string(), peer.to_string());
        }
        TokenTable::from_config(&entries)
    }
}

// ── Per-role resolution ──────────────────────────────────────────────────────

impl ServerArgs {
    fn merge(self, file: ServerArgs) -> Self {
        Self {
            ws_addr: self.ws_addr.or(file.ws_addr),
            http_addr: self.http_addr.or(file.http_addr),
            database: self.database.or(file.database),
            in_memory: self.in_memory || file.in_memory,
            tokens: self.tokens,
        }
    }

    pub fn resolve(&self, tokens: TokenTable, default_db: PathBuf) -> ServerConfig {
        ServerConfig {
            ws_addr: self.ws_addr.clone().unwrap_or_else(|| DEFAULT_WS_ADDR.to_string()),
            http_addr: self.http_addr.clone().unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            database: if self.in_memory {
                None
            } else {
                Some(self.database.clone().unwrap_or(default_db))
            },
            tokens,
        }
    }
}

impl StationArgs {
    fn merge(self, file: StationArgs) -> Self {
        Self {
            ws_url: self.ws_url.or(file.ws_url),
            station_id: self.station_id.or(file.station_id),
            token: self.token.or(file.token),
            capture_dir: self.capture_dir.or(file.capture_dir),
            download_base: self.download_base.or(file.download_base),
            heartbeat_secs: self.heartbeat_secs.or(file.heartbeat_secs),
        }
    }

    pub fn resolve(&self) -> Result<StationConfig> {
        let download_base = self
            .download_base
            .as_deref()
            .map(url::Url::parse)
            .transpose()
            .context("invalid download_base")?;
        Ok(StationConfig {
            ws_url: self.ws_url.clone().unwrap_or_else(|| format!("ws://{DEFAULT_WS_ADDR}")),
            station_id: required(&self.station_id, "station_id")?,
            token: required(&self.token, "token")?,
            capture_dir: self
                .capture_dir
                .clone()
                .ok_or_else(|| anyhow!("missing capture_dir"))?,
            download_base,
            heartbeat: self
                .heartbeat_secs
                .map(Duration::from_secs)
                .unwrap_or(HEARTBEAT_INTERVAL),
        })
    }
}

impl ReceiverArgs {
    fn merge(self, file: ReceiverArgs) -> Self {
        Self {
            ws_url: self.ws_url.or(file.ws_url),
            http_url: self.http_url.or(file.http_url),
            receiver_id: self.receiver_id.or(file.receiver_id),
            token: self.token.or(file.token),
            output_dir: self.output_dir.or(file.output_dir),
            request_type: self.request_type.or(file.request_type),
            parameters: self.parameters.or(file.parameters),
            transfer_mode: self.transfer_mode.or(file.transfer_mode),
        }
    }

    pub fn resolve(&self, default_output: PathBuf) -> Result<ReceiverConfig> {
        let parameters = match &self.parameters {
            Some(raw) => serde_json::from_str(raw).context("parameters must be JSON")?,
            None => serde_json::Value::Object(Default::default()),
        };
        let transfer_mode = match &self.transfer_mode {
            Some(raw) => TransferMode::parse(raw).ok_or_else(|| anyhow!("unknown transfer mode '{raw}'"))?,
            None => TransferMode::default(),
        };
        let request_type = required(&self.request_type, "request_type")?;
        if request_type.trim().is_empty() {
            bail!("request_type must not be empty");
        }
        Ok(ReceiverConfig {
            ws_url: self.ws_url.clone().unwrap_or_else(|| format!("ws://{DEFAULT_WS_ADDR}")),
            http_url: self
                .http_url
                .clone()
                .unwrap_or_else(|| format!("http://{DEFAULT_HTTP_ADDR}")),
            receiver_id: required(&self.receiver_id, "receiver_id")?,
            token: required(&self.token, "token")?,
            output_dir: self.output_dir.clone().unwrap_or(default_output),
            request_type,
            parameters,
            transfer_mode,
        })
    }
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("missing {name} (pass --{} or set it in config.toml)", name.replace('_', "-")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(toml_text: &str) -> FileConfig {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn cli_wins_over_file() {
        let cfg = file(
            r#"
            verbose = 1
            [station]
            station_id = "from-file"
            token = "file-token"
            capture_dir = "/captures"
            "#,
        );
        let cli = Args::try_parse_from(["capture-relay", "-vv", "station", "--station-id", "from-cli"]).unwrap();
        let loaded = Args::merge(cfg, cli);
        assert_eq!(loaded.verbose, 2);
        let Command::Station(station) = loaded.command else {
            panic!("expected station command");
        };
        assert_eq!(station.station_id.as_deref(), Some("from-cli"));
        assert_eq!(station.token.as_deref(), Some("file-token"));

        let resolved = station.resolve().unwrap();
        assert_eq!(resolved.heartbeat, HEARTBEAT_INTERVAL);
        assert_eq!(resolved.ws_url, format!("ws://{DEFAULT_WS_ADDR}"));
    }

    #[test]
    fn cli_tokens_extend_the_file_table() {
        let cfg = file(
            r#"
            [tokens]
            t-station = "station:st-01"
            "#,
        );
        let cli = Args::try_parse_from(["capture-relay", "server", "--token", "t-rx=receiver:rx-01", "--in-memory"]).unwrap();
        let loaded = Args::merge(cfg, cli);
        let Command::Server(server) = loaded.command.clone() else {
            panic!("expected server command");
        };
        let tokens = loaded.token_table(&server.tokens).unwrap();
        assert_eq!(tokens.len(), 2);

        let resolved = server.resolve(tokens, PathBuf::from("x.db"));
        assert!(resolved.database.is_none());
        assert_eq!(resolved.http_addr, DEFAULT_HTTP_ADDR);
    }

    #[test]
    fn receiver_requires_request_type_and_valid_mode() {
        let args = ReceiverArgs {
            receiver_id: Some("rx".into()),
            token: Some("t".into()),
            request_type: Some("pcap".into()),
            transfer_mode: Some("carrier-pigeon".into()),
            ..Default::default()
        };
        assert!(args.resolve(PathBuf::from("out")).is_err());

        let args = ReceiverArgs {
            transfer_mode: Some("direct".into()),
            parameters: Some(r#"{"file":"a.pcap"}"#.into()),
            ..args
        };
        let cfg = args.resolve(PathBuf::from("out")).unwrap();
        assert_eq!(cfg.transfer_mode, TransferMode::Direct);
        assert_eq!(cfg.parameters["file"], "a.pcap");

        let missing = ReceiverArgs::default();
        assert!(missing.resolve(PathBuf::from("out")).is_err());
    }
}
