use std::{
    env,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use clap::Args;
use thiserror::Error;

use crate::{normalize_path, services::LineEnding};

pub(crate) const DEFAULT_PORT: u16 = 2489;
pub(crate) const DEFAULT_ALLOW: &str = "0.0.0.0/0,::/0";
pub(crate) const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 << 20;

/// Startup-time configuration failures. The agent never binds when one of
/// these is raised.
#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("invalid allow-list range {entry:?}: {reason}")]
    InvalidRange { entry: String, reason: String },
    #[error("unknown line ending {0:?} (expected lf, crlf, cr or auto)")]
    LineEnding(String),
    #[error("invalid open command: {0}")]
    OpenCommand(String),
    #[error("store directory {path:?} is unusable: {source}")]
    StoreDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Args, Debug, Clone)]
pub(crate) struct ServerArgs {
    #[arg(long, env = "LEMONADE_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    #[arg(long, env = "LEMONADE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(
        long,
        env = "LEMONADE_ALLOW",
        default_value = DEFAULT_ALLOW,
        help = "Comma separated addresses or CIDR ranges allowed to call the agent"
    )]
    allow: String,

    #[arg(
        long,
        env = "LEMONADE_LINE_ENDING",
        default_value = "auto",
        help = "Line ending applied to copied text (lf|crlf|cr|auto)"
    )]
    line_ending: String,

    #[arg(long, env = "LEMONADE_STORE_DIR", default_value = "files")]
    store_dir: PathBuf,

    #[arg(
        long,
        env = "LEMONADE_SERVE_FILES_BEHIND_ALLOW_LIST",
        help = "Apply the allow-list to /files as well"
    )]
    serve_files_behind_allow_list: bool,

    #[arg(long, env = "LEMONADE_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: usize,

    #[arg(
        long,
        env = "LEMONADE_OPEN_COMMAND",
        help = "Command used to open URIs; the URI is appended as the last argument"
    )]
    open_command: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AgentConfig {
    pub(crate) listen: SocketAddr,
    pub(crate) port: u16,
    pub(crate) allow: String,
    pub(crate) line_ending: LineEnding,
    pub(crate) store_dir: PathBuf,
    pub(crate) serve_files_behind_allow_list: bool,
    pub(crate) max_upload_bytes: usize,
    pub(crate) open_command: Option<Vec<String>>,
}

impl AgentConfig {
    pub(crate) fn from_args(args: ServerArgs) -> Result<Self, ConfigError> {
        let line_ending = args.line_ending.parse::<LineEnding>()?;

        let open_command = match args.open_command.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                let tokens = shlex::split(raw)
                    .ok_or_else(|| ConfigError::OpenCommand(format!("invalid quoting in {raw:?}")))?;
                if tokens.is_empty() {
                    return Err(ConfigError::OpenCommand("command must not be empty".into()));
                }
                Some(tokens)
            }
        };

        let store_dir = if args.store_dir.is_absolute() {
            args.store_dir
        } else {
            let cwd = env::current_dir().map_err(|source| ConfigError::StoreDir {
                path: args.store_dir.clone(),
                source,
            })?;
            cwd.join(args.store_dir)
        };

        Ok(Self {
            listen: SocketAddr::new(args.host, args.port),
            port: args.port,
            allow: args.allow,
            line_ending,
            store_dir: normalize_path(&store_dir),
            serve_files_behind_allow_list: args.serve_files_behind_allow_list,
            max_upload_bytes: args.max_upload_bytes,
            open_command,
        })
    }
}

/// Maps the numeric `--log-level` flag onto a tracing filter directive.
pub(crate) fn log_filter(level: u8) -> &'static str {
    match level {
        0 => "debug",
        1 => "info",
        2 => "warn",
        _ => "error",
    }
}
