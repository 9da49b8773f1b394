use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "rotor")]
pub(crate) struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    pub(crate) host: String,
    #[arg(long, default_value_t = 8787)]
    pub(crate) port: u16,
    /// Upstream Gemini API keys, comma-separated. May be combined with
    /// --keys-file.
    #[arg(long, value_delimiter = ',')]
    pub(crate) keys: Vec<String>,
    /// File with one upstream key per line; blank lines and lines starting
    /// with '#' are skipped.
    #[arg(long)]
    pub(crate) keys_file: Option<PathBuf>,
    /// Caller-facing access keys (must start with "sk-"). When empty,
    /// authentication is disabled.
    #[arg(long, value_delimiter = ',')]
    pub(crate) access_keys: Vec<String>,
    #[arg(long)]
    pub(crate) real_stream: bool,
    #[arg(long)]
    pub(crate) fake_stream: bool,
    /// Append a random marker token to the first user message of every
    /// request.
    #[arg(long)]
    pub(crate) disguise: bool,
    #[arg(long, default_value_t = 300)]
    pub(crate) cache_ttl_secs: u64,
    #[arg(long, default_value_t = 25)]
    pub(crate) stream_deadline_secs: u64,
    /// Override the upstream API base URL.
    #[arg(long)]
    pub(crate) base_url: Option<String>,
}
