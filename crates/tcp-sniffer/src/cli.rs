use clap::Parser;
use std::path::PathBuf;

use crate::config::{CaptureFormat, Config};

#[derive(Parser, Debug)]
#[command(
    name = "tcp-sniffer",
    version,
    about = "Transparent TCP proxy that dumps all relayed traffic"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "sniffer.yaml")]
    pub config: PathBuf,

    /// Address to listen on (overrides config file setting)
    #[arg(long)]
    pub local: Option<String>,

    /// Upstream server to dial (overrides config file setting)
    #[arg(long)]
    pub remote: Option<String>,

    /// Suppress most HTTP headers in the capture; type `h` + Enter to toggle
    #[arg(short = 'H', long)]
    pub suppress_headers: bool,

    /// Capture format (overrides config file setting)
    #[arg(long, value_enum)]
    pub format: Option<CaptureFormat>,

    /// Capture destination, `-` for stdout (overrides config file setting)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Run as a simple HTTP server on the local address, for testing
    #[arg(long)]
    pub test_server: bool,
}

impl Cli {
    /// Merge command-line overrides into `cfg`.
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(ref local) = self.local {
            cfg.network.listen_addr = local.clone();
        }
        if let Some(ref remote) = self.remote {
            cfg.network.upstream_addr = remote.clone();
        }
        if self.suppress_headers {
            cfg.capture.suppress_headers = true;
        }
        if let Some(format) = self.format {
            cfg.capture.format = format;
        }
        if let Some(ref output) = self.output {
            cfg.capture.output = output.clone();
        }
    }
}
