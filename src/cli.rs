//! Command line options

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "Collects DORA metrics from GitHub and exposes them to Prometheus", long_about = None)]
pub struct Cli {
    /// Port of the metrics endpoint
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Run a single collection cycle for every repository, print the metrics and exit
    #[arg(long)]
    pub once: bool,

    /// Skip verifying the GitHub token at startup
    #[arg(long)]
    pub skip_access_check: bool,
}
