use crate::{board::Target, sim_tracing};
use clap::Parser;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    #[clap(flatten)]
    pub otasim: OtasimOptions,

    #[clap(flatten)]
    pub tracing: sim_tracing::TracingOpts,
}

#[derive(Debug, clap::Args)]
pub struct OtasimOptions {
    /// Address to bind the TCP listener for the simulated data link.
    ///
    /// Overrides the address in the platform configuration.
    #[arg(long)]
    pub serial_addr: Option<SocketAddr>,

    /// What the downloaded image is for.
    #[arg(long, value_enum, default_value = "module")]
    pub target: Target,
}
