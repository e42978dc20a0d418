use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use bosun_api::constants::CONTROL_SOCKET_PATH;

use crate::BOSUN_VERSION;

#[derive(Parser, Debug)]
#[clap(version = BOSUN_VERSION, about = "Keeps helper boot partitions synchronized with their host volume")]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch mounted volumes and keep their helper partitions current
    Daemon {
        /// Control socket for lock clients
        #[clap(long, default_value = CONTROL_SOCKET_PATH)]
        socket: PathBuf,
    },

    /// One-shot update of one volume's helper partitions
    Update {
        /// Mount point of the host volume
        #[clap(index = 1)]
        volume: PathBuf,

        /// Update even when bootstamps say nothing changed
        #[clap(short, long)]
        force: bool,

        /// Control socket of a running daemon to lock through
        #[clap(long, default_value = CONTROL_SOCKET_PATH)]
        socket: PathBuf,
    },
}
