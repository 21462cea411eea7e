use clap::Parser;

use crate::application_state::CONFIG_PATH;

/// Receives NetFlow, IPFIX and sFlow exports, stores the decoded flows and
/// relays the original datagrams to downstream collectors.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// YAML configuration file; `FLOWGATE__*` variables override it.
    #[clap(short, long, value_parser, default_value = CONFIG_PATH)]
    pub config: String,

    /// Parse and validate the configuration, then exit.
    #[clap(long)]
    pub check: bool,
}
