//! Resolve the operational address of a commissioned node using mDNS.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use matc_case::{
    address::MrpConfig,
    driver,
    fabric::Fabric,
    peer::{FabricIndex, PeerId},
    resolver::{mdns::MdnsResolver, NodeLookupRequest},
};

#[derive(Parser, Debug)]
struct Cli {
    #[clap(long)]
    #[arg(default_value_t = false)]
    verbose: bool,

    #[clap(long)]
    #[arg(default_value_t = 0x110)]
    fabric_id: u64,

    /// uncompressed CA public key (65 bytes, hex)
    #[clap(long)]
    root_public_key: String,

    #[clap(long)]
    #[arg(default_value_t = 1)]
    fabric_index: u8,

    #[clap(long)]
    node_id: u64,

    /// seconds
    #[clap(long)]
    #[arg(default_value_t = 5)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Error
    };
    env_logger::Builder::new()
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_line_number(true)
        .format_file(true)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    let key = hex::decode(&cli.root_public_key).context("root public key is not hex")?;
    let fabric = Fabric::new(FabricIndex(cli.fabric_index), cli.fabric_id, &key)?;
    let peer = PeerId::new(cli.fabric_index, cli.node_id);
    let request = NodeLookupRequest::new(peer, fabric.compressed_fabric_id());
    println!("looking up {}", request.instance_name());

    // results of a direct resolve do not go through the sink
    let (sink, _queue) = driver::channel();
    let resolver = MdnsResolver::new(sink, Duration::from_secs(cli.timeout), MrpConfig::default());
    let result = resolver.resolve(request).await?;
    println!("address: {}", result.address);
    println!(
        "mrp: idle {:?} active {:?} active threshold {:?}",
        result.mrp.idle_interval(),
        result.mrp.active_interval(),
        result.mrp.active_threshold()
    );
    Ok(())
}
