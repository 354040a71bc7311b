mod firmware;
mod protocol;
mod sink;
mod transport;
mod transport_btleplug;
#[cfg(test)]
mod transport_mock;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Update firmware on BLE OTA DFU targets
#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// BLE DFU target name
    #[arg(short, long, default_value = "")]
    name: String,

    /// BLE address
    #[arg(short, long, default_value = "")]
    addr: String,

    /// Firmware container path
    #[arg(short, long)]
    firmware: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let firmware = firmware::FirmwareFile::open(&args.firmware)?;
    let image = firmware.image();
    info!(
        version = format_args!("{}.{}", image.version_major, image.version_minor),
        blocks = image.num_blocks(),
        total_bytes = image.total_bytes,
        base_addr = format_args!("{:#x}", image.base_addr),
        service_uuid = %image.service_uuid,
        "loaded firmware container"
    );

    let addr = if args.addr.is_empty() {
        None
    } else {
        Some(args.addr.parse::<btleplug::api::BDAddr>()?)
    };
    let (transport, events) =
        transport_btleplug::DfuTransportBtleplug::new(&args.name, addr).await?;

    let sink = sink::ProgressBarSink::new();
    let session = protocol::DfuSession::new(&transport, events, firmware, &sink);
    let total = session.run().await?;
    info!(total, "done");
    Ok(())
}
