use anyhow::Context;
use clap::Parser;
use knockd::knock_utils::capturing_frames::raw_socket::FrameCapture;
use knockd::knock_utils::capturing_frames::xdp_loader::attach_xdp;
use knockd::knock_utils::publishing_events::ring_buf::knock_ring;
use knockd::knock_utils::receiving_knocks::receiver::KnockReceiver;
use knockd::knock_utils::shared::helper::resolve_interface;
use knockd::knock_utils::shared::types_and_config::{
    CaptureMode, GivenConfig, load_configuration,
};
use knockd::{Args, Command, ServeArgs};
use log::{error, info};
use tokio::signal;

// NOTICE: logging goes to stderr, knocks to stdout, use "sudo knockd serve 2>knockd.log"
// to keep them apart

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match args.command {
        Command::DefaultConfig => {
            let json = serde_json::to_string_pretty(&GivenConfig::default())
                .context("failed to serialize default config")?;
            println!("{}", json);
            Ok(())
        }
        Command::Serve(serve_args) => serve(serve_args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<(), anyhow::Error> {
    let given = load_configuration(args.config.as_deref()).context("failed to load config")?;
    let mut config = given.extract_config(&args);
    config.interface = resolve_interface(&config.interface)?;
    info!(
        "listening for knocks on {} ({:?} mode)",
        config.interface, config.capture_mode
    );

    // CTRLC HANDLING
    let (tx_shutdown, rx_shutdown) = tokio::sync::mpsc::channel::<String>(1);
    tokio::spawn(async move {
        // a failed handler drops the sender, which stops the receiver as well
        match signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx_shutdown.send(String::from("ctrl-c")).await;
            }
            Err(e) => error!("failed to listen for ctrl-c: {}", e),
        }
    });

    match config.capture_mode {
        CaptureMode::Xdp => {
            let (attachment, events) =
                attach_xdp(&config).context("failed to attach the knock program")?;
            info!("XDP attachment ready ({:?})", attachment.mode);
            KnockReceiver::start_receiving(events, rx_shutdown).await?;
            drop(attachment);
            info!("knock program detached from {}", config.interface);
        }
        CaptureMode::Socket => {
            let (producer, consumer) = knock_ring(config.ring_byte_size)?;
            info!("user space knock ring: {} bytes", producer.byte_size());
            let capture = FrameCapture::start(&config, producer)
                .context("failed to start AF_PACKET capture")?;
            let result = KnockReceiver::start_receiving(consumer, rx_shutdown).await;
            info!("{} frames inspected", capture.frames_seen());
            capture.stop();
            result?;
        }
    }
    Ok(())
}
