use clap::Parser;
use miette::{IntoDiagnostic, WrapErr};
use otasim::{
    board::{self, Outcome},
    cli,
    tcp_bridge::TcpBridge,
};
use sim_config::PlatformConfig;
use tokio::{net::TcpListener, task};

fn main() -> miette::Result<()> {
    let args = cli::Args::parse();
    args.tracing.setup_tracing();
    let _span = tracing::info_span!("otasim").entered();
    run_otasim(args.otasim)
}

#[tokio::main(flavor = "current_thread")]
async fn run_otasim(opts: cli::OtasimOptions) -> miette::Result<()> {
    let config = ota_config::include_config!(PlatformConfig)
        .map_err(|e| miette::miette!("failed to load the built-in configuration: {e:?}"))?;

    tracing::info!(
        settings = ?config,
        "Loaded settings",
    );

    let settings = config.ota.into_settings();
    let module = config.platform.module.into_settings();
    let mut tcp = config.platform.tcp_uart.into_settings();
    if let Some(addr) = opts.serial_addr {
        tcp.socket_addr = addr;
    }

    let listener = TcpListener::bind(tcp.socket_addr)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to bind {}", tcp.socket_addr))?;
    tracing::info!("waiting for an image sender on {}", tcp.socket_addr);
    let (stream, addr) = listener.accept().await.into_diagnostic()?;
    tracing::info!(client.addr = %addr, target = ?opts.target, "sender connected");

    let (bridge, writer) = TcpBridge::spawn(stream, tcp.read_chunk);
    let target = opts.target;
    let outcome = task::spawn_blocking(move || board::run(settings, module, bridge, target))
        .await
        .into_diagnostic()??;
    // the bridge is gone, so this only waits for the last acks to go out
    if let Err(error) = writer.await {
        tracing::warn!(%error, "TCP writer task failed");
    }

    println!("========================================");
    match outcome {
        Outcome::Module(info) => {
            println!("{info}");
            if let Some(e) = info.error() {
                return Err(miette::miette!("module upgrade failed: {e}"));
            }
        }
        Outcome::Mcu {
            report,
            after_reset,
        } => {
            let report = report.into_diagnostic().wrap_err("MCU upgrade failed")?;
            println!(
                "MCU image: {} bytes in {} pages from page {}; banks after reset: {after_reset:?}",
                report.size, report.pages, report.start_page
            );
        }
    }
    Ok(())
}
