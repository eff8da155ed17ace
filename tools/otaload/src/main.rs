use clap::Parser;
use connection::Connect;
use miette::{Context, IntoDiagnostic};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod connection;
mod loader;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// path to the firmware image to send
    image: PathBuf,

    #[command(subcommand)]
    connect: Connect,

    #[clap(flatten)]
    settings: loader::Settings,

    /// a comma-separated list of `tracing` targets and levels to enable.
    ///
    /// for example, `info,otaload=trace` will enable the `INFO` level
    /// globally, and the `TRACE` level for everything in `otaload`.
    ///
    /// see <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/targets/struct.Targets.html#filtering-with-targets>
    /// for more details on this syntax.
    #[arg(
        short,
        long = "trace",
        global = true,
        env = "OTALOAD_TRACE",
        default_value_t = Targets::new().with_default(LevelFilter::INFO),
    )]
    trace_filter: Targets,
}

fn main() -> miette::Result<()> {
    let Args {
        image,
        connect,
        settings,
        trace_filter,
    } = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(trace_filter))
        .init();

    let bytes = std::fs::read(&image)
        .into_diagnostic()
        .with_context(|| format!("failed to read '{}'", image.display()))?;
    tracing::info!(len = bytes.len(), "Loaded '{}'", image.display());

    let mut conn = connect
        .connect()
        .into_diagnostic()
        .with_context(|| format!("failed to connect to {connect}"))?;
    tracing::info!("Connected to {connect}");

    let digest = loader::send_image(&mut conn, &bytes, &settings)
        .into_diagnostic()
        .with_context(|| format!("failed to send '{}'", image.display()))?;

    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    tracing::info!(sha256 = %hex, "Done.");
    Ok(())
}
