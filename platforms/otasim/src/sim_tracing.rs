use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

#[derive(Debug, clap::Args)]
pub struct TracingOpts {
    /// a comma-separated list of `tracing` targets and levels to enable.
    ///
    /// for example, `info,otafw=debug,otafw::serial=trace` will enable:
    ///
    /// - the `INFO` level globally (regardless of module path),
    /// - the `DEBUG` level for all modules in the `otafw` crate,
    /// - and the `TRACE` level for the `serial` module in `otafw`.
    ///
    /// see <https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/targets/struct.Targets.html#filtering-with-targets>
    /// for more details on this syntax.
    #[arg(
        short,
        long = "trace",
        global = true,
        env = "OTASIM_TRACE",
        default_value_t = Targets::new().with_default(LevelFilter::INFO),
    )]
    trace_filter: Targets,

    /// include thread names in log lines. the receive interrupt runs on its
    /// own thread, so this shows which side logged what.
    #[arg(long, global = true)]
    thread_names: bool,
}

impl TracingOpts {
    pub fn setup_tracing(&self) {
        let fmt = fmt::layer()
            .with_thread_names(self.thread_names)
            .with_filter(self.trace_filter.clone());
        tracing_subscriber::registry().with(fmt).init();
    }
}
