use sim_config::PlatformConfig;

fn main() -> miette::Result<()> {
    ota_config::buildtime::render_file::<PlatformConfig>("otasim.toml")
}
