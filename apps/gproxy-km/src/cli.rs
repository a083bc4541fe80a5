use clap::Parser;

#[derive(Parser)]
#[command(name = "gproxy-km")]
pub(crate) struct Cli {
    /// Path to the YAML config file.
    #[arg(long, env = "GPROXY_KM_CONFIG", default_value = "config.yml")]
    pub(crate) config: String,
}
