//! Command-line flags, parsed with `clap`.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tunnel-controller", version, about = "Reverse tunnel controller")]
pub struct Cli {
    #[arg(long = "configFile", default_value = "/app/config/config.yaml")]
    pub config_file: PathBuf,

    #[arg(long = "jaeger-endpoint")]
    pub jaeger_endpoint: Option<String>,

    #[arg(long = "traceToStdout", default_value_t = false)]
    pub trace_to_stdout: bool,

    #[arg(long = "traceRatio", default_value_t = 0.01)]
    pub trace_ratio: f64,
}
