use clap::Parser;
use respawn::cli::{self, CommonArgs};
use respawn::timebound::{self, TimeBounds};

/// Run a command for at least MIN and at most MAX seconds.
#[derive(Parser, Debug)]
#[command(name = "timebound", version, about)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Minimum runtime in seconds
    #[arg(value_name = "MIN", default_value_t = 0)]
    min: u32,

    /// Maximum runtime in seconds; unbounded when omitted
    #[arg(value_name = "MAX")]
    max: Option<u32>,

    /// Command to run
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    cli::init_logging(cli.common.debug);
    tracing::debug!(?cli, "parsed CLI arguments");

    let bounds = match TimeBounds::new(cli.min, cli.max) {
        Ok(bounds) => bounds,
        Err(msg) => {
            use clap::CommandFactory;
            Cli::command()
                .error(clap::error::ErrorKind::ValueValidation, msg)
                .exit()
        }
    };

    let result = cli
        .common
        .load_config()
        .and_then(|config| timebound::run_bounded(&cli.command, bounds, &config));

    cli::finish(result)
}
