use clap::Parser;
use respawn::cli::{self, CommonArgs};
use respawn::retry::{self, ExitCodesArg, SuccessCodes};

/// Run a command, restarting it whenever it terminates unexpectedly.
#[derive(Parser, Debug)]
#[command(name = "respawn", version, about)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Restart regardless of how the command terminated
    #[arg(short, long)]
    forever: bool,

    /// Continue the command when it is stopped instead of stopping too
    #[arg(short = 'Z', long = "continue")]
    continue_on_stop: bool,

    /// Give up once the original parent process has exited
    #[arg(short = 'P', long)]
    parented: bool,

    /// Additional exit statuses that count as success, or `none`
    #[arg(short = 'x', long = "exit", value_name = "N[,N...]|none")]
    exit: Vec<ExitCodesArg>,

    /// Command to supervise
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    cli::init_logging(cli.common.debug);
    tracing::debug!(?cli, "parsed CLI arguments");

    let result = cli.common.load_config().and_then(|mut config| {
        let restart = &mut config.restart;
        restart.forever |= cli.forever;
        restart.continue_on_stop |= cli.continue_on_stop;
        restart.parented |= cli.parented;

        let mut success = SuccessCodes::from_codes(&restart.success_codes);
        for arg in &cli.exit {
            success.apply(arg);
        }
        restart.success_codes = success.codes();

        retry::respawn(&cli.command, &config)
    });

    cli::finish(result)
}
