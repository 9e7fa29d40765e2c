use anyhow::Result;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod util;
mod cmd_init;
mod cmd_put;
mod cmd_get;
mod cmd_status;
mod cmd_checkpoint;

fn init_logger() {
    // RUST_LOG, по умолчанию info
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse_args();
    match cli.cmd {
        cli::Cmd::Init { path, scale, simple, full_backup, block_mb } =>
            cmd_init::exec(path, scale, simple, full_backup, block_mb),

        cli::Cmd::Put { path, value, value_file, space } =>
            cmd_put::exec(path, value, value_file, space),

        cli::Cmd::Get { path, pos, out } =>
            cmd_get::exec(path, pos, out),

        cli::Cmd::Status { path, json } =>
            cmd_status::exec(path, json),

        cli::Cmd::Checkpoint { path } =>
            cmd_checkpoint::exec(path),
    }
}
