use clap::Parser as _;
use meter_reader::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_FILTER_VAR: &str = "METER_READER_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Read(commands::read::Args),
    Registers(commands::registers::Args),
    Meters(commands::meters::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var(LOG_FILTER_VAR).unwrap_or_else(|_| "warn".into());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: {LOG_FILTER_VAR} is not a valid filter: {e}");
            std::process::exit(2);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Registers(args) => end(commands::registers::run(args)),
        Commands::Meters(args) => end(commands::meters::run(args)),
    }
}
