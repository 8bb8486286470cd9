use anyhow::Context;
use tracing_subscriber::EnvFilter;
use v86_task::Engine;
use v86d::{Command, Config};

fn main() -> anyhow::Result<()> {
    let config = Config::load();

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match config.command {
        Command::Serve => v86d::serve(&config),
        Command::Probe => {
            let backend =
                v86d::open_backend(&config).context("failed to initialise execution backend")?;
            let mut engine = Engine::new(backend);
            let report = v86d::probe(&mut engine).context("BIOS probe failed")?;
            print!("{report}");
            Ok(())
        }
        Command::Stop => v86d::stop(&config),
    }
}
