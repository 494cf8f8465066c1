use clap::Parser;
use tracing_subscriber::EnvFilter;

use riptide::config::{Cli, Config};
use riptide::reactor::Reactor;
use riptide::server::Server;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("riptide-server: {}", e);
            std::process::exit(1);
        }
    };

    // Reactor creation failure is fatal by design.
    let mut reactor: Reactor<Server> = match Reactor::new() {
        Ok(reactor) => reactor,
        Err(e) => {
            eprintln!("riptide-server: can't create event loop: {}", e);
            std::process::exit(1);
        }
    };
    let mut server = match Server::new(config, reactor.registry()) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("riptide-server: startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run(&mut reactor) {
        tracing::error!(error = %e, "event loop terminated");
        std::process::exit(1);
    }
}
