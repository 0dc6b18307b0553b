use std::env;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Local;
use nix::unistd::chdir;

use jailhttpd::answer::Answerer;
use jailhttpd::config::ServerConfig;
use jailhttpd::server::{install_signal_handlers, AccessLog, Server};
use jailhttpd::SERVER_SOFTWARE;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        bail!("usage: {} config_file", args[0]);
    }
    let config = ServerConfig::load(Path::new(&args[1]))?;

    // Before the port opens, so a stop request always goes through the shutdown path.
    install_signal_handlers()?;

    // Read the local timezone once so handlers do not each repeat it.
    Local::now();

    // The log path may be relative to where we were started.
    let log = AccessLog::open(&config.log)?;
    chdir(&config.home)
        .with_context(|| format!("failed to change directory to {}", config.home.display()))?;

    let listener = TcpListener::bind(config.socket_addr())
        .with_context(|| format!("failed to create listening socket on {}", config.socket_addr()))?;

    eprintln!(
        "{} listening on http://{}/ serving {}",
        SERVER_SOFTWARE,
        config.socket_addr(),
        config.home.display()
    );
    if let Some(jail) = &config.jail {
        eprintln!(
            "CGI programs run as {} in {} via {}",
            jail.user,
            jail.dir.display(),
            jail.helper.display()
        );
    }

    let answerer = Answerer::new(&config, PathBuf::from("."));
    Server::new(listener, answerer, log).run()?;
    Ok(())
}
