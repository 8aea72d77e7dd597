use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use mediabus::server::{NullSinkFactory, Server};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Path of the listening socket; defaults to
    /// $XDG_RUNTIME_DIR/mediabus-0 or /tmp/mediabus-0
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Server name advertised in the core hello
    #[arg(short, long, default_value = "mediabus-0")]
    name: String,
}

fn default_socket() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir).join("mediabus-0"),
        None => PathBuf::from("/tmp/mediabus-0"),
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let Args { socket, name } = Args::parse();
    let path = socket.unwrap_or_else(default_socket);

    let mut server = Server::new(&name);
    server.add_factory(Box::new(NullSinkFactory));
    server.start(&path)?;

    Ok(())
}
