use std::{
    error::Error,
    io::{self, Write},
    sync::Arc,
};

use clap::Parser;
use log::warn;

use labrad_client::{Command, ConnectionConfig, Record, connect, prompt};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Manager host; defaults to LABRADHOST or localhost
    #[arg(long)]
    host: Option<String>,
    /// Manager port; defaults to LABRADPORT or the well-known port
    #[arg(long)]
    port: Option<u16>,
    /// Manager password; defaults to LABRADPASSWORD
    #[arg(long)]
    password: Option<String>,
    /// Name this client identifies itself with
    #[arg(long)]
    name: Option<String>,
    /// Connection backend: threaded or forwarding
    #[arg(long, default_value = "threaded")]
    backend: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ConnectionConfig::from_env()?;
    if let Some(host) = cli.host {
        config = config.with_host(host);
    }
    if let Some(port) = cli.port {
        config = config.with_port(port);
    }
    if let Some(password) = cli.password {
        config = config.with_password(password);
    }

    let cxn = Arc::new(connect(&config, cli.name, Some(&cli.backend))?);
    println!(
        "connected to {}:{} as '{}' (id {})",
        config.host,
        config.port(),
        cxn.name(),
        cxn.id().unwrap_or_default()
    );

    let handler = Arc::clone(&cxn);
    ctrlc::set_handler(move || {
        if let Err(e) = handler.disconnect() {
            warn!("failed to disconnect: {e}");
        }
        std::process::exit(130);
    })?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        let cmd = match prompt(stdin.lock(), &mut stdout) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let (server, setting, argument) = match cmd {
            Command::Exit => break,
            Command::Call {
                server,
                setting,
                argument,
            } => (server, setting, argument),
        };

        match cxn.call(server, vec![Record::new(setting, argument)]) {
            Ok(records) => {
                for record in records {
                    writeln!(stdout, "{} ({}) {:?}", record.setting, record.tag, record.data)?;
                }
            }
            Err(e) if e.is_terminated() => {
                eprintln!("connection lost: {e}");
                break;
            }
            Err(e) => eprintln!("call failed: {e}"),
        }
    }

    cxn.disconnect()?;
    Ok(())
}
