//! checkgrid: shared checkbox grid.
//!
//! ```text
//! checkgrid serve                 run the relay server (CHECKGRID_BIND, ...)
//! checkgrid join [config.json]    join a grid from the terminal
//! ```
//!
//! While joined, each stdin line is one command:
//! `<index> on`, `<index> off`, `<index>` (flip), `show`, `quit`.

mod terminal;

use std::process::ExitCode;

use checkgrid_collab::client::SyncClient;
use checkgrid_collab::config::ClientConfig;
use checkgrid_collab::server::{ServerConfig, SyncServer};
use log::{error, info};
use tokio::io::{AsyncBufReadExt, BufReader};

use terminal::TerminalPresenter;

/// One parsed stdin line.
#[derive(Debug, PartialEq, Eq)]
enum InputCommand {
    Set { index: usize, value: bool },
    Flip { index: usize },
    Show,
    Quit,
}

fn parse_input(line: &str) -> Result<InputCommand, String> {
    let mut words = line.split_whitespace();
    let first = words.next().ok_or_else(|| "empty command".to_string())?;

    match first {
        "show" => return Ok(InputCommand::Show),
        "quit" | "exit" => return Ok(InputCommand::Quit),
        _ => {}
    }

    let index = first
        .parse::<usize>()
        .map_err(|_| format!("not a cell index: {first:?}"))?;
    let command = match words.next() {
        None => InputCommand::Flip { index },
        Some("on") => InputCommand::Set { index, value: true },
        Some("off") => InputCommand::Set { index, value: false },
        Some(other) => return Err(format!("expected on/off, got {other:?}")),
    };
    if words.next().is_some() {
        return Err("too many words".to_string());
    }
    Ok(command)
}

fn usage() {
    eprintln!("usage: checkgrid serve | checkgrid join [config.json]");
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("serve") => serve().await,
        Some("join") => join(args.get(1).map(String::as_str)).await,
        _ => {
            usage();
            return ExitCode::from(2);
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::from_env()?;
    let server = SyncServer::new(config);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

async fn join(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => ClientConfig::from_path(path)?,
        None => ClientConfig::from_env()?,
    };
    let presenter = TerminalPresenter::for_grid(config.grid_size);
    let handle = SyncClient::websocket(config, presenter).start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match parse_input(&line) {
            Ok(InputCommand::Set { index, value }) => handle.toggle(index, value).await?,
            Ok(InputCommand::Flip { index }) => handle.flip(index).await?,
            Ok(InputCommand::Show) => {
                let view = TerminalPresenter::from_cells(handle.snapshot().await?);
                println!("{}", view.grid_text());
            }
            Ok(InputCommand::Quit) => break,
            Err(e) => eprintln!("{e}"),
        }
    }

    let (grid, _) = handle.stop().await?;
    info!("Left grid with {} of {} cells set", grid.count_set(), grid.size());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input() {
        assert_eq!(
            parse_input("12 on"),
            Ok(InputCommand::Set { index: 12, value: true })
        );
        assert_eq!(
            parse_input("  3   off "),
            Ok(InputCommand::Set { index: 3, value: false })
        );
        assert_eq!(parse_input("7"), Ok(InputCommand::Flip { index: 7 }));
        assert_eq!(parse_input("show"), Ok(InputCommand::Show));
        assert_eq!(parse_input("quit"), Ok(InputCommand::Quit));
    }

    #[test]
    fn test_parse_input_rejects_garbage() {
        assert!(parse_input("").is_err());
        assert!(parse_input("-1 on").is_err());
        assert!(parse_input("4 maybe").is_err());
        assert!(parse_input("4 on now").is_err());
    }
}
