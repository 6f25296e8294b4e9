use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use ferry_proto::{
    Error, FileRoot, MAX_LINE_BYTES, Request, TcpChannel, TransferEvent, TransferLog,
    TransferLogger, chat_frame_text, request_file,
};

const HELP: &str = "\
Commands:
  FILE <name>     download a file from the server
  CHAT <message>  send a message to every other client
  HELP            show this menu
  QUIT            disconnect and exit";

/// Prints transfer progress and interleaved chat to the terminal.
struct ConsoleLogger;

impl TransferLogger for ConsoleLogger {
    fn log(&self, entry: TransferLog<'_>) {
        match &entry.event {
            TransferEvent::Progress { done, total } => {
                let pct = if *total == 0 { 100 } else { done * 100 / total };
                print!("\rProgress: {}% ({}/{} bytes)", pct, done, total);
                let _ = std::io::stdout().flush();
                if done == total {
                    println!();
                }
            }
            TransferEvent::ChatInterleaved { text } => println!("[CHAT] {}", text),
            TransferEvent::MetadataReceived { size, .. } => {
                println!("Receiving {} ({} bytes)", entry.file, size)
            }
            event => debug!(file = entry.file, "{}", event),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_client=info,ferry_proto=info".into()),
        )
        .init();

    // Config: positional host/port override the environment.
    let mut args = std::env::args().skip(1);
    let host = args
        .next()
        .or_else(|| std::env::var("FERRY_HOST").ok())
        .unwrap_or_else(|| "127.0.0.1".into());
    let port: u16 = args
        .next()
        .or_else(|| std::env::var("FERRY_PORT").ok())
        .unwrap_or_else(|| "8080".into())
        .parse()
        .context("invalid port")?;
    let download_dir: PathBuf = std::env::var("FERRY_DOWNLOAD_DIR")
        .unwrap_or_else(|_| "./downloads".into())
        .into();

    let downloads = FileRoot::new(download_dir).await?;

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", host, port))?;
    if let Err(e) = socket2::SockRef::from(&stream).set_nodelay(true) {
        warn!("set_nodelay failed: {}", e);
    }
    info!("connected to {}:{}", host, port);
    println!("Connected to {}:{}. Type HELP for commands.", host, port);

    let mut channel = TcpChannel::from_tcp(stream);
    run(&mut channel, &downloads).await?;

    let _ = channel.shutdown().await;
    Ok(())
}

async fn run(channel: &mut TcpChannel, downloads: &FileRoot) -> anyhow::Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = input.next_line() => {
                let Some(line) = line? else {
                    channel.send_line(&Request::Quit.to_line()).await?;
                    return Ok(());
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line.eq_ignore_ascii_case("help") {
                    println!("{}", HELP);
                    continue;
                }

                match Request::from_user_input(line) {
                    Ok(Request::Quit) => {
                        channel.send_line(&Request::Quit.to_line()).await?;
                        println!("Bye.");
                        return Ok(());
                    }
                    Ok(Request::File(name)) => {
                        if !fetch(channel, downloads, &name).await {
                            return Ok(());
                        }
                    }
                    Ok(req @ Request::Chat(_)) => channel.send_line(&req.to_line()).await?,
                    Ok(Request::Unknown(cmd)) => println!("Unknown command {:?}. Type HELP.", cmd),
                    Ok(Request::MissingFilename) => println!("usage: FILE <name>"),
                    Err(e) => println!("{}", e),
                }
            }
            line = channel.recv_line(MAX_LINE_BYTES) => {
                let Some(line) = line? else {
                    println!("Server closed the connection.");
                    return Ok(());
                };
                match chat_frame_text(&line) {
                    Some(text) => println!("[CHAT] {}", text),
                    None => warn!("unexpected line from server: {:?}", line),
                }
            }
        }
    }
}

/// Run one download and report it. Returns false when the connection is
/// no longer usable.
async fn fetch(channel: &mut TcpChannel, downloads: &FileRoot, name: &str) -> bool {
    match request_file(channel, downloads, name, &ConsoleLogger).await {
        Ok(outcome) => {
            match outcome.verify() {
                Ok(()) => println!(
                    "Saved {} (sha256 {} verified)",
                    outcome.path.display(),
                    outcome.actual_checksum
                ),
                Err(e) => println!(
                    "WARNING: {}. The file was kept at {}",
                    e,
                    outcome.path.display()
                ),
            }
            true
        }
        Err(Error::Remote(code)) => {
            println!("Error: {}", code.user_message());
            true
        }
        Err(e @ (Error::InvalidName(_) | Error::Usage(_))) => {
            println!("Error: {}", e);
            true
        }
        Err(e) => {
            println!();
            println!("Transfer of {} failed: {}", name, e);
            println!("The file could not be verified.");
            !e.is_fatal()
        }
    }
}
