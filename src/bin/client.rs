use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use wust_engine::{ChannelHandler, ClientConfig, Event, WebSocketClient};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Server url, ws:// or wss://
    #[arg(short, long, default_value = "ws://127.0.0.1:9001/")]
    url: String,

    /// Text to send, routed by the server as `METHOD /path\nbody`
    #[arg(short, long, default_value = "POST /echo\nhello")]
    message: String,

    /// How many times to send it
    #[arg(short, long, default_value_t = 1)]
    count: usize,
}

#[tokio::main]
async fn main() -> wust_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("wust_engine=info".parse().unwrap()),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let (tx, mut rx) = mpsc::channel(64);
    let ws = WebSocketClient::open(&args.url, ClientConfig::default(), ChannelHandler::new(tx)).await?;

    for _ in 0..args.count {
        ws.send_text(&args.message).await?;
    }
    ws.ping().await?;

    // one reply per message, plus the pong
    let mut pending = args.count + 1;
    while pending > 0 {
        let Some(event) = rx.recv().await else { break };
        match event {
            Event::Message(m) => {
                println!("CLI MESSAGE: {:?}", m.as_str().unwrap_or("<binary>"));
                pending -= 1;
            }
            Event::Pong(latency) => {
                println!("CLI PONG: {latency:?}ms");
                pending -= 1;
            }
            Event::Error(e) => println!("CLI ERR: {e}"),
            Event::Closed(reason) => {
                println!("CLI connection closed: {reason:?}");
                return Ok(());
            }
        }
    }

    ws.close().await?;
    Ok(())
}
