use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use wust_engine::{
    Router, ServerConfig, WebSocketServer,
    server::{Request, Response},
};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1")]
    addr: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 9001)]
    port: u16,

    /// Seconds between keepalive pings, 0 disables them
    #[arg(short, long, default_value_t = 30)]
    keepalive_secs: u64,

    /// Upgrade worker threads
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
}

fn main() -> wust_engine::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("wust_engine=info".parse().unwrap()),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let keepalive = (args.keepalive_secs > 0).then(|| Duration::from_secs(args.keepalive_secs));
    let config = ServerConfig::default()
        .with_keepalive(keepalive)
        .with_upgrade_workers(args.workers);

    let router = Router::new()
        .get("/ping", |_| Response::ok("pong"))
        .post("/echo", |req: &Request<'_>| Response::ok(req.body));

    WebSocketServer::bind((args.addr.as_str(), args.port), config)?
        .router(router)
        .on_binary(|id, bytes| {
            let l = bytes.len().min(10);
            println!("[{id}] got message B {} {:?}", bytes.len(), &bytes[..l]);
            Some(bytes.to_vec())
        })
        .on_remove(|id, reason| println!("[{id}] client closed: {reason:?}"))
        .run()
}
