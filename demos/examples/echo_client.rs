use clap::Parser;
use log::{info, warn};
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hawser::{Channel, ChannelOption, Handler, HandlerContext, TypedHandler, TypedInbound};
use hawser_bootstrap::Bootstrap;
use hawser_codec::{ByteToMessageDecoder, LineFramer, StringCodec};
use hawser_executor::ReactorGroup;

////////////////////////////////////////////////////////////////////////////////////////////////////
struct EchoHandler;

impl TypedHandler for EchoHandler {
    type Msg = String;

    fn message_received(&mut self, ctx: &HandlerContext, msg: &mut String) {
        info!(
            "received: {} from {:?}",
            msg,
            ctx.channel().peer_addr()
        );
    }
}

#[derive(Parser)]
#[command(name = "Echo Client TCP")]
#[command(version = "0.1.0")]
#[command(about = "An example of a line-oriented echo client", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("127.0.0.1"))]
    host: String,
    #[arg(long, default_value_t = 6000)]
    port: u16,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let host = cli.host;
    let port = cli.port;
    let log_level = log::LevelFilter::from_str(&cli.log_level)?;
    if cli.debug {
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, log_level)
            .init();
    }

    info!("Connecting {}:{}...", host, port);

    let group = Arc::new(ReactorGroup::with_threads(1)?);

    let channel = Bootstrap::new()
        .group(Arc::clone(&group))
        .option(ChannelOption::ConnectTimeoutMillis(5_000))
        .handler(|ch: &Channel| {
            let pipeline = ch.pipeline();
            pipeline.add_last(
                "framer",
                Handler::inbound(ByteToMessageDecoder::new(Box::new(LineFramer::new(
                    8192, true,
                )))),
            )?;
            pipeline.add_last("strings", Handler::duplex(StringCodec::new()))?;
            pipeline.add_last("echo", Handler::inbound(TypedInbound::new(EchoHandler)))?;
            Ok(())
        })
        .connect(&format!("{}:{}", host, port))
        .sync()
        .map_err(|cause| anyhow::anyhow!("connect failed: {}", cause))?;

    info!("Enter bye to stop");
    let mut buffer = String::new();
    while std::io::stdin().read_line(&mut buffer).is_ok() {
        let line = buffer.trim_end().to_owned();
        if line.is_empty() {
            break;
        }
        let write = channel.write_and_flush(Box::new(format!("{}\n", line)));
        write.add_listener(|future| {
            if let Some(cause) = future.cause() {
                warn!("write failed: {}", cause);
            }
        });
        if line == "bye" {
            break;
        }
        buffer.clear();
    }

    channel.close().sync().ok();
    group
        .shutdown_gracefully(Duration::from_millis(100), Duration::from_secs(5))
        .sync()
        .map_err(|cause| anyhow::anyhow!("shutdown failed: {}", cause))?;

    Ok(())
}
