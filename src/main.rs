use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use rtc_call::media::Str0mBackend;
use rtc_call::{util, CallConfig, CallEvent, ClientId, RelayConfig, RelayServer};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    util::init_log();

    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "relay" => relay(args.get(2)).await,
            "peer" => match args.get(2) {
                Some(local) => peer(local, args.get(3)).await,
                None => {
                    print_usage();
                    Ok(())
                }
            },
            _ => {
                print_usage();
                Ok(())
            }
        }
    } else {
        print_usage();
        Ok(())
    }
}

async fn relay(bind: Option<&String>) -> anyhow::Result<()> {
    let mut config = RelayConfig::from_env()?;
    if let Some(bind) = bind {
        config.bind = bind.parse().with_context(|| format!("invalid bind address '{}'", bind))?;
    }

    let server = RelayServer::bind(&config).await?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Stopping relay"),
    }
    Ok(())
}

async fn peer(local: &str, remote: Option<&String>) -> anyhow::Result<()> {
    let config = CallConfig::from_env()?;
    let local_id: ClientId = local.parse()?;
    let remote_id = remote.map(|r| r.parse::<ClientId>()).transpose()?;

    info!("Starting peer {} via {}", local_id, config.transport.relay_url);
    let (handle, _task) = rtc_call::connect(config, local_id, Arc::new(Str0mBackend::default()))?;
    let mut events = handle.subscribe();

    let mut dialed = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => break,
        };

        match event {
            Ok(CallEvent::TransportOpened) => {
                info!("Relay channel open");
                if let (Some(remote), false) = (&remote_id, dialed) {
                    dialed = true;
                    if let Err(e) = handle.call(remote.clone()).await {
                        error!("Call to {} failed: {}", remote, e);
                    }
                }
            }
            Ok(CallEvent::ReconnectExhausted { attempts }) => {
                handle.shutdown();
                bail!("relay unreachable after {} reconnect attempts", attempts);
            }
            Ok(event) => info!("{:?}", event),
            Err(RecvError::Lagged(n)) => warn!("Missed {} call events", n),
            Err(RecvError::Closed) => break,
        }
    }

    info!("Hanging up");
    handle.shutdown();
    Ok(())
}

fn print_usage() {
    println!("RTC Call");
    println!("Usage:");
    println!("  rtc-call relay [bind]               - Start the signaling relay");
    println!("  rtc-call peer <local-id> [remote-id] - Connect, and call remote-id if given");
}
