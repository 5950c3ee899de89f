use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use mesh_core::telemetry::logging::{self, LogConfig, LogLevel};
use mesh_core::transport::loopback::LoopbackNetwork;
use mesh_core::{DataChannel, MeshConfig, MeshEvent, Payload, TransportMode};
use relay_bus::LocalRelay;
use tokio::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "mesh", about = "Run an in-process peer mesh over a local relay")]
struct Cli {
    #[arg(long, short = 'n', default_value_t = 3, help = "Number of participants")]
    participants: usize,

    #[arg(long, short = 'm', default_value = "hello world")]
    message: String,

    #[arg(long, value_enum, help = "Overrides MESH_TRANSPORT and the other MESH_* defaults")]
    transport: Option<TransportMode>,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long, default_value = "mesh-lobby")]
    channel: String,

    #[arg(long, help = "End the room when the broadcaster leaves")]
    close_entire_session: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

async fn wait_for(what: &str, limit: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let give_up = Instant::now() + limit;
    while !check() {
        if Instant::now() > give_up {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

fn describe(payload: &Payload) -> String {
    match payload {
        Payload::Text(text) => text.clone(),
        Payload::Object(value) => value.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    if cli.participants < 2 {
        bail!("a mesh needs at least two participants");
    }

    let mut config = match cli.transport {
        Some(mode) => MeshConfig::for_mode(mode),
        None => MeshConfig::from_env(),
    };
    if let Some(chunk_size) = cli.chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    if cli.close_entire_session {
        config = config.with_auto_close_entire_session(true);
    }
    let limit = Duration::from_secs(cli.timeout_secs);

    let relay = Arc::new(LocalRelay::new());
    let network = Arc::new(LoopbackNetwork::new());
    let mut members = Vec::with_capacity(cli.participants);
    for idx in 0..cli.participants {
        let name = format!("peer-{idx}");
        let member = DataChannel::new(
            &cli.channel,
            Some(name.as_str()),
            relay.clone(),
            network.clone(),
            config.clone(),
        )
        .with_context(|| format!("failed to create {name}"))?;
        if let Some(mut events) = member.events() {
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        MeshEvent::Message {
                            user_token,
                            payload,
                            latency,
                        } => println!(
                            "{name} <- {user_token}: {} ({} ms)",
                            describe(&payload),
                            latency.as_millis()
                        ),
                        MeshEvent::Opened { user_token } => println!("{name}: link to {user_token} open"),
                        MeshEvent::Left { user_token } => println!("{name}: {user_token} left"),
                        MeshEvent::Error { user_token, error } => {
                            eprintln!("{name}: error from {user_token:?}: {error}")
                        }
                        _ => {}
                    }
                }
            });
        }
        members.push(member);
    }

    let room = members[0].open(None)?;
    println!("peer-0 opened room {room}");
    let expected = cli.participants - 1;
    for (idx, member) in members.iter().enumerate().skip(1) {
        member.connect()?;
        wait_for(&format!("peer-{idx} to join"), limit, || {
            !member.peers().is_empty()
        })
        .await?;
    }
    wait_for("full mesh", limit, || {
        members.iter().all(|member| member.peers().len() == expected)
    })
    .await?;
    println!("mesh of {} participants is open", cli.participants);

    let chunks = members[0].send(cli.message.as_str()).await?;
    println!("peer-0 sent {} bytes in {chunks} chunk(s)", cli.message.len());
    tokio::time::sleep(config.chunk_interval + Duration::from_millis(200)).await;

    members[0].leave()?;
    let give_up = Instant::now() + limit;
    loop {
        let mut successor = None;
        for member in members.iter().skip(1) {
            if member.status().await?.is_broadcaster {
                successor = Some(member.user_token().to_string());
            }
        }
        match successor {
            Some(successor) if !cli.close_entire_session => {
                println!("{successor} took over room {room}");
                break;
            }
            None if cli.close_entire_session => {
                wait_for("room teardown", limit, || {
                    members.iter().all(|member| member.peers().is_empty())
                })
                .await?;
                println!("room {room} closed");
                break;
            }
            _ if Instant::now() > give_up => bail!("timed out waiting for broadcaster handoff"),
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }

    drop(members);
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
