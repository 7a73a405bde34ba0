//! Plays a full multi-round session between in-process peers with skewed
//! clocks and logs what each peer ends up with.
//!
//! Usage: `round-sim [peers] [race|points|survivor]`.

use std::{env, time::Duration};

use anyhow::{Context, bail};
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use round_engine::{
    config::AppConfig,
    services::{
        peer_runtime::{LocalCommand, PeerRuntime, RoundOutcome, RuntimeHandle},
        relay::LocalRelay,
    },
    state::{
        clock::TokioClock,
        events::SessionEvent,
        round::{MapType, PeerId},
        session::{RoundSession, SessionSetup},
    },
};

const ROOM: &str = "sim";
const DEFAULT_PEERS: u32 = 4;
/// Authority ends the round this long after it goes active.
const PLAY_TIME: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = env::args().skip(1);
    let peers = match args.next() {
        Some(raw) => raw.parse::<u32>().context("peer count must be a number")?,
        None => DEFAULT_PEERS,
    };
    if peers == 0 {
        bail!("at least one peer is required");
    }
    let map_type = match args.next().as_deref() {
        None | Some("race") => MapType::Race,
        Some("points") => MapType::Points,
        Some("survivor") => MapType::Survivor,
        Some(other) => bail!("unknown map type `{other}`"),
    };

    let config = AppConfig::load().round;
    let max_rounds = config.max_rounds;
    let members: Vec<PeerId> = (1..=peers).map(PeerId).collect();
    let relay = LocalRelay::new();
    info!(peers, ?map_type, max_rounds, "starting simulation");

    let mut drivers = Vec::new();
    let mut scripts = Vec::new();
    for &peer in &members {
        let link = relay
            .connect(ROOM, peer)
            .with_context(|| format!("connecting {peer}"))?;
        let session = RoundSession::new(SessionSetup {
            local: peer,
            authority: members[0],
            members: members.clone(),
            map_type,
            config: config.clone(),
        });
        // Spread clocks apart so synchronization has something to do.
        let skew = f64::from(peer.0 - 1) * 13.75 - 20.0;
        let (runtime, handle) = PeerRuntime::new(session, link, TokioClock::with_skew(skew));
        scripts.push(spawn_gameplay(peer, peer == members[0], map_type, handle));
        drivers.push(tokio::spawn(play_session(runtime, max_rounds)));
    }

    let mut finals = Vec::new();
    for driver in drivers {
        let outcomes = driver.await.context("peer task panicked")?;
        if let Some(last) = outcomes.last() {
            finals.push(last.clone());
        }
    }
    for script in scripts {
        script.abort();
    }

    for outcome in &finals {
        info!(
            peer = %outcome.peer,
            round = outcome.round,
            scene = ?outcome.next_scene,
            ranking = ?outcome.snapshot.ranking,
            "final standings"
        );
    }
    let converged = finals
        .windows(2)
        .all(|pair| pair[0].encoded == pair[1].encoded);
    if !converged || finals.len() != members.len() {
        bail!("peers did not converge on the same standings");
    }
    if let Some(first) = finals.first() {
        println!("{}", first.encoded);
    }
    Ok(())
}

/// Run up to `max_rounds` rounds, stopping at the first failure.
async fn play_session(mut runtime: PeerRuntime<TokioClock>, max_rounds: u32) -> Vec<RoundOutcome> {
    let peer = runtime.session().local();
    let mut outcomes = Vec::new();
    for round in 0..max_rounds {
        let result = if round == 0 {
            runtime.run_round().await
        } else {
            runtime.run_next_round().await
        };
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => {
                warn!(%peer, round, error = %err, "session stopped");
                break;
            }
        }
    }
    outcomes
}

/// Scripted stand-in for stage logic: reacts to the round going active.
fn spawn_gameplay(
    peer: PeerId,
    is_authority: bool,
    map_type: MapType,
    handle: RuntimeHandle,
) -> JoinHandle<()> {
    let mut events = BroadcastStream::new(handle.subscribe());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let Ok(SessionEvent::GameActive { active: true }) = event else {
                continue;
            };
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250 * u64::from(peer.0))).await;
                let command = match map_type {
                    MapType::Race => LocalCommand::Finish(peer),
                    MapType::Points => LocalCommand::Points(peer, 100 * (peer.0 % 3 + 1)),
                    MapType::Survivor if peer.0 % 2 == 1 => LocalCommand::Finish(peer),
                    MapType::Survivor => LocalCommand::Failure(peer),
                };
                handle.send(command);
                if is_authority {
                    tokio::time::sleep(PLAY_TIME).await;
                    handle.send(LocalCommand::EndGame);
                }
            });
        }
    })
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
