use std::time::Duration;

use round_engine::{
    config::RoundConfig,
    dto::message::{Outgoing, PeerMessage},
    error::RoundError,
    services::{
        peer_runtime::{LocalCommand, PeerRuntime},
        relay::{LocalRelay, PeerLink},
    },
    state::{
        clock::TokioClock,
        events::SessionEvent,
        round::{MapType, NextScene, PeerId},
        session::{RoundSession, SessionSetup},
        state_machine::RoundPhase,
    },
};

const STEP: f64 = 0.05;
const ROOM: &str = "arena";

/// Sessions joined through an in-process relay and driven by a manual clock.
struct Table {
    peers: Vec<(RoundSession, PeerLink, f64)>,
    now: f64,
    errors: Vec<(PeerId, RoundError)>,
    events: Vec<(PeerId, SessionEvent)>,
}

impl Table {
    fn new(members: &[u32], connected: &[u32], map_type: MapType, config: RoundConfig) -> Self {
        let relay = LocalRelay::new();
        let members: Vec<PeerId> = members.iter().copied().map(PeerId).collect();
        let peers = connected
            .iter()
            .map(|&id| {
                let link = relay.connect(ROOM, PeerId(id)).unwrap();
                let session = RoundSession::new(SessionSetup {
                    local: PeerId(id),
                    authority: PeerId(1),
                    members: members.clone(),
                    map_type,
                    config: config.clone(),
                });
                (session, link, f64::from(id) * 11.5 - 9.0)
            })
            .collect();
        let mut table = Self {
            peers,
            now: 100.0,
            errors: Vec::new(),
            events: Vec::new(),
        };
        // Drop the join notices.
        for (_, link, _) in &mut table.peers {
            while link.try_recv().is_some() {}
        }
        table
    }

    fn index(&self, id: u32) -> usize {
        self.peers
            .iter()
            .position(|(session, _, _)| session.local() == PeerId(id))
            .unwrap()
    }

    fn local_now(&self, index: usize) -> f64 {
        self.now + self.peers[index].2
    }

    fn with<R>(&mut self, id: u32, f: impl FnOnce(&mut RoundSession, f64) -> R) -> R {
        let index = self.index(id);
        let now = self.local_now(index);
        let out = f(&mut self.peers[index].0, now);
        self.pump();
        out
    }

    fn session(&self, id: u32) -> &RoundSession {
        &self.peers[self.index(id)].0
    }

    fn enter_all(&mut self) {
        for index in 0..self.peers.len() {
            let now = self.local_now(index);
            self.peers[index].0.enter_round(now);
        }
        self.pump();
    }

    fn pump(&mut self) {
        loop {
            let mut moved = false;
            for (session, link, _) in &mut self.peers {
                for outgoing in session.drain_outbox() {
                    link.send(&outgoing).unwrap();
                    moved = true;
                }
            }
            for index in 0..self.peers.len() {
                let now = self.local_now(index);
                let (session, link, _) = &mut self.peers[index];
                while let Some(envelope) = link.try_recv() {
                    moved = true;
                    if let Err(err) = session.handle(envelope, now) {
                        self.errors.push((session.local(), err));
                    }
                }
            }
            for (session, _, _) in &mut self.peers {
                let local = session.local();
                self.events
                    .extend(session.drain_events().into_iter().map(|event| (local, event)));
            }
            if !moved {
                break;
            }
        }
    }

    fn run_for(&mut self, secs: f64) {
        let steps = (secs / STEP).round() as usize;
        for _ in 0..steps {
            self.now += STEP;
            for index in 0..self.peers.len() {
                let now = self.local_now(index);
                let session = &mut self.peers[index].0;
                if let Err(err) = session.tick(now) {
                    self.errors.push((session.local(), err));
                }
            }
            self.pump();
        }
    }

    fn phases(&self) -> Vec<RoundPhase> {
        self.peers.iter().map(|(session, _, _)| session.phase()).collect()
    }

    fn encoded(&self) -> Vec<String> {
        self.peers
            .iter()
            .map(|(session, _, _)| session.store().encode().unwrap())
            .collect()
    }
}

fn manual_config() -> RoundConfig {
    RoundConfig {
        round_duration_secs: None,
        ..RoundConfig::default()
    }
}

fn play_race_round(table: &mut Table, order: [u32; 3], scene: NextScene) {
    table.run_for(2.5);
    assert_eq!(table.phases(), vec![RoundPhase::Active; 3]);
    for id in order {
        table.with(id, |session, now| session.report_finish(PeerId(id), now).unwrap());
    }
    table.run_for(10.5);
    assert_eq!(table.phases(), vec![RoundPhase::Ended; 3]);
    for id in 1..=3 {
        assert_eq!(table.session(id).next_scene(), Some(scene));
    }
}

#[test]
fn three_race_rounds_accumulate_on_every_peer() {
    let mut table = Table::new(&[1, 2, 3], &[1, 2, 3], MapType::Race, manual_config());
    table.enter_all();

    play_race_round(&mut table, [3, 1, 2], NextScene::RoundResult);
    // Replicas ready up first, so the authority has to buffer their notices.
    for id in [3, 2, 1] {
        table.with(id, |session, now| session.begin_next_round(now).unwrap());
    }
    play_race_round(&mut table, [2, 3, 1], NextScene::RoundResult);
    for id in [2, 1, 3] {
        table.with(id, |session, now| session.begin_next_round(now).unwrap());
    }
    play_race_round(&mut table, [3, 2, 1], NextScene::GameResult);

    let store = table.session(2).store();
    assert_eq!(store.ranking(), &[PeerId(3), PeerId(2), PeerId(1)]);
    assert_eq!(store.score(PeerId(3)).map(|record| record.score), Some(12_000));
    assert_eq!(store.score(PeerId(2)).map(|record| record.score), Some(7_500));
    assert_eq!(store.score(PeerId(1)).map(|record| record.score), Some(3_000));

    let encoded = table.encoded();
    assert!(encoded.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(table.session(1).snapshots_produced(), 3);
    assert!(table.errors.is_empty(), "{:?}", table.errors);

    let err = table.with(1, |session, now| session.begin_next_round(now).unwrap_err());
    assert!(matches!(err, RoundError::SessionComplete(3)));
}

#[test]
fn points_round_ranks_by_collected_totals() {
    let mut table = Table::new(&[1, 2, 3], &[1, 2, 3], MapType::Points, manual_config());
    table.enter_all();
    table.run_for(2.5);

    for (id, amount) in [(1, 100), (2, 250), (3, 50), (2, 50), (3, 150)] {
        table.with(id, |session, _| session.report_points(PeerId(id), amount));
    }
    table.with(1, |session, now| session.end_game(now).unwrap());
    table.run_for(10.5);

    let snapshot = table.session(3).store().ranking_snapshot().clone();
    assert_eq!(snapshot.ranking, vec![PeerId(2), PeerId(3), PeerId(1)]);
    assert_eq!(snapshot.score_of(PeerId(2)), Some(5_000));
    assert_eq!(snapshot.score_of(PeerId(3)), Some(2_000));
    assert_eq!(snapshot.score_of(PeerId(1)), Some(500));
    assert!(table.encoded().windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn missing_peer_is_evicted_and_the_round_still_starts() {
    let config = RoundConfig {
        barrier_timeout_secs: Some(1.0),
        ..manual_config()
    };
    let mut table = Table::new(&[1, 2, 3], &[1, 2], MapType::Race, config);
    table.enter_all();
    assert_eq!(table.session(1).phase(), RoundPhase::WaitingForPlayers);

    table.run_for(1.5);
    assert!(table.events.contains(&(
        PeerId(1),
        SessionEvent::PeersEvicted {
            peers: vec![PeerId(3)]
        }
    )));
    assert!(
        !table
            .errors
            .iter()
            .any(|(_, err)| matches!(err, RoundError::BarrierStall { .. }))
    );

    table.run_for(2.5);
    assert_eq!(table.phases(), vec![RoundPhase::Active; 2]);
    assert!(!table.session(1).roster().contains(&PeerId(3)));
}

#[test]
fn replicas_cannot_publish_results() {
    let mut table = Table::new(&[1, 2, 3], &[1, 2, 3], MapType::Race, manual_config());
    table.enter_all();
    table.run_for(2.5);

    let forged = Outgoing::all(PeerMessage::SettlementSnapshot {
        round: 0,
        payload: "{}".into(),
    });
    let index = table.index(2);
    table.peers[index].1.send(&forged).unwrap();
    table.pump();

    assert_eq!(table.session(3).store().applied_count(), 0);
    assert_eq!(table.session(3).phase(), RoundPhase::Active);
    assert!(
        table
            .errors
            .iter()
            .any(|(peer, err)| *peer == PeerId(3)
                && matches!(err, RoundError::UnauthorizedSender { .. }))
    );
}

#[tokio::test]
async fn runtimes_play_two_survivor_rounds() {
    let config = RoundConfig {
        clock_sync_interval_ms: 10,
        round_start_delay_secs: 0.1,
        countdown_begin_delay_secs: 0.1,
        countdown_cadence_secs: 0.05,
        settlement_grace_secs: 0.1,
        teardown_delay_secs: 0.1,
        round_duration_secs: Some(0.4),
        barrier_timeout_secs: None,
        max_rounds: 2,
        ..RoundConfig::default()
    };
    let relay = LocalRelay::new();
    let members = vec![PeerId(1), PeerId(2), PeerId(3)];

    let mut drivers = Vec::new();
    let mut scripts = Vec::new();
    for (peer, skew) in [(PeerId(1), 0.0), (PeerId(2), 25.0), (PeerId(3), -4.0)] {
        let link = relay.connect(ROOM, peer).unwrap();
        let session = RoundSession::new(SessionSetup {
            local: peer,
            authority: PeerId(1),
            members: members.clone(),
            map_type: MapType::Survivor,
            config: config.clone(),
        });
        let (runtime, handle) = PeerRuntime::new(session, link, TokioClock::with_skew(skew));
        let mut runtime = runtime.with_tick(Duration::from_millis(5));

        let mut events = handle.subscribe();
        scripts.push(tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event != (SessionEvent::GameActive { active: true }) {
                    continue;
                }
                let command = match peer.0 {
                    2 => LocalCommand::Finish(peer),
                    3 => LocalCommand::Failure(peer),
                    _ => continue,
                };
                handle.send(command);
            }
        }));
        drivers.push(tokio::spawn(async move {
            let first = runtime.run_round().await.unwrap();
            let second = runtime.run_next_round().await.unwrap();
            (first, second)
        }));
    }

    let mut finals = Vec::new();
    for driver in drivers {
        let (first, second) = driver.await.unwrap();
        assert_eq!(first.next_scene, Some(NextScene::RoundResult));
        assert_eq!(second.next_scene, Some(NextScene::GameResult));
        finals.push(second);
    }
    for script in scripts {
        script.abort();
    }

    assert!(finals.windows(2).all(|pair| pair[0].encoded == pair[1].encoded));
    let snapshot = &finals[0].snapshot;
    assert_eq!(snapshot.round, 1);
    assert_eq!(snapshot.score_of(PeerId(2)), Some(5_000));
    assert_eq!(snapshot.score_of(PeerId(3)), Some(200));
    assert_eq!(snapshot.score_of(PeerId(1)), Some(0));
    assert_eq!(snapshot.ranking, vec![PeerId(2), PeerId(3), PeerId(1)]);
}
