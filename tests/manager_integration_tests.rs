//! End-to-end scenarios for the peer manager
//!
//! These tests drive the public API the way an embedding client would:
//! handshake completions admit peers, wire events arrive per connection,
//! and the pulses run on a hand-driven clock.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use undertow::net::{AddressRange, DialRequest};
use undertow::peer::events::PeerErrorCode;
use undertow::{
    AddressFamily, BlockIndex, BlockSpan, HandshakeOutcome, InfoHash, PeerChannel, PeerEvent,
    PeerIo, PeerListMode, PeerManager, PeerSource, Pex, PexFlags, PieceIndex, PulseDriver,
    SessionClock, Torrent, TorrentBuilder, TorrentEvent, TorrentId, Transport, TransportError,
    UndertowConfig,
};

/// Wire-driver stand-in that records commands.
struct TestChannel {
    peer_is_interested: bool,
    client_is_choked: bool,
    cancels: Arc<Mutex<Vec<BlockIndex>>>,
}

impl TestChannel {
    fn interested() -> Self {
        Self {
            peer_is_interested: true,
            client_is_choked: false,
            cancels: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn quiet() -> Self {
        Self {
            peer_is_interested: false,
            client_is_choked: true,
            cancels: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl PeerChannel for TestChannel {
    fn pulse(&mut self) {}

    fn send_choke(&mut self, _choked: bool) {}

    fn send_interested(&mut self, _interested: bool) {}

    fn send_cancel(&mut self, block: BlockIndex) {
        self.cancels.lock().push(block);
    }

    fn peer_is_interested(&self) -> bool {
        self.peer_is_interested
    }

    fn client_is_choked(&self) -> bool {
        self.client_is_choked
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

/// Transport stand-in that always hands back a socket.
struct TestTransport;

impl Transport for TestTransport {
    fn dial(&mut self, request: DialRequest) -> Result<PeerIo, TransportError> {
        Ok(PeerIo::new_outgoing(request.address, request.use_utp))
    }

    fn open_socket_count(&self) -> usize {
        0
    }

    fn socket_limit(&self) -> usize {
        1024
    }
}

fn manager_with(config: UndertowConfig) -> (PeerManager, SessionClock) {
    let clock = SessionClock::manual(1_000_000_000);
    let manager = PeerManager::new(config, clock.clone(), Box::new(TestTransport));
    (manager, clock)
}

fn test_manager() -> (PeerManager, SessionClock) {
    manager_with(UndertowConfig::for_testing())
}

fn running_torrent(manager: &mut PeerManager, seed: u8, total_size: u64) -> TorrentId {
    let id = manager.add_torrent(
        TorrentBuilder::new(InfoHash::new([seed; 20]), total_size, 32 * 1024).peer_limit(40),
    );
    manager.torrent_event(id, TorrentEvent::Started);
    id
}

fn info_hash_of(manager: &PeerManager, id: TorrentId) -> InfoHash {
    manager.torrent(id).map(Torrent::info_hash).unwrap()
}

/// Admits an outgoing peer through the pool + handshake path.
fn admit_outgoing(
    manager: &mut PeerManager,
    id: TorrentId,
    addr: &str,
    channel: TestChannel,
) -> SocketAddr {
    let socket_address: SocketAddr = addr.parse().unwrap();
    manager.add_pex(
        id,
        PeerSource::Tracker,
        &[Pex::new(
            socket_address.ip(),
            socket_address.port(),
            PexFlags::default(),
        )],
    );
    let admitted = manager.handshake_done(
        HandshakeOutcome {
            ok: true,
            read_anything: true,
            is_incoming: false,
            is_utp: false,
            peer_id: Some(*b"-TR4050-abcdefghij12"),
            socket_address,
            info_hash: info_hash_of(manager, id),
        },
        Some(Box::new(channel)),
    );
    assert!(admitted, "outgoing peer should be admitted");
    socket_address
}

/// Admits an incoming peer through the handshake path.
fn admit_incoming(
    manager: &mut PeerManager,
    id: TorrentId,
    addr: &str,
    channel: TestChannel,
) -> SocketAddr {
    let socket_address: SocketAddr = addr.parse().unwrap();
    manager.add_incoming(PeerIo::new_incoming(socket_address, false));
    let admitted = manager.handshake_done(
        HandshakeOutcome {
            ok: true,
            read_anything: true,
            is_incoming: true,
            is_utp: false,
            peer_id: Some(*b"-qB4630-abcdefghij12"),
            socket_address,
            info_hash: info_hash_of(manager, id),
        },
        Some(Box::new(channel)),
    );
    assert!(admitted, "incoming peer should be admitted");
    socket_address
}

#[test]
fn test_incoming_listen_port_discovery() {
    let (mut manager, _clock) = test_manager();
    let id = running_torrent(&mut manager, 1, 128 * 1024);

    let socket_address = admit_incoming(&mut manager, id, "1.2.3.4:50000", TestChannel::quiet());
    assert_eq!(manager.swarm(id).unwrap().incoming_count(), 1);
    assert_eq!(manager.swarm(id).unwrap().connectable_count(), 0);

    manager.peer_event(id, socket_address, PeerEvent::GotPort { port: 6881 });

    let swarm = manager.swarm(id).unwrap();
    assert_eq!(swarm.incoming_count(), 0);
    assert_eq!(swarm.connectable_count(), 1);

    let info = swarm
        .existing_peer_info("1.2.3.4:6881".parse().unwrap())
        .expect("record migrated under its listen address");
    assert_eq!(info.read().listen_port(), Some(6881));
    assert_eq!(info.read().is_connectable(), Some(true));
    assert!(info.read().is_connected());

    // the peer is in use, so the interesting listing includes it
    let peers = manager.get_peers(id, AddressFamily::V4, PeerListMode::Interesting, 10);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].socket_address(), "1.2.3.4:6881".parse().unwrap());
}

#[test]
fn test_duplicate_via_port_keeps_more_recent_peer() {
    let (mut manager, clock) = test_manager();
    let id = running_torrent(&mut manager, 1, 128 * 1024);

    // resident peer, connected under its listen address, with old history
    let resident = admit_outgoing(&mut manager, id, "1.2.3.4:6881", TestChannel::quiet());
    manager.peer_event(id, resident, PeerEvent::GotPieceData { length: 1024 });
    {
        let info = manager
            .swarm(id)
            .unwrap()
            .existing_peer_info(resident)
            .unwrap();
        let mut record = info.write();
        record.on_connection_failed();
        record.on_connection_failed();
    }

    // newcomer from the same host, more recently useful
    clock.advance_secs(100);
    let newcomer = admit_incoming(&mut manager, id, "1.2.3.4:50000", TestChannel::quiet());
    manager.peer_event(id, newcomer, PeerEvent::GotPieceData { length: 1024 });

    manager.peer_event(id, newcomer, PeerEvent::GotPort { port: 6881 });

    let swarm = manager.swarm(id).unwrap();
    assert_eq!(swarm.graveyard_count(), 1);
    assert_eq!(swarm.incoming_count(), 0);
    assert_eq!(swarm.connectable_count(), 1);

    // the winner absorbed the loser's counters
    let info = swarm.existing_peer_info(resident).unwrap();
    assert_eq!(info.read().connection_failure_count(), 2);
    assert_eq!(info.read().latest_piece_data_time(), 1_000_100);

    // the loser's connection goes at the next reconnect pulse
    assert_eq!(manager.connected_peer_count(), 2);
    manager.reconnect_pulse();
    assert_eq!(manager.connected_peer_count(), 1);
    assert_eq!(manager.swarm(id).unwrap().graveyard_count(), 0);
}

#[test]
fn test_stale_request_cancelled_after_ttl() {
    let (mut manager, clock) = test_manager();
    let id = running_torrent(&mut manager, 1, 128 * 1024);
    let channel = TestChannel::quiet();
    let cancels = channel.cancels.clone();
    let socket_address = admit_outgoing(&mut manager, id, "10.0.0.1:6881", channel);
    manager.peer_event(id, socket_address, PeerEvent::GotHaveAll);

    let transfer = manager
        .swarm(id)
        .unwrap()
        .transfer_for_address(socket_address)
        .unwrap();
    let spans = manager.get_next_requests(id, transfer, 1);
    assert_eq!(spans.len(), 1);
    let block = spans[0].begin;
    manager.client_sent_requests(id, transfer, spans[0]);
    assert!(manager.did_peer_request(id, transfer, block));

    // nothing happens before the TTL
    clock.advance_secs(89);
    manager.refill_upkeep();
    assert_eq!(manager.count_active_requests_to_peer(id, transfer), 1);

    // at 90 seconds the request is dropped and a Cancel goes out
    clock.advance_secs(1);
    manager.refill_upkeep();
    assert_eq!(manager.count_active_requests_to_peer(id, transfer), 0);
    assert_eq!(cancels.lock().as_slice(), &[block]);

    let stats = manager.peer_stats(id);
    assert_eq!(stats[0].cancels_to_peer, 1);
}

#[test]
fn test_rechoke_caps_interested_unchokes() {
    let mut config = UndertowConfig::for_testing();
    config.peers.upload_slots_per_torrent = 4;
    let (mut manager, _clock) = manager_with(config);
    let id = running_torrent(&mut manager, 1, 128 * 1024);

    for host in 1..=20u8 {
        let socket_address = admit_outgoing(
            &mut manager,
            id,
            &format!("10.0.0.{host}:6881"),
            TestChannel::interested(),
        );
        manager.peer_event(
            id,
            socket_address,
            PeerEvent::GotPieceData {
                length: u32::from(host) * 1024,
            },
        );
    }

    manager.rechoke_pulse();

    let open: Vec<String> = manager
        .peer_stats(id)
        .into_iter()
        .filter(|stat| !stat.peer_is_choked && stat.peer_is_interested)
        .map(|stat| stat.address)
        .collect();
    assert!(
        (4..=5).contains(&open.len()),
        "expected 4 slots (+1 optimistic), got {}",
        open.len()
    );

    // the fastest peers hold the regular slots
    for host in 17..=20u8 {
        let address = format!("10.0.0.{host}:6881");
        assert!(open.contains(&address), "{address} should be unchoked");
    }
}

#[test]
fn test_bad_piece_contributions_ban_and_disconnect() {
    let (mut manager, _clock) = test_manager();
    let id = running_torrent(&mut manager, 1, 256 * 1024);
    let socket_address = admit_outgoing(&mut manager, id, "10.0.0.1:6881", TestChannel::quiet());

    for piece in 0..5u32 {
        manager.peer_event(
            id,
            socket_address,
            PeerEvent::GotBlock {
                piece: PieceIndex(piece),
                offset: 0,
            },
        );
        manager.torrent_event(id, TorrentEvent::GotBadPiece(PieceIndex(piece)));
    }

    // banned and disconnected by the next reconnect pulse
    manager.reconnect_pulse();
    assert_eq!(manager.connected_peer_count(), 0);

    // a banned peer cannot come back
    let readmitted = manager.handshake_done(
        HandshakeOutcome {
            ok: true,
            read_anything: true,
            is_incoming: false,
            is_utp: false,
            peer_id: None,
            socket_address,
            info_hash: info_hash_of(&manager, id),
        },
        Some(Box::new(TestChannel::quiet())),
    );
    assert!(!readmitted);
}

#[test]
fn test_blocklist_refresh_excludes_pool_entry() {
    let (mut manager, _clock) = test_manager();
    let id = running_torrent(&mut manager, 1, 128 * 1024);
    manager.add_pex(
        id,
        PeerSource::Tracker,
        &[Pex::new("10.0.0.5".parse().unwrap(), 6881, PexFlags::default())],
    );

    let before = manager.get_peers(id, AddressFamily::V4, PeerListMode::Interesting, 10);
    assert_eq!(before.len(), 1);

    manager.add_blocklist_range(AddressRange::new(
        "10.0.0.5".parse().unwrap(),
        "10.0.0.5".parse().unwrap(),
    ));

    let after = manager.get_peers(id, AddressFamily::V4, PeerListMode::Interesting, 10);
    assert!(after.is_empty());
}

#[test]
fn test_dial_budget_per_pulse() {
    let (mut manager, _clock) = test_manager();
    let id = running_torrent(&mut manager, 1, 128 * 1024);

    for host in 1..=12u8 {
        manager.add_pex(
            id,
            PeerSource::Tracker,
            &[Pex::new(
                format!("10.0.0.{host}").parse().unwrap(),
                6881,
                PexFlags::default(),
            )],
        );
    }

    manager.bandwidth_pulse();
    assert_eq!(manager.swarm(id).unwrap().outgoing_handshake_count(), 9);

    manager.bandwidth_pulse();
    assert_eq!(manager.swarm(id).unwrap().outgoing_handshake_count(), 12);
}

#[test]
fn test_endgame_tracks_outstanding_requests() {
    let (mut manager, _clock) = test_manager();
    let id = running_torrent(&mut manager, 1, 128 * 1024);
    let socket_address = admit_outgoing(&mut manager, id, "10.0.0.1:6881", TestChannel::quiet());
    manager.peer_event(id, socket_address, PeerEvent::GotHaveAll);

    let transfer = manager
        .swarm(id)
        .unwrap()
        .transfer_for_address(socket_address)
        .unwrap();
    let spans = manager.get_next_requests(id, transfer, 8);
    let requested: u64 = spans.iter().map(BlockSpan::len).sum();
    assert_eq!(requested, 8);
    for span in &spans {
        manager.client_sent_requests(id, transfer, *span);
    }

    // asking again recomputes the endgame flag
    let _ = manager.get_next_requests(id, transfer, 1);
    assert!(manager.swarm(id).unwrap().is_endgame());
}

#[test]
fn test_protocol_fault_disconnects_at_reconnect() {
    let (mut manager, _clock) = test_manager();
    let id = running_torrent(&mut manager, 1, 128 * 1024);
    let socket_address = admit_outgoing(&mut manager, id, "10.0.0.1:6881", TestChannel::quiet());

    manager.peer_event(id, socket_address, PeerEvent::Error(PeerErrorCode::MessageTooBig));
    assert_eq!(manager.connected_peer_count(), 1);

    manager.reconnect_pulse();
    assert_eq!(manager.connected_peer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pulse_driver_runs_pulses() {
    let (manager, _clock) = test_manager();
    let manager = Arc::new(tokio::sync::Mutex::new(manager));

    let driver = PulseDriver::spawn(manager.clone());

    // paused tokio time auto-advances through the timers
    tokio::time::sleep(std::time::Duration::from_secs(30)).await;

    // the manager is alive and lockable after many pulses
    let guard = manager.lock().await;
    assert_eq!(guard.connected_peer_count(), 0);
    drop(guard);

    driver.shutdown();
}
