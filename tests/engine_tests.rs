//! Integration tests for gosh-reactor
//!
//! These tests drive the engine over real loopback sockets with a fake
//! resolver, covering connection establishment, address fallback, backup
//! connection races, TLS, group admission and mirror exhaustion.


use gosh_reactor::resolver::AddressFamily;
use gosh_reactor::{
    AddressFamilies, Clock, ConnectCommand, ConnectTarget, Connection, ConnectionConsumer,
    DownloadEngine, DownloadGroup, EngineConfig, EngineError, GroupId, ManualClock, Result, ResultCode,
    SchedulerHandle, Task, TlsContext, TlsSession,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use test_helpers::*;

const IPV4_ONLY: AddressFamilies = AddressFamilies {
    ipv4: true,
    ipv6: false,
};

fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A loopback port nothing listens on
fn closed_port() -> u16 {
    let (listener, port) = listener();
    drop(listener);
    port
}

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

// =============================================================================
// Connection Establishment Tests
// =============================================================================

#[test]
fn test_connect_resolves_and_connects() {
    init_tracing();
    let (_listener, port) = listener();
    let resolver = Arc::new(StaticResolver::new().with_host("mirror.test", &["127.0.0.1"]));
    let dialer = CountingDialer::new();
    let config = EngineConfig::default();
    let mut engine = DownloadEngine::builder(config.clone())
        .resolver(resolver.clone())
        .dialer(dialer.clone())
        .families(IPV4_ONLY)
        .build()
        .unwrap();

    let (consumer, outcome) = RecordingConsumer::new();
    engine.schedule(Box::new(ConnectCommand::new(
        ConnectTarget::new("mirror.test", port),
        None,
        consumer,
        &config,
    )));
    engine.run().unwrap();

    match outcome.lock().take() {
        Some(Outcome::Connected {
            peer,
            via_backup,
            tls,
        }) => {
            assert_eq!(peer, localhost(port));
            assert!(!via_backup);
            assert!(!tls);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(dialer.dialed(), vec![localhost(port)]);
    assert_eq!(engine.num_tasks(), 0);
}

#[test]
fn test_refused_address_is_marked_bad_and_skipped() {
    init_tracing();
    let (_listener, port) = listener();
    // 127.0.0.2 is loopback too, but nothing listens there
    let resolver = Arc::new(
        StaticResolver::new().with_host("mirror.test", &["127.0.0.2", "127.0.0.1"]),
    );
    let dialer = CountingDialer::new();
    let config = EngineConfig::default();
    let mut engine = DownloadEngine::builder(config.clone())
        .resolver(resolver)
        .dialer(dialer.clone())
        .families(IPV4_ONLY)
        .build()
        .unwrap();

    let (consumer, outcome) = RecordingConsumer::new();
    engine.schedule(Box::new(ConnectCommand::new(
        ConnectTarget::new("mirror.test", port),
        None,
        consumer,
        &config,
    )));
    engine.run().unwrap();

    assert!(matches!(
        outcome.lock().take(),
        Some(Outcome::Connected { peer, .. }) if peer == localhost(port)
    ));
    let bad: IpAddr = "127.0.0.2".parse().unwrap();
    assert_eq!(
        dialer.dialed(),
        vec![SocketAddr::new(bad, port), localhost(port)]
    );
    let now = engine.handle().now();
    assert!(engine
        .handle_mut()
        .dns_cache()
        .is_bad("mirror.test", bad, port, now));
}

#[test]
fn test_ipv6_disabled_resolves_over_ipv4_only() {
    init_tracing();
    let (_listener, port) = listener();
    let resolver = Arc::new(StaticResolver::new().with_host("example.test", &["::1", "127.0.0.1"]));
    let config = EngineConfig::default().disable_ipv6(true);
    let families = AddressFamilies::probe(&config.network);
    assert!(!families.ipv6);

    let mut engine = DownloadEngine::builder(config.clone())
        .resolver(resolver.clone())
        .families(families)
        .build()
        .unwrap();
    let (consumer, outcome) = RecordingConsumer::new();
    engine.schedule(Box::new(ConnectCommand::new(
        ConnectTarget::new("example.test", port),
        None,
        consumer,
        &config,
    )));
    engine.run().unwrap();

    assert!(matches!(
        outcome.lock().take(),
        Some(Outcome::Connected { peer, .. }) if peer == localhost(port)
    ));
    let lookups = resolver.lookups();
    assert!(!lookups.is_empty());
    assert!(lookups
        .iter()
        .all(|(host, family)| host == "example.test" && *family == AddressFamily::Ipv4));
}

#[test]
fn test_unknown_host_reports_name_resolution_error() {
    init_tracing();
    let config = EngineConfig::default();
    let mut engine = DownloadEngine::builder(config.clone())
        .resolver(Arc::new(StaticResolver::new()))
        .families(AddressFamilies::all())
        .build()
        .unwrap();

    let (consumer, outcome) = RecordingConsumer::new();
    engine.schedule(Box::new(ConnectCommand::new(
        ConnectTarget::new("nowhere.test", 80),
        None,
        consumer,
        &config,
    )));
    engine.run().unwrap();

    match outcome.lock().take() {
        Some(Outcome::Failed(EngineError::NameResolution { hostname, .. })) => {
            assert_eq!(hostname, "nowhere.test");
        }
        other => panic!("unexpected outcome: {:?}", other),
    };
}

#[test]
fn test_primary_connecting_within_delay_never_dials_backup() {
    init_tracing();
    let (_listener, port) = listener();
    let dialer = CountingDialer::new();
    let clock = ManualClock::new();
    let config = EngineConfig::default().backup_connect_delay_ms(300);
    let mut engine = DownloadEngine::builder(config.clone())
        .dialer(dialer.clone())
        .clock(Arc::new(clock.clone()))
        .families(AddressFamilies::all())
        .build()
        .unwrap();

    // both families known up front; time stands still so the backup is
    // never due
    let v4: IpAddr = "127.0.0.1".parse().unwrap();
    let v6: IpAddr = "::1".parse().unwrap();
    engine
        .handle_mut()
        .dns_cache()
        .put_all("dual.test", &[v4, v6], port);

    let (consumer, outcome) = RecordingConsumer::new();
    engine.schedule(Box::new(ConnectCommand::new(
        ConnectTarget::new("dual.test", port),
        None,
        consumer,
        &config,
    )));
    engine.run().unwrap();

    assert!(matches!(
        outcome.lock().take(),
        Some(Outcome::Connected { via_backup: false, .. })
    ));
    assert_eq!(dialer.dialed(), vec![localhost(port)]);
    assert!(clock.elapsed() < std::time::Duration::from_millis(300));
}

const RACE_HOST: &str = "race.test";

fn race_v6(port: u16) -> SocketAddr {
    SocketAddr::new("::1".parse().unwrap(), port)
}

/// Engine whose DNS cache lists `::1` before `127.0.0.1` for the race host,
/// so the primary dials IPv6 and the backup IPv4
fn race_engine(
    config: &EngineConfig,
    clock: &ManualClock,
    dialer: Arc<HeldDialer>,
    port: u16,
) -> DownloadEngine {
    let mut engine = DownloadEngine::builder(config.clone())
        .dialer(dialer)
        .clock(Arc::new(clock.clone()))
        .families(AddressFamilies::all())
        .build()
        .unwrap();
    let addrs = [race_v6(port).ip(), localhost(port).ip()];
    engine.handle_mut().dns_cache().put_all(RACE_HOST, &addrs, port);
    engine
}

fn tick(engine: &mut DownloadEngine) {
    engine.set_no_wait();
    engine.run_once().unwrap();
}

/// Tick until `done` holds, giving loopback connects time to complete
fn tick_until(engine: &mut DownloadEngine, mut done: impl FnMut(&mut DownloadEngine) -> bool) -> bool {
    for _ in 0..500 {
        if done(engine) {
            return true;
        }
        tick(engine);
        thread::sleep(Duration::from_millis(2));
    }
    done(engine)
}

fn accept_n(listener: &TcpListener, n: usize) -> Vec<std::net::TcpStream> {
    listener.set_nonblocking(true).unwrap();
    let mut accepted = Vec::new();
    for _ in 0..500 {
        if accepted.len() == n {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => accepted.push(stream),
            Err(_) => thread::sleep(Duration::from_millis(2)),
        }
    }
    accepted
}

/// Whether the client end of an accepted stream is still open
fn client_open(stream: &mut std::net::TcpStream) -> bool {
    use std::io::Read;
    stream.set_nonblocking(false).unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ),
    }
}

#[test]
fn test_backup_wins_when_primary_stalls() {
    init_tracing();
    let (_listener, port) = listener();
    let dialer = HeldDialer::new(&[race_v6(port)]);
    let clock = ManualClock::new();
    let config = EngineConfig::default().backup_connect_delay_ms(300);
    let mut engine = race_engine(&config, &clock, dialer.clone(), port);

    let (consumer, outcome) = RecordingConsumer::new();
    engine.schedule(Box::new(ConnectCommand::new(
        ConnectTarget::new(RACE_HOST, port),
        None,
        consumer,
        &config,
    )));

    // no backup while the delay has not passed
    for _ in 0..3 {
        tick(&mut engine);
    }
    assert_eq!(dialer.dialed(), vec![race_v6(port)]);

    clock.advance(Duration::from_millis(301));
    assert!(tick_until(&mut engine, |_| outcome.lock().is_some()));

    match outcome.lock().take() {
        Some(Outcome::Connected {
            peer, via_backup, ..
        }) => {
            assert_eq!(peer, localhost(port));
            assert!(via_backup);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(dialer.dialed(), vec![race_v6(port), localhost(port)]);
    // the stalled primary is dropped along with its command
    assert!(tick_until(&mut engine, |e| e.num_tasks() == 0));
}

#[test]
fn test_race_keeps_exactly_one_socket_when_both_connect() {
    init_tracing();
    let (listener, port) = listener();
    let dialer = HeldDialer::new(&[race_v6(port), localhost(port)]);
    let clock = ManualClock::new();
    let config = EngineConfig::default().backup_connect_delay_ms(300);
    let mut engine = race_engine(&config, &clock, dialer.clone(), port);

    let (consumer, kept) = KeepingConsumer::new();
    engine.schedule(Box::new(ConnectCommand::new(
        ConnectTarget::new(RACE_HOST, port),
        None,
        consumer,
        &config,
    )));

    tick(&mut engine);
    clock.advance(Duration::from_millis(301));
    assert!(tick_until(&mut engine, |_| dialer.dialed().len() == 2));
    assert!(kept.lock().is_none());

    // both attempts connect before either is stepped again
    assert!(dialer.release(race_v6(port), localhost(port)));
    assert!(dialer.release(localhost(port), localhost(port)));
    let mut accepted = accept_n(&listener, 2);
    assert_eq!(accepted.len(), 2);

    assert!(tick_until(&mut engine, |e| e.num_tasks() == 0));
    let conn = kept.lock().take().expect("no connection handed over");
    // the primary is stepped first in the tick, so it claims the race
    assert!(!conn.via_backup);
    assert_eq!(conn.peer, race_v6(port));

    let winner = conn.transport.socket().local_addr().unwrap();
    let mut open = Vec::new();
    for stream in accepted.iter_mut() {
        let is_winner = stream.peer_addr().unwrap() == winner;
        open.push((is_winner, client_open(stream)));
    }
    open.sort();
    assert_eq!(open, vec![(false, false), (true, true)]);
}

#[test]
fn test_failed_primary_adopts_backup_in_flight() {
    init_tracing();
    let (_listener, port) = listener();
    let dialer = HeldDialer::new(&[race_v6(port)]);
    let clock = ManualClock::new();
    let config = EngineConfig::default()
        .backup_connect_delay_ms(300)
        .connect_timeout_secs(5);
    let mut engine = race_engine(&config, &clock, dialer.clone(), port);

    let (consumer, outcome) = RecordingConsumer::new();
    engine.schedule(Box::new(ConnectCommand::new(
        ConnectTarget::new(RACE_HOST, port),
        None,
        consumer,
        &config,
    )));

    tick(&mut engine);
    clock.advance(Duration::from_millis(301));
    // spawns the backup; it dials on the next tick
    tick(&mut engine);
    assert_eq!(engine.num_tasks(), 2);
    assert_eq!(dialer.dialed(), vec![race_v6(port)]);

    // the primary times out first, then waits for the backup
    clock.advance(Duration::from_secs(5));
    assert!(tick_until(&mut engine, |_| outcome.lock().is_some()));

    match outcome.lock().take() {
        Some(Outcome::Connected {
            peer, via_backup, ..
        }) => {
            assert_eq!(peer, localhost(port));
            assert!(via_backup);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(dialer.dialed(), vec![race_v6(port), localhost(port)]);
    let now = clock.now();
    assert!(engine
        .handle_mut()
        .dns_cache()
        .is_bad(RACE_HOST, race_v6(port).ip(), port, now));
}

// =============================================================================
// TLS Tests
// =============================================================================

#[test]
fn test_tls_connection_over_loopback() {
    init_tracing();
    let (listener, port) = listener();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let ctx = TlsContext::server_from_pem(data_path("server.pem"), data_path("server.key"))
            .expect("server context");
        let mut session = TlsSession::server(&ctx, stream).expect("server session");
        loop {
            match session.handshake() {
                Ok(gosh_reactor::tls::HandshakeStatus::Complete(_)) => break,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
        // hold the connection until the client closes it
        let mut buf = [0u8; 64];
        let _ = session.read(&mut buf);
        true
    });

    let resolver = Arc::new(StaticResolver::new().with_host("localhost", &["127.0.0.1"]));
    let config = EngineConfig::default().ca_certificate(data_path("ca.pem"));
    let mut engine = DownloadEngine::builder(config.clone())
        .resolver(resolver)
        .families(IPV4_ONLY)
        .build()
        .unwrap();

    let (consumer, outcome) = RecordingConsumer::new();
    engine.schedule(Box::new(ConnectCommand::new(
        ConnectTarget::new("localhost", port).with_tls(true),
        None,
        consumer,
        &config,
    )));
    engine.run().unwrap();

    match outcome.lock().take() {
        Some(Outcome::Connected { peer, tls, .. }) => {
            assert_eq!(peer, localhost(port));
            assert!(tls);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(server.join().unwrap());
}

// =============================================================================
// Admission Tests
// =============================================================================

#[test]
fn test_finished_group_frees_its_slot_for_the_next() {
    init_tracing();
    let config = EngineConfig::default().max_concurrent_downloads(1);
    let options = Arc::new(config.clone());
    let mut engine = DownloadEngine::builder(config)
        .families(AddressFamilies::all())
        .build()
        .unwrap();

    let g1 = engine.add_group(DownloadGroup::new(
        Arc::clone(&options),
        vec!["http://one.test/a".to_string()],
        FnDriver::finished(|_ctx| Ok(Vec::new())),
    ));
    let g2 = engine.add_group(DownloadGroup::new(
        Arc::clone(&options),
        vec!["http://two.test/b".to_string()],
        FnDriver::new(|ctx| Ok(vec![IdleTask::new(Some(ctx.gid)) as Box<dyn Task>])),
    ));

    engine.handle_mut().fill_from_waiting_queue();
    assert!(engine.groups().is_active(g1));
    assert_eq!(engine.groups().num_waiting(), 1);

    assert_eq!(engine.handle_mut().remove_stopped_groups(), 1);
    let results = engine.groups().results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].gid, g1);
    assert_eq!(results[0].result, ResultCode::Finished);
    assert!(engine.groups().is_active(g2));

    engine.request_halt();
    engine.run().unwrap();
    let results = engine.groups().results();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].gid, g2);
    assert_eq!(results[1].result, ResultCode::InProgress);
}

/// Retries the group's next mirror until none is left
struct MirrorConsumer {
    gid: GroupId,
}

impl ConnectionConsumer for MirrorConsumer {
    fn on_connected(
        self: Box<Self>,
        _conn: Connection,
        _h: &mut SchedulerHandle,
    ) -> Result<Vec<Box<dyn Task>>> {
        Ok(Vec::new())
    }

    fn on_failed(
        self: Box<Self>,
        target: Option<ConnectTarget>,
        err: EngineError,
        h: &mut SchedulerHandle,
    ) -> Result<Vec<Box<dyn Task>>> {
        // no target means the selector had nothing left
        if target.is_none() {
            return Err(err);
        }
        let config = Arc::clone(h.config());
        let next = ConnectCommand::for_group(self.gid, Box::new(MirrorConsumer { gid: self.gid }), &config);
        Ok(vec![Box::new(next)])
    }
}

#[test]
fn test_group_fails_once_every_mirror_failed() {
    init_tracing();
    let uris = vec![
        format!("http://127.0.0.1:{}/file", closed_port()),
        format!("http://127.0.0.1:{}/file", closed_port()),
    ];
    let config = EngineConfig::default();
    let options = Arc::new(config.clone());
    let mut engine = DownloadEngine::builder(config)
        .families(IPV4_ONLY)
        .build()
        .unwrap();

    let gid = engine.add_group(DownloadGroup::new(
        Arc::clone(&options),
        uris.clone(),
        FnDriver::new(move |ctx| {
            Ok(vec![Box::new(ConnectCommand::for_group(
                ctx.gid,
                Box::new(MirrorConsumer { gid: ctx.gid }),
                &ctx.options,
            )) as Box<dyn Task>])
        }),
    ));
    engine.run().unwrap();

    let results = engine.groups().results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].gid, gid);
    assert_eq!(results[0].result, ResultCode::AllMirrorsFailed);
    assert_eq!(results[0].uri_results.len(), 2);

    let mut table = Vec::new();
    engine.groups().format_download_results(&mut table).unwrap();
    let table = String::from_utf8(table).unwrap();
    assert!(table.contains("| ERR|"));
    assert!(table.contains("(ERR):error occurred."));
}
