mod common;

use common::{
    byte_item, config, error_reply, init_tracing, item_count, mode_run_push, read_reply,
    write_reply, MockPlc, Profile, Request, PRIMARY, SECONDARY,
};
use plcwire_driver_s7::{
    parse_tag,
    protocol::{
        events::{CpuMode, EventDetails},
        frame::{message::read_var_param, DataItem, DataTransportSize, S7Pdu, S7ReturnCode},
    },
    ControllerType, DriverError, ErrorKind, EventCategory, ItemStatus, LinkRole,
    MemoryTransportFactory, S7Connection, S7DataValue, SessionEvent, SessionState, Subscription,
    SubscriptionRequest,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, mpsc},
    time::timeout,
};

async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no session event")
        .expect("event channel closed")
}

async fn next_request(plc: &mut MockPlc) -> Request {
    timeout(Duration::from_secs(5), plc.requests.recv())
        .await
        .expect("no request reached the PLC")
        .expect("PLC stopped")
}

fn int_reply(req: &S7Pdu) -> S7Pdu {
    let items: Vec<DataItem> = (0..item_count(req)).map(|_| byte_item(&[0x00, 0x2A])).collect();
    read_reply(req, &items)
}

#[tokio::test]
async fn handshake_negotiates_and_identifies_the_cpu() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let plc = MockPlc::listen(&factory, PRIMARY, Profile::default());
    let conn = S7Connection::with_factory(config(ControllerType::Any), factory.clone()).unwrap();
    let mut events = conn.subscribe_connection_events();

    conn.connect().await.unwrap();
    assert!(conn.is_connected());
    assert_eq!(conn.state(), SessionState::Connected);
    assert_eq!(conn.controller_type(), ControllerType::S7_300);
    let params = conn.session_params().unwrap();
    assert_eq!(params.amq_caller, 3);
    assert_eq!(params.pdu_size, 480);
    assert_eq!(params.tpdu_size, 1024);
    assert_eq!(params.article_number.as_deref(), Some("6ES7 315-2EH14-0AB0"));
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    assert_eq!(plc.setups(), 1);

    // A second connect on a live session is a no-op.
    conn.connect().await.unwrap();
    assert_eq!(plc.connections(), 1);

    conn.disconnect().await;
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert!(!conn.is_connected());
    assert_eq!(conn.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn configured_controller_skips_identification() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let _plc = MockPlc::listen(
        &factory,
        PRIMARY,
        Profile {
            article: None,
            ..Default::default()
        },
    );
    let conn = S7Connection::with_factory(config(ControllerType::S7_1500), factory.clone()).unwrap();
    conn.connect().await.unwrap();
    assert_eq!(conn.controller_type(), ControllerType::S7_1500);
    assert_eq!(conn.session_params().unwrap().article_number, None);
}

#[tokio::test]
async fn refused_connection_is_a_handshake_failure() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let _plc = MockPlc::listen(
        &factory,
        PRIMARY,
        Profile {
            refuse: true,
            ..Default::default()
        },
    );
    let conn = S7Connection::with_factory(config(ControllerType::Any), factory.clone()).unwrap();
    let err = conn.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HandshakeFailure);
    assert!(!conn.is_connected());
    assert_eq!(conn.state(), SessionState::Disconnected);
    assert_eq!(conn.last_error().map(|e| e.kind()), Some(ErrorKind::HandshakeFailure));
}

#[tokio::test]
async fn unreachable_device_fails_connect_with_transport_error() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let conn = S7Connection::with_factory(config(ControllerType::Any), factory.clone()).unwrap();
    let err = conn.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn passive_mode_connects_without_handshake() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let plc = MockPlc::listen(&factory, PRIMARY, Profile::default().with_responder(int_reply));
    let mut cfg = config(ControllerType::S7_300);
    cfg.passive = true;
    let conn = S7Connection::with_factory(cfg, factory.clone()).unwrap();
    let mut events = conn.subscribe_connection_events();

    conn.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    assert_eq!(plc.setups(), 0);
    let tag = parse_tag("%DB1.DBW0:INT").unwrap();
    let res = conn.read(&[tag]).await.unwrap();
    assert_eq!(res[0].value, Some(S7DataValue::Int(42)));
}

#[tokio::test]
async fn third_read_waits_for_a_free_slot() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let mut plc = MockPlc::listen(
        &factory,
        PRIMARY,
        Profile {
            amq: 2,
            ..Default::default()
        },
    );
    let conn = Arc::new(
        S7Connection::with_factory(config(ControllerType::S7_300), factory.clone()).unwrap(),
    );
    conn.connect().await.unwrap();
    assert_eq!(conn.session_params().unwrap().amq_caller, 2);

    let tag = parse_tag("%DB1.DBW0:INT").unwrap();
    let reads: Vec<_> = (0..3)
        .map(|_| {
            let conn = Arc::clone(&conn);
            let tags = vec![tag.clone()];
            tokio::spawn(async move { conn.read(&tags).await })
        })
        .collect();

    let first = next_request(&mut plc).await;
    let second = next_request(&mut plc).await;
    assert_ne!(first.pdu.pdu_ref(), second.pdu.pdu_ref());
    assert!(
        timeout(Duration::from_millis(200), plc.requests.recv())
            .await
            .is_err(),
        "third read must stay queued while two are outstanding"
    );

    // Answer out of order; the freed slot goes to the queued read.
    second.respond(int_reply(&second.pdu));
    let third = next_request(&mut plc).await;
    assert_ne!(third.pdu.pdu_ref(), first.pdu.pdu_ref());
    assert_ne!(third.pdu.pdu_ref(), second.pdu.pdu_ref());
    first.respond(int_reply(&first.pdu));
    third.respond(int_reply(&third.pdu));

    for read in reads {
        let res = read.await.unwrap().unwrap();
        assert_eq!(res.len(), 1);
        assert_eq!(res[0].status, ItemStatus::Ok);
        assert_eq!(res[0].value, Some(S7DataValue::Int(42)));
    }
}

#[tokio::test]
async fn item_count_mismatch_fails_the_read() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let _plc = MockPlc::listen(
        &factory,
        PRIMARY,
        Profile::default().with_responder(|req| read_reply(req, &[byte_item(&[0x00, 0x01])])),
    );
    let conn = S7Connection::with_factory(config(ControllerType::S7_300), factory.clone()).unwrap();
    conn.connect().await.unwrap();

    let tags = [
        parse_tag("%DB1.DBW0:INT").unwrap(),
        parse_tag("%DB1.DBW2:INT").unwrap(),
    ];
    let err = conn.read(&tags).await.unwrap_err();
    assert!(matches!(err, DriverError::ProtocolConsistency(_)), "{err:?}");
    // The connection itself is unaffected.
    assert!(conn.is_connected());
}

#[tokio::test]
async fn per_item_results_keep_request_order() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let _plc = MockPlc::listen(
        &factory,
        PRIMARY,
        Profile::default().with_responder(|req| {
            if req.param[0] == 0x05 {
                write_reply(req, &[0xFF, 0x05])
            } else {
                read_reply(
                    req,
                    &[
                        byte_item(&[0x00, 0x07]),
                        DataItem {
                            return_code: S7ReturnCode::ObjectDoesNotExist,
                            transport: DataTransportSize::Null,
                            data: Default::default(),
                        },
                    ],
                )
            }
        }),
    );
    let conn = S7Connection::with_factory(config(ControllerType::S7_300), factory.clone()).unwrap();
    conn.connect().await.unwrap();

    let a = parse_tag("%DB1.DBW0:INT").unwrap();
    let b = parse_tag("%DB9.DBW0:INT").unwrap();
    let res = conn.read(&[a.clone(), b.clone()]).await.unwrap();
    assert_eq!(res[0].tag, a);
    assert_eq!(res[0].value, Some(S7DataValue::Int(7)));
    assert_eq!(res[1].tag, b);
    assert_eq!(res[1].status, ItemStatus::NotFound);
    assert_eq!(res[1].value, None);

    let statuses = conn
        .write(&[(a, S7DataValue::Int(1)), (b, S7DataValue::Int(2))])
        .await
        .unwrap();
    assert_eq!(statuses, vec![ItemStatus::Ok, ItemStatus::InvalidAddress]);
}

#[tokio::test]
async fn put_get_refusal_marks_every_item_access_denied() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let _plc = MockPlc::listen(
        &factory,
        PRIMARY,
        Profile::default().with_responder(|req| error_reply(req, 0x81, 0x04)),
    );
    let conn = S7Connection::with_factory(config(ControllerType::S7_1200), factory.clone()).unwrap();
    conn.connect().await.unwrap();

    let tags = [
        parse_tag("%MB0:BYTE").unwrap(),
        parse_tag("%MW2:WORD").unwrap(),
    ];
    let res = conn.read(&tags).await.unwrap();
    assert!(res
        .iter()
        .all(|r| r.status == ItemStatus::AccessDenied && r.value.is_none()));
}

#[tokio::test]
async fn unsupported_categories_are_rejected_before_sending() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let plc = MockPlc::listen(&factory, PRIMARY, Profile::default());
    let conn = S7Connection::with_factory(config(ControllerType::S7_1200), factory.clone()).unwrap();
    conn.connect().await.unwrap();

    let err = conn
        .subscribe(&[SubscriptionRequest::Event(EventCategory::Alarm)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    let err = conn
        .subscribe(&[SubscriptionRequest::Cyclic {
            tags: vec![parse_tag("%MW0:INT").unwrap()],
            period: Duration::from_secs(1),
        }])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    assert_eq!(plc.user_data_requests(), 0);

    let subs = conn
        .subscribe(&[SubscriptionRequest::Event(EventCategory::Mode)])
        .await
        .unwrap();
    assert_eq!(subs, vec![Subscription::Event(EventCategory::Mode)]);
    assert_eq!(plc.user_data_requests(), 1);
}

#[tokio::test]
async fn pushed_events_reach_registered_callbacks() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let plc = MockPlc::listen(&factory, PRIMARY, Profile::default());
    let conn = S7Connection::with_factory(config(ControllerType::S7_300), factory.clone()).unwrap();
    assert!(matches!(
        conn.register(EventCategory::Mode, |_| {}),
        Err(DriverError::NotConnected)
    ));
    conn.connect().await.unwrap();

    let subs = conn
        .subscribe(&[
            SubscriptionRequest::Event(EventCategory::Mode),
            SubscriptionRequest::Cyclic {
                tags: vec![parse_tag("%DB1.DBW0:INT").unwrap()],
                period: Duration::from_millis(500),
            },
        ])
        .await
        .unwrap();
    assert_eq!(subs[0], Subscription::Event(EventCategory::Mode));
    assert!(matches!(subs[1], Subscription::Cyclic { job_id: 0x07, .. }));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = conn
        .register(EventCategory::Mode, move |ev| {
            let _ = tx.send(ev.clone());
        })
        .unwrap();
    plc.push(mode_run_push());
    let ev = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ev.category, EventCategory::Mode);
    assert_eq!(ev.details, EventDetails::Mode { mode: CpuMode::Run });

    assert!(conn.unregister(handle).unwrap());
    conn.unsubscribe(&subs).await.unwrap();
}

#[tokio::test]
async fn unanswered_request_times_out_and_frees_its_slot() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let mut plc = MockPlc::listen(
        &factory,
        PRIMARY,
        Profile {
            amq: 1,
            ..Default::default()
        },
    );
    let mut cfg = config(ControllerType::S7_300);
    cfg.request_timeout_ms = 300;
    let conn = S7Connection::with_factory(cfg, factory.clone()).unwrap();
    conn.connect().await.unwrap();

    let tag = parse_tag("%DB1.DBW0:INT").unwrap();
    let err = conn.read(std::slice::from_ref(&tag)).await.unwrap_err();
    assert!(
        matches!(err, DriverError::TransactionTimeout(d) if d == Duration::from_millis(300)),
        "{err:?}"
    );
    let _stale = next_request(&mut plc).await;

    // Capacity is one; the next read is only sent if the slot came back.
    let conn = Arc::new(conn);
    let read = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.read(&[tag]).await })
    };
    let req = next_request(&mut plc).await;
    req.respond(int_reply(&req.pdu));
    assert_eq!(read.await.unwrap().unwrap()[0].status, ItemStatus::Ok);
}

#[tokio::test]
async fn disconnect_fails_outstanding_requests_immediately() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let mut plc = MockPlc::listen(&factory, PRIMARY, Profile::default());
    let conn = Arc::new(
        S7Connection::with_factory(config(ControllerType::S7_300), factory.clone()).unwrap(),
    );
    conn.connect().await.unwrap();

    let read = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.read(&[parse_tag("%MW0:INT").unwrap()]).await })
    };
    let _held = next_request(&mut plc).await;
    conn.disconnect().await;

    let err = timeout(Duration::from_secs(1), read)
        .await
        .expect("read was not failed by disconnect")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, DriverError::NotConnected), "{err:?}");
    let err = conn.read(&[parse_tag("%MW0:INT").unwrap()]).await.unwrap_err();
    assert!(matches!(err, DriverError::NotConnected));
}

#[tokio::test]
async fn failover_keeps_the_session_alive() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let plc_a = MockPlc::listen(&factory, PRIMARY, Profile::default().with_responder(int_reply));
    let plc_b = MockPlc::listen(&factory, SECONDARY, Profile::default().with_responder(int_reply));
    let mut cfg = config(ControllerType::S7_400);
    cfg.secondary = Some(SECONDARY.into());
    let conn = S7Connection::with_factory(cfg, factory.clone()).unwrap();
    let mut events = conn.subscribe_connection_events();
    conn.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    assert_eq!(plc_a.setups(), 1);
    assert_eq!(plc_b.setups(), 0);

    factory.set_reachable(PRIMARY, false);
    plc_a.drop_connections();
    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Reconnected {
            role: LinkRole::Secondary
        }
    );
    // The handshake was re-run on the standby before the event fired.
    assert_eq!(plc_b.setups(), 1);
    assert!(conn.is_connected());
    let res = conn.read(&[parse_tag("%DB1.DBW0:INT").unwrap()]).await.unwrap();
    assert_eq!(res[0].value, Some(S7DataValue::Int(42)));

    factory.set_reachable(SECONDARY, false);
    plc_b.drop_connections();
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert!(!conn.is_connected());
    let err = conn.read(&[parse_tag("%DB1.DBW0:INT").unwrap()]).await.unwrap_err();
    assert!(matches!(err, DriverError::NotConnected));
}

#[tokio::test]
async fn ping_reads_the_configured_tag() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let _plc = MockPlc::listen(
        &factory,
        PRIMARY,
        Profile::default().with_responder(|req| read_reply(req, &[byte_item(&[0x01])])),
    );
    let conn = S7Connection::with_factory(config(ControllerType::S7_300), factory.clone()).unwrap();
    assert!(matches!(conn.ping().await, Err(DriverError::NotConnected)));
    conn.connect().await.unwrap();
    conn.ping().await.unwrap();
}

#[tokio::test]
async fn failover_rehandshakes_before_queued_reads_reach_the_standby() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let one_slot = Profile {
        amq: 1,
        ..Default::default()
    };
    let mut plc_a = MockPlc::listen(&factory, PRIMARY, one_slot.clone());
    let mut plc_b = MockPlc::listen(&factory, SECONDARY, one_slot);
    let mut cfg = config(ControllerType::S7_400);
    cfg.secondary = Some(SECONDARY.into());
    cfg.request_timeout_ms = 2_000;
    let conn = Arc::new(S7Connection::with_factory(cfg, factory.clone()).unwrap());
    let mut events = conn.subscribe_connection_events();
    conn.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);
    assert_eq!(conn.session_params().unwrap().amq_caller, 1);

    let spawn_read = || {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.read(&[parse_tag("%DB1.DBW0:INT").unwrap()]).await })
    };
    // The first read holds the only slot on the primary, the second queues.
    let first = spawn_read();
    let _unanswered = next_request(&mut plc_a).await;
    let second = spawn_read();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    factory.set_reachable(PRIMARY, false);
    plc_a.drop_connections();
    // Neither the stranded read nor its deadline delays the switch.
    let ev = timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("failover waited on the stranded request")
        .unwrap();
    assert_eq!(
        ev,
        SessionEvent::Reconnected {
            role: LinkRole::Secondary
        }
    );

    let queued = next_request(&mut plc_b).await;
    assert_eq!(plc_b.setups(), 1, "read reached the standby before setup communication");
    queued.respond(int_reply(&queued.pdu));
    let res = second.await.unwrap().unwrap();
    assert_eq!(res[0].value, Some(S7DataValue::Int(42)));
    assert!(plc_a.requests.try_recv().is_err());

    // Nothing on the new link can answer the first read; it runs out its own deadline.
    let err = first.await.unwrap().unwrap_err();
    assert!(
        matches!(err, DriverError::TransactionTimeout(d) if d == Duration::from_secs(2)),
        "{err:?}"
    );
}

#[tokio::test]
async fn event_flood_past_the_raw_queue_disconnects() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let plc = MockPlc::listen(&factory, PRIMARY, Profile::default());
    let mut cfg = config(ControllerType::S7_300);
    cfg.event_queue_capacity = 1;
    cfg.dispatch_queue_capacity = 1;
    let conn = S7Connection::with_factory(cfg, factory.clone()).unwrap();
    let mut events = conn.subscribe_connection_events();
    conn.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    for _ in 0..64 {
        plc.push(mode_run_push());
    }
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert!(!conn.is_connected());
    assert!(
        matches!(
            conn.last_error(),
            Some(DriverError::EventQueueOverflow { capacity: 1 })
        ),
        "{:?}",
        conn.last_error()
    );
}

#[tokio::test]
async fn idle_link_gets_a_keep_alive_read_of_the_ping_tag() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let mut plc = MockPlc::listen(&factory, PRIMARY, Profile::default());
    let mut cfg = config(ControllerType::S7_300);
    cfg.keep_alive = true;
    cfg.keep_alive_interval_ms = 200;
    let conn = S7Connection::with_factory(cfg, factory.clone()).unwrap();
    conn.connect().await.unwrap();

    // Nothing was read by the application; the only job is the keep-alive read.
    let keep_alive = next_request(&mut plc).await;
    let ping_tag = parse_tag(&conn.config().ping_tag).unwrap();
    assert_eq!(keep_alive.pdu.param, read_var_param(std::slice::from_ref(&ping_tag)));
    keep_alive.respond(read_reply(&keep_alive.pdu, &[byte_item(&[0x01])]));
    assert!(conn.is_connected());
}

#[tokio::test]
async fn link_reset_times_out_the_outstanding_read_then_recovers() {
    init_tracing();
    let factory = Arc::new(MemoryTransportFactory::new());
    let mut plc = MockPlc::listen(&factory, PRIMARY, Profile::default());
    let mut cfg = config(ControllerType::S7_300);
    cfg.request_timeout_ms = 500;
    // Reopen well after the request deadline.
    cfg.retry_interval_ms = 1_500;
    let conn = Arc::new(S7Connection::with_factory(cfg, factory.clone()).unwrap());
    let mut events = conn.subscribe_connection_events();
    conn.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SessionEvent::Connected);

    let read = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.read(&[parse_tag("%MW0:INT").unwrap()]).await })
    };
    let _lost = next_request(&mut plc).await;
    plc.drop_connections();

    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnected);
    assert!(!conn.is_connected());
    let err = read.await.unwrap().unwrap_err();
    assert!(
        matches!(err, DriverError::TransactionTimeout(d) if d == Duration::from_millis(500)),
        "{err:?}"
    );

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::Reconnected {
            role: LinkRole::Primary
        }
    );
    assert!(conn.is_connected());
    assert_eq!(plc.setups(), 2);

    let read = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { conn.read(&[parse_tag("%MW0:INT").unwrap()]).await })
    };
    let req = next_request(&mut plc).await;
    req.respond(int_reply(&req.pdu));
    assert_eq!(read.await.unwrap().unwrap()[0].status, ItemStatus::Ok);
}
