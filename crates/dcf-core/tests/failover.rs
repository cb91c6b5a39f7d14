//! 冗余与恢复：主节点故障转移、集合耗尽、客户端重连、对等节点补连与重配置期间的排队。

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::*;
use dcf_core::{
    DcfError, Mode, ResolvedMode, SendOutcome, SessionEvent, TopologyState,
    error::codes,
    redundancy::{RttGroup, SetRole},
    transport::memory::MemoryNetwork,
};

#[tokio::test]
async fn master_failover_moves_to_next_ranked_master() {
    let network = MemoryNetwork::new();
    let (_a, _) = server(&network, "master-a", 7001).await;
    let (_b, inbox_b) = server(&network, "master-b", 7002).await;
    let node = build(
        &network,
        master_config("edge", &[ep("master-a", 7001), ep("master-b", 7002)]),
    );
    node.start().await.expect("start");
    let active: Vec<_> = node
        .peers(SetRole::Masters)
        .into_iter()
        .filter(|status| status.active)
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].endpoint.id, ep("master-a", 7001));

    let mut events = node.subscribe();
    network.set_reachable(&ep("master-a", 7001), false);

    wait_event(&mut events, |event| {
        matches!(
            event,
            SessionEvent::Failover { role: SetRole::Masters, from, to }
                if *from == ep("master-a", 7001) && *to == ep("master-b", 7002)
        )
    })
    .await;
    wait_event(&mut events, |event| {
        matches!(event, SessionEvent::Rebound { endpoint } if *endpoint == ep("master-b", 7002))
    })
    .await;
    wait_state(&node, |state| *state == TopologyState::Running(ResolvedMode::Master)).await;

    let outcome = node.send_message("after failover", "").await.expect("send");
    let token = outcome.ack_token().expect("delivered").clone();
    assert!(token.as_str().starts_with("ack:master-b:7002/"));
    wait_until(|| inbox_b.len() == 1).await;
    assert_eq!(inbox_b.payloads(), vec![Bytes::from_static(b"after failover")]);

    node.stop().await.expect("stop");
}

#[tokio::test]
async fn exhausted_master_set_fails_queued_and_later_sends() {
    let network = MemoryNetwork::new();
    let (_a, _) = server(&network, "master-a", 7001).await;
    let mut cfg = master_config("edge", &[ep("master-a", 7001)]);
    cfg.redundancy.retry_backoff_ms = 100;
    let node = build(&network, cfg);
    node.start().await.expect("start");
    let mut events = node.subscribe();

    network.set_reachable(&ep("master-a", 7001), false);
    wait_state(&node, |state| {
        *state == TopologyState::Reconfiguring(ResolvedMode::Master)
    })
    .await;

    let queued = node.send_message("while recovering", "").await.unwrap_err();
    assert!(matches!(queued, DcfError::MasterUnreachable { .. }));
    wait_state(&node, |state| *state == TopologyState::Failed).await;

    wait_event(&mut events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged {
                to: TopologyState::Reconfiguring(ResolvedMode::Master),
                ..
            }
        )
    })
    .await;
    wait_event(&mut events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged {
                to: TopologyState::Failed,
                ..
            }
        )
    })
    .await;

    let err = node.send_message("after failure", "").await.unwrap_err();
    assert_eq!(err.code(), codes::MASTER_UNREACHABLE);
    assert_eq!(node.open_channels(), 0);
    node.stop().await.expect("stop");
}

#[tokio::test]
async fn client_reconnects_and_flushes_queued_sends_in_order() {
    let network = MemoryNetwork::new();
    let (_hub, inbox) = server(&network, "hub", 7000).await;
    let mut cfg = config(Mode::Client, "hub", 7000);
    cfg.redundancy.retry_rounds = 20;
    cfg.redundancy.retry_backoff_ms = 20;
    let client = build(&network, cfg);
    client.start().await.expect("start");
    let mut events = client.subscribe();

    network.set_reachable(&ep("hub", 7000), false);
    wait_state(&client, |state| {
        *state == TopologyState::Reconfiguring(ResolvedMode::Client)
    })
    .await;

    let restore = async {
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        network.set_reachable(&ep("hub", 7000), true);
    };
    let (first, second, ()) = tokio::join!(
        client.send_message("q1", ""),
        client.send_message("q2", ""),
        restore
    );
    assert!(matches!(first, Ok(SendOutcome::Delivered(_))));
    assert!(matches!(second, Ok(SendOutcome::Delivered(_))));

    wait_event(&mut events, |event| matches!(event, SessionEvent::Rebound { .. })).await;
    wait_state(&client, |state| *state == TopologyState::Running(ResolvedMode::Client)).await;
    wait_until(|| inbox.len() == 2).await;
    assert_eq!(
        inbox.payloads(),
        vec![Bytes::from_static(b"q1"), Bytes::from_static(b"q2")]
    );
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn rebind_queue_overflow_surfaces_backpressure() {
    let network = MemoryNetwork::new();
    let (_hub, inbox) = server(&network, "hub", 7000).await;
    let mut cfg = config(Mode::Client, "hub", 7000);
    cfg.dispatch.queue_capacity = 2;
    cfg.redundancy.retry_rounds = 20;
    cfg.redundancy.retry_backoff_ms = 20;
    let client = build(&network, cfg);
    client.start().await.expect("start");

    network.set_reachable(&ep("hub", 7000), false);
    wait_state(&client, |state| {
        *state == TopologyState::Reconfiguring(ResolvedMode::Client)
    })
    .await;

    let restore = async {
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        network.set_reachable(&ep("hub", 7000), true);
    };
    let (first, second, third, ()) = tokio::join!(
        client.send_message("m1", ""),
        client.send_message("m2", ""),
        client.send_message("m3", ""),
        restore
    );
    assert!(first.is_ok());
    assert!(second.is_ok());
    let err = third.unwrap_err();
    assert!(matches!(err, DcfError::Backpressure { capacity: 2 }));

    wait_until(|| inbox.len() == 2).await;
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn silent_master_degrades_then_fails_over() {
    let network = MemoryNetwork::new();
    let (_a, _) = server(&network, "master-a", 7001).await;
    let (_b, _) = server(&network, "master-b", 7002).await;
    let node = build(
        &network,
        master_config("edge", &[ep("master-a", 7001), ep("master-b", 7002)]),
    );
    node.start().await.expect("start");
    let mut events = node.subscribe();

    network.set_muted(&ep("master-a", 7001), true);

    wait_event(&mut events, |event| {
        matches!(
            event,
            SessionEvent::ChannelDegraded { endpoint, state: dcf_core::channel::ChannelState::Degraded }
                if *endpoint == ep("master-a", 7001)
        )
    })
    .await;
    let closed = wait_event(&mut events, |event| {
        matches!(event, SessionEvent::ChannelClosed { endpoint, .. } if *endpoint == ep("master-a", 7001))
    })
    .await;
    let SessionEvent::ChannelClosed { reason, .. } = closed else {
        unreachable!()
    };
    assert_eq!(reason.expect("reason").code(), codes::TIMEOUT);
    wait_event(&mut events, |event| {
        matches!(event, SessionEvent::Rebound { endpoint } if *endpoint == ep("master-b", 7002))
    })
    .await;
    node.stop().await.expect("stop");
}

#[tokio::test]
async fn reconfigure_switches_mode_and_keeps_sends_working() {
    let network = MemoryNetwork::new();
    let (_hub, inbox) = server(&network, "hub", 7000).await;
    let mut cfg = config(Mode::Client, "hub", 7000);
    cfg.peers = entries(&[ep("hub", 7000)]);
    cfg.masters = entries(&[ep("hub", 7000)]);
    let node = build(&network, cfg);
    node.start().await.expect("start");
    let mut events = node.subscribe();

    assert_eq!(
        node.reconfigure(Mode::Master).await.expect("to master"),
        ResolvedMode::Master
    );
    wait_event(&mut events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged {
                from: TopologyState::Running(ResolvedMode::Client),
                to: TopologyState::Reconfiguring(ResolvedMode::Client)
            }
        )
    })
    .await;
    wait_event(&mut events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged {
                from: TopologyState::Reconfiguring(ResolvedMode::Client),
                to: TopologyState::Running(ResolvedMode::Master)
            }
        )
    })
    .await;
    node.send_message("as master", "").await.expect("send");
    wait_until(|| inbox.payloads().contains(&Bytes::from_static(b"as master"))).await;

    // P2P 监听本节点自己的地址，而不是 Client 模式下的远端地址。
    node.update_config("host", "edge").expect("host");
    node.update_config("port", "0").expect("port");
    assert_eq!(
        node.reconfigure(Mode::P2P).await.expect("to p2p"),
        ResolvedMode::P2P
    );
    assert_eq!(
        node.local_endpoint().map(|endpoint| endpoint.host().to_owned()),
        Some("edge".to_owned())
    );
    let outcome = node.send_message("as peer", "").await.expect("broadcast");
    let SendOutcome::Broadcast(report) = outcome else {
        panic!("p2p default route is a broadcast");
    };
    assert_eq!(report.delivered(), 1);
    node.stop().await.expect("stop");
}

#[tokio::test]
async fn failed_reconfigure_leaves_the_session_failed() {
    let network = MemoryNetwork::new();
    let (_hub, _) = server(&network, "hub", 7000).await;
    let node = build(&network, config(Mode::Client, "hub", 7000));
    node.start().await.expect("start");

    let err = node.reconfigure(Mode::Master).await.unwrap_err();
    assert!(matches!(err, DcfError::MasterUnreachable { .. }));
    assert_eq!(node.state(), TopologyState::Failed);
    assert_eq!(node.open_channels(), 0);
    node.stop().await.expect("stop");
}

#[tokio::test]
async fn late_p2p_peer_joins_once_it_listens() {
    let network = MemoryNetwork::new();
    let (_s1, _) = server(&network, "store-1", 7201).await;
    let peer = build(
        &network,
        p2p_config("peer", &[ep("store-1", 7201), ep("store-2", 7202)]),
    );
    peer.start().await.expect("start with one peer up");
    assert_eq!(peer.open_channels(), 1);

    let err = peer.send_message("early", "store-2:7202").await.unwrap_err();
    assert_eq!(err, DcfError::master_unreachable(SetRole::Peers));
    let outcome = peer.send_message("partial", "").await.expect("broadcast");
    let SendOutcome::Broadcast(report) = outcome else {
        panic!("empty recipient broadcasts in p2p mode");
    };
    assert_eq!(report.delivered(), 1);
    assert_eq!(
        report.get(&ep("store-2", 7202)),
        Some(&Err(DcfError::master_unreachable(SetRole::Peers)))
    );

    let mut events = peer.subscribe();
    let (_s2, inbox2) = server(&network, "store-2", 7202).await;
    wait_event(&mut events, |event| {
        matches!(event, SessionEvent::ChannelOpened { endpoint } if *endpoint == ep("store-2", 7202))
    })
    .await;
    assert_eq!(peer.open_channels(), 2);
    assert!(
        peer.peers(SetRole::Peers)
            .iter()
            .all(|status| status.live)
    );

    let outcome = peer.send_message("late", "store-2:7202").await.expect("direct");
    assert!(matches!(outcome, SendOutcome::Delivered(_)));
    wait_until(|| inbox2.len() == 1).await;
    assert_eq!(inbox2.payloads(), vec![Bytes::from_static(b"late")]);
    peer.stop().await.expect("stop");
}

#[tokio::test]
async fn dropped_p2p_peer_is_redialed_after_recovery_gives_up() {
    let network = MemoryNetwork::new();
    let (_s1, _) = server(&network, "store-1", 7201).await;
    let (_s2, inbox2) = server(&network, "store-2", 7202).await;
    let peer = build(
        &network,
        p2p_config("peer", &[ep("store-1", 7201), ep("store-2", 7202)]),
    );
    peer.start().await.expect("start");
    assert_eq!(peer.open_channels(), 2);
    let mut events = peer.subscribe();

    network.set_reachable(&ep("store-2", 7202), false);
    wait_event(&mut events, |event| {
        matches!(
            event,
            SessionEvent::StateChanged {
                from: TopologyState::Reconfiguring(ResolvedMode::P2P),
                to: TopologyState::Running(ResolvedMode::P2P),
            }
        )
    })
    .await;
    assert_eq!(peer.open_channels(), 1);
    let err = peer.send_message("while away", "store-2:7202").await.unwrap_err();
    assert_eq!(err.code(), codes::MASTER_UNREACHABLE);
    peer.send_message("still fine", "store-1:7201")
        .await
        .expect("healthy peer unaffected");

    network.set_reachable(&ep("store-2", 7202), true);
    wait_event(&mut events, |event| {
        matches!(event, SessionEvent::ChannelOpened { endpoint } if *endpoint == ep("store-2", 7202))
    })
    .await;
    assert_eq!(peer.state(), TopologyState::Running(ResolvedMode::P2P));
    peer.send_message("welcome back", "store-2:7202")
        .await
        .expect("redialed peer");
    wait_until(|| inbox2.payloads().contains(&Bytes::from_static(b"welcome back"))).await;
    peer.stop().await.expect("stop");
}

#[tokio::test]
async fn broadcast_during_peer_rebind_reaches_healthy_peers_first() {
    let network = MemoryNetwork::new();
    let (_s1, inbox1) = server(&network, "store-1", 7201).await;
    let (_s2, inbox2) = server(&network, "store-2", 7202).await;
    let mut cfg = p2p_config("peer", &[ep("store-1", 7201), ep("store-2", 7202)]);
    cfg.redundancy.retry_rounds = 50;
    cfg.redundancy.retry_backoff_ms = 20;
    let peer = build(&network, cfg);
    peer.start().await.expect("start");

    network.set_reachable(&ep("store-2", 7202), false);
    wait_state(&peer, |state| {
        *state == TopologyState::Reconfiguring(ResolvedMode::P2P)
    })
    .await;

    let healthy_first = async {
        wait_until(|| inbox1.len() == 1).await;
        assert_eq!(inbox2.len(), 0);
        network.set_reachable(&ep("store-2", 7202), true);
    };
    let (outcome, ()) = tokio::join!(peer.send_message("fan out", ""), healthy_first);
    let SendOutcome::Broadcast(report) = outcome.expect("broadcast") else {
        panic!("empty recipient broadcasts in p2p mode");
    };
    assert_eq!(report.delivered(), 2);
    assert_eq!(report.failed(), 0);

    wait_until(|| inbox2.len() == 1).await;
    assert_eq!(inbox2.payloads(), vec![Bytes::from_static(b"fan out")]);
    wait_state(&peer, |state| *state == TopologyState::Running(ResolvedMode::P2P)).await;
    peer.stop().await.expect("stop");
}

#[tokio::test]
async fn stop_cancels_sends_queued_during_recovery() {
    let network = MemoryNetwork::new();
    let (_a, _) = server(&network, "master-a", 7001).await;
    let mut cfg = master_config("edge", &[ep("master-a", 7001)]);
    cfg.redundancy.retry_backoff_ms = 2_000;
    let node = build(&network, cfg);
    node.start().await.expect("start");

    network.set_reachable(&ep("master-a", 7001), false);
    wait_state(&node, |state| {
        *state == TopologyState::Reconfiguring(ResolvedMode::Master)
    })
    .await;

    let stop_later = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        node.stop().await
    };
    let (queued, stopped) = tokio::join!(node.send_message("queued", ""), stop_later);
    assert_eq!(queued.unwrap_err(), DcfError::cancelled("send_message"));
    stopped.expect("stop");
    assert_eq!(node.state(), TopologyState::Stopped);
}

#[tokio::test]
async fn liveness_pongs_keep_master_rtt_current() {
    let network = MemoryNetwork::new();
    let (_a, _) = server(&network, "master-a", 7001).await;
    let (_b, _) = server(&network, "master-b", 7002).await;
    let node = build(
        &network,
        master_config("edge", &[ep("master-a", 7001), ep("master-b", 7002)]),
    );
    node.start().await.expect("start");

    wait_until(|| {
        node.peers(SetRole::Masters)
            .iter()
            .any(|status| status.endpoint.id == ep("master-a", 7001) && status.rtt.is_some())
    })
    .await;
    let active = node
        .peers(SetRole::Masters)
        .into_iter()
        .find(|status| status.active)
        .expect("active master");
    assert_eq!(active.endpoint.id, ep("master-a", 7001));
    assert_eq!(active.group, RttGroup::Local);
    assert_eq!(node.optimal_route(SetRole::Masters), Some(ep("master-a", 7001)));
    node.stop().await.expect("stop");
}
