//! 消息路径：确认令牌、顺序、插件裁决与故障隔离、按模式路由、入站投递。

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use dcf_core::{
    DcfError, Envelope, Mode, ResolvedMode, SendOutcome, SessionEvent,
    error::codes,
    plugin::{Plugin, PluginError, PluginPosition, Verdict},
    transport::memory::MemoryNetwork,
};
use futures::future::join_all;

struct DropSecrets;

impl Plugin for DropSecrets {
    fn name(&self) -> &str {
        "drop-secrets"
    }

    fn on_outbound(&self, envelope: &Envelope) -> Result<Verdict, PluginError> {
        if envelope.payload.as_ref() == b"secret" {
            Ok(Verdict::Drop)
        } else {
            Ok(Verdict::Pass)
        }
    }
}

struct Shout;

impl Plugin for Shout {
    fn name(&self) -> &str {
        "shout"
    }

    fn on_outbound(&self, envelope: &Envelope) -> Result<Verdict, PluginError> {
        let loud = envelope.payload.to_ascii_uppercase();
        Ok(Verdict::Mutate(envelope.clone().with_payload(loud)))
    }
}

struct Faulty;

impl Plugin for Faulty {
    fn name(&self) -> &str {
        "faulty"
    }

    fn on_outbound(&self, _envelope: &Envelope) -> Result<Verdict, PluginError> {
        Err(PluginError::new("codec table missing"))
    }
}

struct Veto;

impl Plugin for Veto {
    fn name(&self) -> &str {
        "veto"
    }

    fn on_outbound(&self, envelope: &Envelope) -> Result<Verdict, PluginError> {
        if envelope.payload.starts_with(b"forbidden") {
            Ok(Verdict::Reject("forbidden prefix".to_owned()))
        } else {
            Ok(Verdict::Pass)
        }
    }
}

#[tokio::test]
async fn client_send_returns_ack_token_and_sender_identity() {
    let network = MemoryNetwork::new();
    let (_hub, inbox) = server(&network, "hub", 7000).await;
    let mut cfg = config(Mode::Client, "hub", 7000);
    cfg.node_id = Some("client-1".to_owned());
    let client = build(&network, cfg);
    client.start().await.expect("start");

    let outcome = client.send_message("hello", "ignored in client mode").await.expect("send");
    let token = outcome.ack_token().expect("delivered");
    assert!(!token.is_empty());
    assert!(token.as_str().starts_with("ack:hub:7000/"));

    wait_until(|| inbox.len() == 1).await;
    let received = inbox.envelopes();
    assert_eq!(received[0].payload, Bytes::from_static(b"hello"));
    assert_eq!(received[0].sender.as_deref(), Some("client-1"));
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn unnamed_clients_do_not_borrow_the_server_identity() {
    let network = MemoryNetwork::new();
    let (hub, inbox) = server(&network, "hub", 7000).await;
    let first = build(&network, config(Mode::Client, "hub", 7000));
    let second = build(&network, config(Mode::Client, "hub", 7000));
    assert_ne!(first.node_id(), hub.node_id());
    assert_ne!(first.node_id(), second.node_id());

    first.start().await.expect("start first");
    second.start().await.expect("start second");
    first.send_message("one", "").await.expect("send first");
    second.send_message("two", "").await.expect("send second");

    wait_until(|| inbox.len() == 2).await;
    let mut senders: Vec<String> = inbox
        .envelopes()
        .into_iter()
        .filter_map(|envelope| envelope.sender)
        .collect();
    senders.sort();
    let mut expected = vec![first.node_id(), second.node_id()];
    expected.sort();
    assert_eq!(senders, expected);
    assert!(!senders.contains(&"hub:7000".to_owned()));

    first.stop().await.expect("stop first");
    second.stop().await.expect("stop second");
}

#[tokio::test]
async fn concurrent_sends_arrive_in_submission_order() {
    let network = MemoryNetwork::new();
    let (_hub, inbox) = server(&network, "hub", 7000).await;
    let client = build(&network, config(Mode::Client, "hub", 7000));
    client.start().await.expect("start");

    let payloads: Vec<String> = (0..32).map(|index| format!("m{index:02}")).collect();
    let results = join_all(
        payloads
            .iter()
            .map(|payload| client.send_message(Bytes::from(payload.clone()), "")),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));

    wait_until(|| inbox.len() == payloads.len()).await;
    let expected: Vec<Bytes> = payloads.into_iter().map(Bytes::from).collect();
    assert_eq!(inbox.payloads(), expected);
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn plugin_verdicts_shape_outbound_messages() {
    let network = MemoryNetwork::new();
    let (_hub, inbox) = server(&network, "hub", 7000).await;
    let client = build(&network, config(Mode::Client, "hub", 7000));
    client.start().await.expect("start");

    client
        .register_plugin(Arc::new(DropSecrets), PluginPosition::Last)
        .expect("register");
    let outcome = client.send_message("secret", "").await.expect("dropped is not an error");
    assert_eq!(
        outcome,
        SendOutcome::Dropped {
            plugin: "drop-secrets".to_owned()
        }
    );

    let veto = client
        .register_plugin(Arc::new(Veto), PluginPosition::First)
        .expect("register");
    let err = client.send_message("forbidden fruit", "").await.unwrap_err();
    assert!(matches!(err, DcfError::PluginRejected { ref plugin, .. } if plugin == "veto"));
    assert_eq!(err.code(), codes::PLUGIN_REJECTED);
    client.unregister_plugin(veto).expect("unregister");
    let err = client.unregister_plugin(veto).unwrap_err();
    assert_eq!(err.code(), codes::CONFIG_INVALID);

    let shout = client
        .register_plugin(Arc::new(Shout), PluginPosition::Last)
        .expect("register");
    client.send_message("quiet", "").await.expect("send");
    client.unregister_plugin(shout).expect("unregister");
    client.send_message("calm", "").await.expect("send");

    wait_until(|| inbox.len() == 2).await;
    assert_eq!(
        inbox.payloads(),
        vec![Bytes::from_static(b"QUIET"), Bytes::from_static(b"calm")]
    );
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn faulty_plugin_is_isolated_and_reported() {
    let network = MemoryNetwork::new();
    let (_hub, inbox) = server(&network, "hub", 7000).await;
    let client = build(&network, config(Mode::Client, "hub", 7000));
    client.start().await.expect("start");
    let mut events = client.subscribe();

    client
        .register_plugin(Arc::new(Faulty), PluginPosition::First)
        .expect("register");
    client
        .register_plugin(Arc::new(Shout), PluginPosition::Last)
        .expect("register");

    let outcome = client.send_message("still here", "").await.expect("fault is not fatal");
    assert!(matches!(outcome, SendOutcome::Delivered(_)));
    let fault = wait_event(&mut events, |event| matches!(event, SessionEvent::PluginFault { .. })).await;
    let SessionEvent::PluginFault { plugin, error } = fault else {
        unreachable!()
    };
    assert_eq!(plugin, "faulty");
    assert_eq!(error.code(), codes::PLUGIN_FAULT);

    wait_until(|| inbox.len() == 1).await;
    assert_eq!(inbox.payloads(), vec![Bytes::from_static(b"STILL HERE")]);
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn recipients_outside_the_topology_are_unknown() {
    let network = MemoryNetwork::new();
    let (_hub, _) = server(&network, "hub", 7000).await;

    let master = build(&network, master_config("edge", &[ep("hub", 7000)]));
    master.start().await.expect("master");
    let err = master.send_message("x", "ghost:1").await.unwrap_err();
    assert_eq!(err.code(), codes::RECIPIENT_UNKNOWN);
    let err = master.send_message("x", "not an endpoint").await.unwrap_err();
    assert_eq!(err.code(), codes::RECIPIENT_UNKNOWN);
    let outcome = master.send_message("x", "hub:7000").await.expect("member");
    assert!(matches!(outcome, SendOutcome::Delivered(_)));
    master.stop().await.expect("stop");

    let peer = build(&network, p2p_config("peer", &[ep("hub", 7000)]));
    peer.start().await.expect("p2p");
    let err = peer.send_message("x", "ghost:1").await.unwrap_err();
    assert!(matches!(err, DcfError::RecipientUnknown { .. }));
    peer.stop().await.expect("stop");
}

#[tokio::test]
async fn p2p_broadcasts_and_sends_direct() {
    let network = MemoryNetwork::new();
    let (_s1, inbox1) = server(&network, "store-1", 7201).await;
    let (_s2, inbox2) = server(&network, "store-2", 7202).await;
    let peer = build(
        &network,
        p2p_config("peer", &[ep("store-1", 7201), ep("store-2", 7202)]),
    );
    assert_eq!(peer.start().await.expect("start"), ResolvedMode::P2P);
    assert_eq!(peer.open_channels(), 2);

    let outcome = peer.send_message("to all", "").await.expect("broadcast");
    let SendOutcome::Broadcast(report) = outcome else {
        panic!("empty recipient broadcasts in p2p mode");
    };
    assert_eq!(report.delivered(), 2);
    assert_eq!(report.failed(), 0);
    assert!(report.get(&ep("store-1", 7201)).is_some());

    let outcome = peer.send_message("to two", "store-2:7202").await.expect("direct");
    assert!(
        outcome
            .ack_token()
            .expect("delivered")
            .as_str()
            .starts_with("ack:store-2:7202/")
    );

    wait_until(|| inbox1.len() == 1 && inbox2.len() == 2).await;
    assert_eq!(
        inbox2.payloads(),
        vec![Bytes::from_static(b"to all"), Bytes::from_static(b"to two")]
    );
    peer.stop().await.expect("stop");
}

#[tokio::test]
async fn p2p_nodes_that_name_each_other_form_a_mesh() {
    let network = MemoryNetwork::new();
    let mut a_cfg = p2p_config("peer-a", &[ep("peer-b", 7302)]);
    a_cfg.port = 7301;
    a_cfg.redundancy.retry_rounds = 10;
    let mut b_cfg = p2p_config("peer-b", &[ep("peer-a", 7301)]);
    b_cfg.port = 7302;
    b_cfg.redundancy.retry_rounds = 10;
    let a = build(&network, a_cfg);
    let b = build(&network, b_cfg);
    let inbox_b = Inbox::default();
    inbox_b.attach(&b);

    let (started_a, started_b) = tokio::join!(a.start(), b.start());
    assert_eq!(started_a.expect("a"), ResolvedMode::P2P);
    assert_eq!(started_b.expect("b"), ResolvedMode::P2P);

    a.send_message("over the mesh", "peer-b:7302")
        .await
        .expect("direct");
    wait_until(|| inbox_b.len() == 1).await;
    assert_eq!(inbox_b.envelopes()[0].sender.as_deref(), Some("peer-a:7301"));

    a.stop().await.expect("stop a");
    b.stop().await.expect("stop b");
}

#[tokio::test]
async fn server_replies_reach_the_client_handler() {
    let network = MemoryNetwork::new();
    let (hub, _) = server(&network, "hub", 7000).await;

    let err = hub.send_message("nobody", "").await.unwrap_err();
    assert_eq!(err.code(), codes::UNAVAILABLE);

    let client = build(&network, config(Mode::Client, "hub", 7000));
    let inbox = Inbox::default();
    inbox.attach(&client);
    client.start().await.expect("start");
    wait_until(|| hub.open_channels() == 1).await;

    let outcome = hub.send_message("down", "").await.expect("reply");
    assert!(matches!(outcome, SendOutcome::Delivered(_)));
    wait_until(|| inbox.len() == 1).await;
    assert_eq!(inbox.envelopes()[0].sender.as_deref(), Some("hub:7000"));

    client.clear_handler();
    hub.send_message("unheard", "").await.expect("still acknowledged");
    assert_eq!(inbox.len(), 1);
    client.stop().await.expect("stop");
}
