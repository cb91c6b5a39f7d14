//! 模式接线：按解析出的模式建立通道、监听与冗余集合。
//!
//! 所有函数都在 `runtime` 锁内、停止信号的 `select!` 之下执行。

use std::{collections::HashSet, sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use super::SessionInner;
use crate::{
    channel::Channel,
    config::ProbeKind,
    dispatcher::RoutingPolicy,
    endpoint::{EndpointId, RedundancySet},
    error::DcfError,
    event::SessionEvent,
    mode::{Mode, ResolvedMode, Topology},
    redundancy::{RedundancyEvent, SetRole},
    transport::{self, Acceptor},
};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

impl SessionInner {
    pub(super) async fn wire(&self, mode: Mode) -> Result<ResolvedMode, DcfError> {
        self.generation
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        match mode.resolved() {
            Some(resolved) => {
                self.wire_resolved(resolved, true).await?;
                Ok(resolved)
            }
            None => {
                let resolved = self.resolve_auto().await?;
                self.wire_resolved(resolved, false).await?;
                Ok(resolved)
            }
        }
    }

    async fn wire_resolved(&self, mode: ResolvedMode, install: bool) -> Result<(), DcfError> {
        match mode {
            ResolvedMode::Client => self.wire_client().await,
            ResolvedMode::Server => self.wire_server().await,
            ResolvedMode::P2P => self.wire_p2p(install).await,
            ResolvedMode::Master => self.wire_master(install).await,
        }
    }

    /// Auto 模式：按 `probe_order` 依次探测，第一个有可达端点的类别即为结果。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：探测得到的 RTT 写入冗余管理器，失败的端点标记为不可达；全部类别都
    ///   无可达端点时返回 [`DcfError::ConfigInvalid`]；
    /// - **风险 (Trade-offs)**：探测逐个串行进行，最坏耗时为端点数乘以探测超时。
    async fn resolve_auto(&self) -> Result<ResolvedMode, DcfError> {
        let (order, masters, peers, client, node_id, timeout) = {
            let config = self.config.read();
            (
                config.auto.probe_order.clone(),
                config.master_set()?,
                config.peer_set()?,
                config.local_endpoint(),
                config.node_id(),
                config.probe_timeout(),
            )
        };
        self.redundancy.install(SetRole::Masters, &masters);
        self.redundancy.install(SetRole::Peers, &peers);

        for kind in order {
            let (resolved, reachable) = match kind {
                ProbeKind::Master => (
                    ResolvedMode::Master,
                    self.probe_set(SetRole::Masters, &masters, &node_id, timeout)
                        .await,
                ),
                ProbeKind::P2P => (
                    ResolvedMode::P2P,
                    self.probe_set(SetRole::Peers, &peers, &node_id, timeout)
                        .await,
                ),
                ProbeKind::Client => {
                    if client.port() == 0 || client.host().trim().is_empty() {
                        continue;
                    }
                    let reachable = transport::probe(
                        self.connector.as_ref(),
                        &client,
                        &node_id,
                        timeout,
                    )
                    .await
                    .inspect_err(|err| debug!(endpoint = %client, error = %err, "client probe failed"))
                    .is_ok();
                    (ResolvedMode::Client, reachable)
                }
            };
            if reachable {
                info!(mode = %resolved, probe = ?kind, "auto mode resolved");
                return Ok(resolved);
            }
        }
        Err(DcfError::config(
            "auto mode found no reachable endpoint in its probe order",
        ))
    }

    async fn probe_set(
        &self,
        role: SetRole,
        set: &RedundancySet,
        node_id: &str,
        timeout: Duration,
    ) -> bool {
        let mut reachable = false;
        for endpoint in set.iter() {
            match transport::probe(self.connector.as_ref(), &endpoint.id, node_id, timeout).await {
                Ok(rtt) => {
                    debug!(role = %role, endpoint = %endpoint.id, rtt_us = rtt.as_micros() as u64, "probe answered");
                    self.redundancy.record_rtt(role, &endpoint.id, rtt);
                    reachable = true;
                }
                Err(err) => {
                    debug!(role = %role, endpoint = %endpoint.id, error = %err, "probe failed");
                    self.publish_redundancy(self.redundancy.report_unreachable(role, &endpoint.id));
                }
            }
        }
        reachable
    }

    async fn wire_client(&self) -> Result<(), DcfError> {
        let endpoint = self.config.read().local_endpoint();
        self.dispatcher.set_policy(RoutingPolicy::Client);
        *self.topology.lock() = Some(Topology::Client {
            endpoint: endpoint.clone(),
        });
        let channel = self.redial(&endpoint, true).await?;
        self.install_channel(channel, true);
        Ok(())
    }

    async fn wire_server(&self) -> Result<(), DcfError> {
        let bind = self.config.read().local_endpoint();
        let acceptor = self.connector.listen(&bind).await?;
        let local = acceptor.local_endpoint();
        info!(endpoint = %local, "server listening");
        *self.local_endpoint.lock() = Some(local.clone());
        self.dispatcher.set_policy(RoutingPolicy::Server);
        *self.topology.lock() = Some(Topology::Server { bind: local });
        self.spawn_accept_loop(acceptor, true);
        Ok(())
    }

    async fn wire_p2p(&self, install: bool) -> Result<(), DcfError> {
        let (bind, roster) = {
            let config = self.config.read();
            (config.local_endpoint(), config.peer_set()?)
        };
        let acceptor = self.connector.listen(&bind).await?;
        let local = acceptor.local_endpoint();
        info!(endpoint = %local, peers = roster.len(), "p2p node listening");
        *self.local_endpoint.lock() = Some(local.clone());
        let targets: Vec<EndpointId> = roster
            .iter()
            .map(|peer| peer.id.clone())
            .filter(|id| *id != local && *id != bind)
            .collect();
        self.dispatcher.set_policy(RoutingPolicy::P2P {
            roster: targets.iter().cloned().collect(),
        });
        *self.topology.lock() = Some(Topology::P2P {
            listen: local.clone(),
            roster: roster.clone(),
        });
        self.spawn_accept_loop(acceptor, false);
        if install {
            self.redundancy.install(SetRole::Peers, &roster);
        }
        let live: HashSet<EndpointId> = self
            .redundancy
            .snapshot(SetRole::Peers)
            .into_iter()
            .filter(|status| status.live)
            .map(|status| status.endpoint.id)
            .collect();

        for peer in targets.iter().filter(|peer| live.contains(*peer)) {
            self.connect_peer(peer).await?;
        }
        if self.dispatcher.channels().is_empty() {
            let (rounds, backoff) = self.retry_policy();
            for round in 1..=rounds {
                self.pause(backoff).await?;
                debug!(round, "retrying p2p peers");
                for peer in &targets {
                    self.connect_peer(peer).await?;
                }
                if !self.dispatcher.channels().is_empty() {
                    break;
                }
            }
        }
        if self.dispatcher.channels().is_empty() {
            return Err(DcfError::master_unreachable(SetRole::Peers));
        }
        Ok(())
    }

    /// 拨号单个对等节点，结果计入冗余管理器。只有取消会作为错误返回。
    async fn connect_peer(&self, peer: &EndpointId) -> Result<(), DcfError> {
        match self.dial(peer).await {
            Ok(channel) => {
                self.publish_redundancy(self.redundancy.report_recovered(SetRole::Peers, peer));
                self.install_channel(channel, false);
                Ok(())
            }
            Err(err @ DcfError::Cancelled { .. }) => Err(err),
            Err(err) => {
                warn!(peer = %peer, error = %err, "peer unreachable");
                self.publish_redundancy(self.redundancy.report_unreachable(SetRole::Peers, peer));
                Ok(())
            }
        }
    }

    async fn wire_master(&self, install: bool) -> Result<(), DcfError> {
        let set = self.config.read().master_set()?;
        let members = set.iter().map(|endpoint| endpoint.id.clone()).collect();
        self.dispatcher.set_policy(RoutingPolicy::Master { members });
        *self.topology.lock() = Some(Topology::Master { set: set.clone() });
        if install {
            self.redundancy.install(SetRole::Masters, &set);
        }
        let channel = match self.walk_masters(None).await? {
            Some(channel) => channel,
            None => self.retry_masters().await?,
        };
        self.install_channel(channel, true);
        Ok(())
    }

    /// 沿 rank 顺序尝试活动主节点，失败即故障转移到下一个，直到成功或集合耗尽。
    pub(super) async fn walk_masters(
        &self,
        mut candidate: Option<EndpointId>,
    ) -> Result<Option<Channel>, DcfError> {
        loop {
            let Some(target) = candidate
                .take()
                .or_else(|| self.redundancy.active(SetRole::Masters))
            else {
                return Ok(None);
            };
            match self.dial(&target).await {
                Ok(channel) => return Ok(Some(channel)),
                Err(err @ DcfError::Cancelled { .. }) => return Err(err),
                Err(err) => {
                    warn!(master = %target, error = %err, "master unreachable");
                    let event = self.redundancy.report_unreachable(SetRole::Masters, &target);
                    let exhausted = matches!(event, Some(RedundancyEvent::Exhausted { .. }));
                    self.publish_redundancy(event);
                    if exhausted {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// 集合耗尽后的重试轮次：每轮退避后按 rank 顺序拨号全部成员。
    pub(super) async fn retry_masters(&self) -> Result<Channel, DcfError> {
        let (rounds, backoff) = self.retry_policy();
        for round in 1..=rounds {
            self.pause(backoff).await?;
            for master in self.redundancy.members(SetRole::Masters) {
                match self.dial(&master).await {
                    Ok(channel) => {
                        info!(master = %master, round, "master reachable again");
                        self.publish_redundancy(
                            self.redundancy.report_recovered(SetRole::Masters, &master),
                        );
                        return Ok(channel);
                    }
                    Err(err @ DcfError::Cancelled { .. }) => return Err(err),
                    Err(err) => debug!(master = %master, round, error = %err, "retry failed"),
                }
            }
        }
        Err(DcfError::master_unreachable(SetRole::Masters))
    }

    /// 对单个端点拨号；`immediate` 为真时先立即尝试一次，再执行退避重试轮次。
    /// 全部失败时返回最后一次的错误。
    pub(super) async fn redial(
        &self,
        endpoint: &EndpointId,
        immediate: bool,
    ) -> Result<Channel, DcfError> {
        let (rounds, backoff) = self.retry_policy();
        let mut last = None;
        let attempts = rounds + u32::from(immediate);
        for attempt in 0..attempts {
            if attempt > 0 || !immediate {
                self.pause(backoff).await?;
            }
            match self.dial(endpoint).await {
                Ok(channel) => return Ok(channel),
                Err(err @ DcfError::Cancelled { .. }) => return Err(err),
                Err(err) => {
                    debug!(endpoint = %endpoint, attempt, error = %err, "dial failed");
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| DcfError::closed(endpoint)))
    }

    pub(super) async fn dial(&self, endpoint: &EndpointId) -> Result<Channel, DcfError> {
        let options = self.channel_options();
        self.until_stopped(
            "dial",
            Channel::dial(self.connector.as_ref(), endpoint, options, self.observer()),
        )
        .await
    }

    pub(super) fn retry_policy(&self) -> (u32, Duration) {
        let config = self.config.read();
        (config.redundancy.retry_rounds, config.retry_backoff())
    }

    /// 把新通道放入分发器并发布 `ChannelOpened`。
    pub(super) fn install_channel(&self, channel: Channel, sole: bool) {
        let endpoint = channel.endpoint().clone();
        if let Some(previous) = self.dispatcher.insert_channel(channel, sole) {
            previous.abort();
        }
        self.events
            .publish(SessionEvent::ChannelOpened { endpoint });
    }

    pub(super) fn publish_redundancy(&self, event: Option<RedundancyEvent>) {
        let Some(event) = event else {
            return;
        };
        match event {
            RedundancyEvent::Failover { role, from, to } => {
                self.events.publish(SessionEvent::Failover { role, from, to });
            }
            RedundancyEvent::Exhausted { role, error, .. } => {
                self.events.publish(SessionEvent::Exhausted { role, error });
            }
            RedundancyEvent::Recovered { .. } => {}
        }
    }

    /// 监听循环。`routable` 为真时入站通道进入分发器（Server），否则只收（P2P）。
    fn spawn_accept_loop(&self, acceptor: Box<dyn Acceptor>, routable: bool) {
        let Some(session) = self.arc() else {
            return;
        };
        let handle = tokio::spawn(accept_loop(session, acceptor, routable));
        self.listeners.lock().push(handle);
    }
}

async fn accept_loop(session: Arc<SessionInner>, acceptor: Box<dyn Acceptor>, routable: bool) {
    let local = acceptor.local_endpoint();
    let generation = session.current_generation();
    let mut stop = session.stop_tx.subscribe();
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            accepted = acceptor.accept() => accepted,
        };
        let link = match accepted {
            Ok(link) => link,
            Err(err) if err.is_retryable() => {
                debug!(endpoint = %local, error = %err, "accept failed, retrying");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
            Err(err) => {
                warn!(endpoint = %local, error = %err, "listener stopped");
                break;
            }
        };
        let options = session.channel_options();
        let observer = session.observer();
        let session = session.clone();
        tokio::spawn(async move {
            let channel = match Channel::accept(link, options, observer).await {
                Ok(channel) => channel,
                Err(err) => {
                    debug!(error = %err, "inbound handshake failed");
                    return;
                }
            };
            if session.stopping() || session.current_generation() != generation {
                channel.abort();
                return;
            }
            let endpoint = channel.endpoint().clone();
            if routable {
                if let Some(previous) = session.dispatcher.insert_channel(channel, false) {
                    previous.abort();
                }
            } else {
                session.accepted.insert(channel.id(), channel);
            }
            session
                .events
                .publish(SessionEvent::ChannelOpened { endpoint });
        });
    }
}
