//! 监督任务：通道丢失后的恢复、P2P 名册的周期补连与远端控制指令的应用。

use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use super::{SessionInner, Signal, TopologyState};
use crate::{
    channel::Channel,
    dispatcher::Slot,
    error::DcfError,
    event::SessionEvent,
    frame::ControlCommand,
    mode::{Mode, ResolvedMode},
    redundancy::{RedundancyEvent, SetRole},
};

pub(super) async fn supervise(
    session: Arc<SessionInner>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    mut stop: watch::Receiver<bool>,
) {
    let mut maintenance = tokio::time::interval(session.config.read().liveness_interval());
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = async { drop(stop.wait_for(|stopped| *stopped).await) } => break,
            signal = signals.recv() => match signal {
                Some(Signal::Lost {
                    channel,
                    error,
                    generation,
                }) => session.recover(channel, error, generation).await,
                Some(Signal::Control { channel, command }) => {
                    session.apply_control(&channel, command).await;
                }
                None => break,
            },
            _ = maintenance.tick() => session.maintain_peers().await,
        }
    }
    debug!("supervisor exited");
}

impl SessionInner {
    /// 处理一条拨号通道的丢失。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：
    ///   - Client：对同一端点重拨，耗尽后进入 `Failed`，排队发送以 `MasterUnreachable` 结束；
    ///   - Master：沿冗余集合故障转移，集合耗尽后再执行重试轮次，仍失败则 `Failed`；
    ///   - P2P：只重拨丢失的对等节点，失败时仅该槽位的排队发送失败，该节点留给
    ///     [`maintain_peers`](Self::maintain_peers) 继续补连；全部对等节点都丢失时 `Failed`；
    /// - **执行 (How)**：恢复期间状态为 `Reconfiguring(mode)`，成功后以新通道冲刷重绑队列；
    /// - **风险 (Trade-offs)**：丢失信号与重配置竞争时，以接线代数判定信号是否过期。
    async fn recover(&self, channel: Channel, error: DcfError, generation: u64) {
        let _guard = self.runtime.lock().await;
        if self.stopping() || generation != self.current_generation() {
            return;
        }
        let mode = match self.state.get() {
            TopologyState::Running(mode) => mode,
            other => {
                debug!(state = %other, endpoint = %channel.endpoint(), "channel loss ignored");
                return;
            }
        };
        warn!(mode = %mode, endpoint = %channel.endpoint(), error = %error, "channel lost, recovering");
        if self
            .state
            .transition("recover", TopologyState::Reconfiguring(mode))
            .is_err()
        {
            return;
        }
        let outcome = match mode {
            ResolvedMode::Client => self.recover_client(&channel).await,
            ResolvedMode::Master => self.recover_master(&channel).await,
            ResolvedMode::P2P => self.recover_peer(&channel).await,
            ResolvedMode::Server => Ok(()),
        };
        match outcome {
            Ok(()) => {
                let _ = self.state.transition("recover", TopologyState::Running(mode));
            }
            Err(DcfError::Cancelled { .. }) => {}
            Err(err) => {
                self.dispatcher.abort_all(err.clone());
                self.teardown().await;
                self.fail(err);
            }
        }
    }

    async fn recover_client(&self, lost: &Channel) -> Result<(), DcfError> {
        match self.redial(lost.endpoint(), true).await {
            Ok(channel) => {
                self.rebound(Slot::Sole, channel);
                Ok(())
            }
            Err(err @ DcfError::Cancelled { .. }) => Err(err),
            Err(err) => {
                warn!(endpoint = %lost.endpoint(), error = %err, "server unreachable after retries");
                Err(DcfError::master_unreachable("server"))
            }
        }
    }

    async fn recover_master(&self, lost: &Channel) -> Result<(), DcfError> {
        let event = self
            .redundancy
            .report_unreachable(SetRole::Masters, lost.endpoint());
        let next = match &event {
            Some(RedundancyEvent::Failover { to, .. }) => Some(to.clone()),
            _ => None,
        };
        let exhausted = matches!(event, Some(RedundancyEvent::Exhausted { .. }));
        self.publish_redundancy(event);

        let walked = if exhausted {
            None
        } else {
            self.walk_masters(next).await?
        };
        let channel = match walked {
            Some(channel) => channel,
            None => self.retry_masters().await?,
        };
        self.rebound(Slot::Sole, channel);
        Ok(())
    }

    async fn recover_peer(&self, lost: &Channel) -> Result<(), DcfError> {
        let peer = lost.endpoint().clone();
        self.publish_redundancy(self.redundancy.report_unreachable(SetRole::Peers, &peer));
        match self.redial(&peer, true).await {
            Ok(channel) => {
                self.publish_redundancy(self.redundancy.report_recovered(SetRole::Peers, &peer));
                self.rebound(Slot::Peer(peer), channel);
                Ok(())
            }
            Err(err @ DcfError::Cancelled { .. }) => Err(err),
            Err(err) => {
                warn!(peer = %peer, error = %err, "peer unreachable after retries");
                self.dispatcher
                    .abort_rebind(&Slot::Peer(peer), DcfError::master_unreachable(SetRole::Peers));
                if self.dispatcher.channels().is_empty() {
                    Err(DcfError::master_unreachable(SetRole::Peers))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// 周期补连：为名册中没有通道的对等节点各拨号一次。
    ///
    /// # 教案式说明
    /// - **契约 (What)**：仅在 `Running(P2P)` 下生效；启动时不可达、或恢复时重试耗尽的对等节点
    ///   一旦可达即重新进入分发器，冗余管理器同步标记为存活；
    /// - **执行 (How)**：持 `runtime` 锁串行拨号，与恢复、重配置互斥；失败只记 `debug` 日志，
    ///   下一个周期再试；
    /// - **风险 (Trade-offs)**：持锁期间的停止由拨号上的停止信号打断。
    async fn maintain_peers(&self) {
        if self.dispatcher.absent_peers().is_empty() {
            return;
        }
        let _guard = self.runtime.lock().await;
        if self.stopping() || self.state.get() != TopologyState::Running(ResolvedMode::P2P) {
            return;
        }
        for peer in self.dispatcher.absent_peers() {
            match self.dial(&peer).await {
                Ok(channel) => {
                    info!(peer = %peer, "peer reachable again");
                    self.publish_redundancy(
                        self.redundancy.report_recovered(SetRole::Peers, &peer),
                    );
                    self.install_channel(channel, false);
                }
                Err(DcfError::Cancelled { .. }) => return,
                Err(err) => debug!(peer = %peer, error = %err, "peer still unreachable"),
            }
        }
    }

    fn rebound(&self, slot: Slot, channel: Channel) {
        let endpoint = channel.endpoint().clone();
        self.dispatcher.complete_rebind(slot, channel);
        info!(endpoint = %endpoint, "channel rebound");
        self.events.publish(SessionEvent::ChannelOpened {
            endpoint: endpoint.clone(),
        });
        self.events.publish(SessionEvent::Rebound { endpoint });
    }

    /// 应用远端控制指令。仅当节点以 Auto 模式构建且允许远端指令时生效。
    async fn apply_control(&self, channel: &Channel, command: ControlCommand) {
        let accepts = self.configured_mode == Mode::Auto && self.config.read().auto.accept_commands;
        if !accepts {
            info!(from = %channel.endpoint(), command = ?command, "control command ignored");
            return;
        }
        let applied = match &command {
            ControlCommand::SetRole(mode) => {
                let _guard = self.runtime.lock().await;
                self.reconfigure_locked(*mode).await.map(|_| ())
            }
            ControlCommand::UpdateConfig { key, value } => self.apply_update(key, value),
        };
        match applied {
            Ok(()) => {
                info!(from = %channel.endpoint(), command = ?command, "control command applied");
                self.events.publish(SessionEvent::ControlApplied { command });
            }
            Err(err) => {
                warn!(from = %channel.endpoint(), command = ?command, error = %err, "control command failed");
            }
        }
    }

    pub(super) fn apply_update(&self, key: &str, value: &str) -> Result<(), DcfError> {
        let (capacity, threshold) = {
            let mut config = self.config.write();
            config.update(key, value)?;
            (config.dispatch.queue_capacity, config.rtt_threshold())
        };
        self.dispatcher.set_queue_capacity(capacity);
        self.redundancy.set_rtt_threshold(threshold);
        Ok(())
    }
}
