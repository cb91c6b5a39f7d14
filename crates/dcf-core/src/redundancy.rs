//! # redundancy 模块说明
//!
//! ## 角色定位（Why）
//! - 为每个逻辑角色（主节点候选、对等节点名册）维护按 `rank` 排序的端点集合与当前活动下标；
//! - 故障转移与恢复只在这里发生，拓扑控制器只读取结果。
//!
//! ## 契约（What）
//! - [`RedundancyManager::report_unreachable`]：标记不可达；若它是活动端点，则按 rank 顺序切到
//!   下一个存活端点并产生 `Failover`；若已无存活端点，产生带 [`DcfError::MasterUnreachable`]
//!   的 `Exhausted`，从不静默丢失连通性；
//! - [`RedundancyManager::report_recovered`]：重新标记存活，不抢占当前健康的活动端点；集合
//!   已耗尽时，恢复的端点成为活动端点；
//! - RTT 分组沿用健康检查的三分法：低于阈值为 `Local`，否则为 `Remote`，报告不可达后为
//!   `Unreachable`；测量来自 Auto 探测与拨号通道的 `Ping`/`Pong`。
//!
//! ## 并发（How）
//! - 全部状态位于一把 `parking_lot::Mutex` 之下；事件作为返回值交给调用方，在释放锁之后
//!   记录日志，由会话转成 `SessionEvent` 发布。

use std::{collections::HashMap, fmt, time::Duration};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{
    endpoint::{Endpoint, EndpointId, RedundancySet},
    error::DcfError,
};

/// 冗余集合对应的逻辑角色。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SetRole {
    Masters,
    Peers,
}

impl fmt::Display for SetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SetRole::Masters => "masters",
            SetRole::Peers => "peers",
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RttGroup {
    Unmeasured,
    Local,
    Remote,
    Unreachable,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RedundancyEvent {
    Failover {
        role: SetRole,
        from: EndpointId,
        to: EndpointId,
    },
    Exhausted {
        role: SetRole,
        last: EndpointId,
        error: DcfError,
    },
    Recovered {
        role: SetRole,
        endpoint: EndpointId,
        /// 恢复的端点是否因集合已耗尽而成为活动端点。
        activated: bool,
    },
}

/// 只读状态视图。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointStatus {
    pub endpoint: Endpoint,
    pub live: bool,
    pub active: bool,
    pub rtt: Option<Duration>,
    pub group: RttGroup,
}

#[derive(Debug)]
struct Member {
    endpoint: Endpoint,
    live: bool,
    rtt: Option<Duration>,
    group: RttGroup,
}

#[derive(Debug, Default)]
struct RoleState {
    members: Vec<Member>,
    active: Option<usize>,
}

impl RoleState {
    fn position(&self, id: &EndpointId) -> Option<usize> {
        self.members.iter().position(|member| &member.endpoint.id == id)
    }

    fn first_live(&self) -> Option<usize> {
        self.members.iter().position(|member| member.live)
    }
}

pub struct RedundancyManager {
    roles: Mutex<HashMap<SetRole, RoleState>>,
    rtt_threshold: Mutex<Duration>,
}

impl RedundancyManager {
    pub fn new(rtt_threshold: Duration) -> Self {
        Self {
            roles: Mutex::new(HashMap::new()),
            rtt_threshold: Mutex::new(rtt_threshold),
        }
    }

    /// 装载（或替换）某角色的集合；rank 最小的端点成为活动端点。
    pub fn install(&self, role: SetRole, set: &RedundancySet) {
        let members: Vec<Member> = set
            .iter()
            .map(|endpoint| Member {
                endpoint: endpoint.clone(),
                live: true,
                rtt: None,
                group: RttGroup::Unmeasured,
            })
            .collect();
        let active = if members.is_empty() { None } else { Some(0) };
        self.roles
            .lock()
            .insert(role, RoleState { members, active });
    }

    /// 释放全部集合。
    pub fn clear(&self) {
        self.roles.lock().clear();
    }

    pub fn set_rtt_threshold(&self, threshold: Duration) {
        *self.rtt_threshold.lock() = threshold;
    }

    pub fn active(&self, role: SetRole) -> Option<EndpointId> {
        let roles = self.roles.lock();
        let state = roles.get(&role)?;
        state
            .active
            .map(|index| state.members[index].endpoint.id.clone())
    }

    pub fn live_count(&self, role: SetRole) -> usize {
        self.roles
            .lock()
            .get(&role)
            .map_or(0, |state| state.members.iter().filter(|m| m.live).count())
    }

    /// rank 顺序下的全部成员，供重试轮次使用。
    pub fn members(&self, role: SetRole) -> Vec<EndpointId> {
        self.roles
            .lock()
            .get(&role)
            .map(|state| state.members.iter().map(|m| m.endpoint.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn report_unreachable(&self, role: SetRole, id: &EndpointId) -> Option<RedundancyEvent> {
        let event = {
            let mut roles = self.roles.lock();
            let state = roles.get_mut(&role)?;
            let index = state.position(id)?;
            let was_live = state.members[index].live;
            state.members[index].live = false;
            state.members[index].group = RttGroup::Unreachable;

            if state.active == Some(index) || (state.active.is_none() && was_live) {
                match state.first_live() {
                    Some(next) => {
                        state.active = Some(next);
                        Some(RedundancyEvent::Failover {
                            role,
                            from: id.clone(),
                            to: state.members[next].endpoint.id.clone(),
                        })
                    }
                    None => {
                        state.active = None;
                        Some(RedundancyEvent::Exhausted {
                            role,
                            last: id.clone(),
                            error: DcfError::master_unreachable(role),
                        })
                    }
                }
            } else if was_live && state.first_live().is_none() {
                state.active = None;
                Some(RedundancyEvent::Exhausted {
                    role,
                    last: id.clone(),
                    error: DcfError::master_unreachable(role),
                })
            } else {
                None
            }
        };
        if let Some(event) = &event {
            self.announce(event);
        }
        event
    }

    pub fn report_recovered(&self, role: SetRole, id: &EndpointId) -> Option<RedundancyEvent> {
        let event = {
            let mut roles = self.roles.lock();
            let state = roles.get_mut(&role)?;
            let index = state.position(id)?;
            let member = &mut state.members[index];
            if member.live {
                None
            } else {
                member.live = true;
                member.group = match member.rtt {
                    Some(rtt) => self.group_for(rtt),
                    None => RttGroup::Unmeasured,
                };
                let activated = state.active.is_none();
                if activated {
                    state.active = Some(index);
                }
                Some(RedundancyEvent::Recovered {
                    role,
                    endpoint: id.clone(),
                    activated,
                })
            }
        };
        if let Some(event) = &event {
            self.announce(event);
        }
        event
    }

    /// 记录一次 RTT 测量，并刷新存活端点的分组。
    pub fn record_rtt(&self, role: SetRole, id: &EndpointId, rtt: Duration) {
        let group = self.group_for(rtt);
        let mut roles = self.roles.lock();
        if let Some(member) = roles
            .get_mut(&role)
            .and_then(|state| state.members.iter_mut().find(|m| &m.endpoint.id == id))
        {
            member.rtt = Some(rtt);
            if member.live {
                member.group = group;
            }
        }
    }

    /// 延迟最低的存活端点；未测量的排在最后，rank 作为平局裁决。
    pub fn optimal_route(&self, role: SetRole, exclude: Option<&EndpointId>) -> Option<EndpointId> {
        let roles = self.roles.lock();
        let state = roles.get(&role)?;
        state
            .members
            .iter()
            .enumerate()
            .filter(|(_, member)| member.live && Some(&member.endpoint.id) != exclude)
            .min_by_key(|(index, member)| (member.rtt.is_none(), member.rtt, *index))
            .map(|(_, member)| member.endpoint.id.clone())
    }

    pub fn snapshot(&self, role: SetRole) -> Vec<EndpointStatus> {
        let roles = self.roles.lock();
        let Some(state) = roles.get(&role) else {
            return Vec::new();
        };
        state
            .members
            .iter()
            .enumerate()
            .map(|(index, member)| EndpointStatus {
                endpoint: member.endpoint.clone(),
                live: member.live,
                active: state.active == Some(index),
                rtt: member.rtt,
                group: member.group,
            })
            .collect()
    }

    fn group_for(&self, rtt: Duration) -> RttGroup {
        if rtt < *self.rtt_threshold.lock() {
            RttGroup::Local
        } else {
            RttGroup::Remote
        }
    }

    fn announce(&self, event: &RedundancyEvent) {
        match event {
            RedundancyEvent::Failover { role, from, to } => {
                warn!(role = %role, from = %from, to = %to, "failover to next endpoint");
            }
            RedundancyEvent::Exhausted { role, last, .. } => {
                warn!(role = %role, last = %last, "redundancy set exhausted");
            }
            RedundancyEvent::Recovered {
                role,
                endpoint,
                activated,
            } => {
                info!(role = %role, endpoint = %endpoint, activated, "endpoint recovered");
            }
        }
    }
}
