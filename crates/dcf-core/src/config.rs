//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 以 `serde` + `toml` 承载节点配置，核心只消费经过 [`DcfConfig::validate`] 的结构；
//! - 所有结构错误统一映射为 [`DcfError::ConfigInvalid`]，并在任何网络活动之前暴露。
//!
//! ## 文件格式（What）
//! ```toml
//! mode = "master"
//! node_id = "edge-1"
//! host = "127.0.0.1"
//! port = 50051
//! masters = ["10.0.0.1:7000", { host = "10.0.0.2", port = 7000, rank = 5 }]
//!
//! [liveness]
//! interval_ms = 1000
//! miss_threshold = 3
//! ```
//! 字符串形式的冗余条目以列表位置作为 `rank`；表形式可显式给出 `rank` 与 `role`。

use std::{
    fs,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::{
    endpoint::{Endpoint, EndpointId, RedundancySet, RoleHint},
    error::DcfError,
    mode::Mode,
};

/// 冗余集合中的一条配置。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointEntry {
    Address(EndpointId),
    Detailed {
        host: String,
        port: u16,
        #[serde(default)]
        rank: Option<u32>,
        #[serde(default)]
        role: Option<RoleHint>,
    },
}

impl EndpointEntry {
    fn to_endpoint(&self, position: usize, default_role: RoleHint) -> Endpoint {
        let fallback_rank = u32::try_from(position).unwrap_or(u32::MAX);
        match self {
            EndpointEntry::Address(id) => Endpoint::new(id.clone(), default_role, fallback_rank),
            EndpointEntry::Detailed {
                host,
                port,
                rank,
                role,
            } => Endpoint::new(
                EndpointId::new(host.clone(), *port),
                role.unwrap_or(default_role),
                rank.unwrap_or(fallback_rank),
            ),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LivenessConfig {
    pub interval_ms: u64,
    pub miss_threshold: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            miss_threshold: 3,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub send_ms: u64,
    pub probe_ms: u64,
    pub handshake_ms: u64,
    pub drain_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 2000,
            send_ms: 5000,
            probe_ms: 500,
            handshake_ms: 2000,
            drain_ms: 200,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedundancyConfig {
    /// 冗余集合耗尽后的完整重拨轮数。
    pub retry_rounds: u32,
    pub retry_backoff_ms: u64,
    /// RTT 低于该阈值的端点归入 `Local` 分组。
    pub rtt_threshold_ms: u64,
}

impl Default for RedundancyConfig {
    fn default() -> Self {
        Self {
            retry_rounds: 3,
            retry_backoff_ms: 200,
            rtt_threshold_ms: 50,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// 重配置期间每个待重绑槽位的排队上限。
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

/// Auto 模式的探测目标类别。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Master,
    P2P,
    Client,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoConfig {
    pub probe_order: Vec<ProbeKind>,
    /// 是否接受远端下发的 `SetRole` / `UpdateConfig` 指令。
    pub accept_commands: bool,
}

impl Default for AutoConfig {
    fn default() -> Self {
        Self {
            probe_order: vec![ProbeKind::Master, ProbeKind::P2P, ProbeKind::Client],
            accept_commands: true,
        }
    }
}

/// 节点配置。
///
/// # 教案式说明
/// - **意图 (Why)**：Client/Server 使用 `host:port` 作为唯一远端或监听地址，P2P/Master 使用
///   冗余集合，其余字段调节存活探测、超时、重试与排队；
/// - **契约 (What)**：所有字段都有默认值；[`validate`](Self::validate) 是唯一的校验入口，
///   [`update`](Self::update) 在运行期按键更新单个字段；
/// - **风险 (Trade-offs)**：`deny_unknown_fields` 让拼写错误尽早失败，代价是旧配置文件中的
///   废弃字段也会被拒绝。
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DcfConfig {
    pub mode: Mode,
    pub node_id: Option<String>,
    pub host: String,
    pub port: u16,
    pub masters: Vec<EndpointEntry>,
    pub peers: Vec<EndpointEntry>,
    pub liveness: LivenessConfig,
    pub timeouts: TimeoutConfig,
    pub redundancy: RedundancyConfig,
    pub dispatch: DispatchConfig,
    pub auto: AutoConfig,
    pub plugins: Vec<String>,
}

impl Default for DcfConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Auto,
            node_id: None,
            host: "127.0.0.1".to_owned(),
            port: 50051,
            masters: Vec::new(),
            peers: Vec::new(),
            liveness: LivenessConfig::default(),
            timeouts: TimeoutConfig::default(),
            redundancy: RedundancyConfig::default(),
            dispatch: DispatchConfig::default(),
            auto: AutoConfig::default(),
            plugins: Vec::new(),
        }
    }
}

impl DcfConfig {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// 从 TOML 文本解析配置，不做语义校验。
    pub fn from_toml_str(text: &str) -> Result<Self, DcfError> {
        toml::from_str(text).map_err(|err| DcfError::config(err.to_string()))
    }

    /// 读取并解析配置文件。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DcfError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| DcfError::config(format!("read {}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, DcfError> {
        toml::to_string(self).map_err(|err| DcfError::config(err.to_string()))
    }

    /// 本节点标识；未显式配置时回落为 `host:port`。
    ///
    /// 只有 Server/P2P 的 `host:port` 是本节点自己的监听地址；其余模式下它指向远端，
    /// 由 [`assign_node_id`](Self::assign_node_id) 在构建会话时补上唯一标识。
    pub fn node_id(&self) -> String {
        match &self.node_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => self.local_endpoint().to_string(),
        }
    }

    /// 未显式配置标识、且 `host:port` 不是本节点监听地址时，生成
    /// `<mode>-<pid>-<纳秒时间戳>-<序号>` 形式的标识。已有标识时不做任何改动。
    pub fn assign_node_id(&mut self) {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);
        let explicit = self
            .node_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());
        if explicit || matches!(self.mode, Mode::Server | Mode::P2P) {
            return;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos() as u64);
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        self.node_id = Some(format!(
            "{}-{:x}-{nanos:x}-{sequence}",
            self.mode,
            std::process::id()
        ));
    }

    /// Client 模式的远端，亦即 Server/P2P 模式的监听地址。
    pub fn local_endpoint(&self) -> EndpointId {
        EndpointId::new(self.host.clone(), self.port)
    }

    pub fn master_set(&self) -> Result<RedundancySet, DcfError> {
        let endpoints = self
            .masters
            .iter()
            .enumerate()
            .map(|(position, entry)| {
                let default_role = if position == 0 {
                    RoleHint::Master
                } else {
                    RoleHint::Standby
                };
                entry.to_endpoint(position, default_role)
            })
            .collect();
        RedundancySet::new(endpoints)
    }

    pub fn peer_set(&self) -> Result<RedundancySet, DcfError> {
        let endpoints = self
            .peers
            .iter()
            .enumerate()
            .map(|(position, entry)| entry.to_endpoint(position, RoleHint::Peer))
            .collect();
        RedundancySet::new(endpoints)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness.interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.send_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.probe_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.handshake_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.drain_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.redundancy.retry_backoff_ms)
    }

    pub fn rtt_threshold(&self) -> Duration {
        Duration::from_millis(self.redundancy.rtt_threshold_ms)
    }

    fn has_client_target(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }

    /// 语义校验。插件名称的存在性由会话构建器对照插件注册表检查。
    pub fn validate(&self) -> Result<(), DcfError> {
        let masters = self.master_set()?;
        let peers = self.peer_set()?;

        match self.mode {
            Mode::Client if !self.has_client_target() => {
                return Err(DcfError::config(
                    "client mode requires a non-empty host and a non-zero port",
                ));
            }
            Mode::Server if self.host.trim().is_empty() => {
                return Err(DcfError::config("server mode requires a bind host"));
            }
            Mode::P2P if peers.is_empty() => {
                return Err(DcfError::config("p2p mode requires at least one peer"));
            }
            Mode::Master if masters.is_empty() => {
                return Err(DcfError::config("master mode requires at least one master"));
            }
            Mode::Auto => {
                if self.auto.probe_order.is_empty() {
                    return Err(DcfError::config("auto.probe_order must not be empty"));
                }
                let has_target = self.auto.probe_order.iter().any(|kind| match kind {
                    ProbeKind::Master => !masters.is_empty(),
                    ProbeKind::P2P => !peers.is_empty(),
                    ProbeKind::Client => self.has_client_target(),
                });
                if !has_target {
                    return Err(DcfError::config(
                        "auto mode has no probe target for its probe order",
                    ));
                }
            }
            _ => {}
        }

        if self.liveness.interval_ms == 0 {
            return Err(DcfError::config("liveness.interval_ms must be positive"));
        }
        if self.liveness.miss_threshold == 0 {
            return Err(DcfError::config("liveness.miss_threshold must be positive"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(DcfError::config("dispatch.queue_capacity must be positive"));
        }
        if self.timeouts.connect_ms == 0 || self.timeouts.send_ms == 0 {
            return Err(DcfError::config(
                "timeouts.connect_ms and timeouts.send_ms must be positive",
            ));
        }
        Ok(())
    }

    /// 运行期按键更新单个字段；未知键或无法解析的值返回 [`DcfError::ConfigInvalid`]。
    pub fn update(&mut self, key: &str, value: &str) -> Result<(), DcfError> {
        let value = value.trim();
        match key.trim() {
            "mode" => self.mode = value.parse()?,
            "node_id" => self.node_id = Some(value.to_owned()),
            "host" => self.host = value.to_owned(),
            "port" => self.port = parse_value(key, value)?,
            "rtt_threshold_ms" => self.redundancy.rtt_threshold_ms = parse_value(key, value)?,
            "queue_capacity" => {
                let capacity: usize = parse_value(key, value)?;
                if capacity == 0 {
                    return Err(DcfError::config("queue_capacity must be positive"));
                }
                self.dispatch.queue_capacity = capacity;
            }
            "liveness_interval_ms" => {
                let interval: u64 = parse_value(key, value)?;
                if interval == 0 {
                    return Err(DcfError::config("liveness_interval_ms must be positive"));
                }
                self.liveness.interval_ms = interval;
            }
            "miss_threshold" => {
                let threshold: u32 = parse_value(key, value)?;
                if threshold == 0 {
                    return Err(DcfError::config("miss_threshold must be positive"));
                }
                self.liveness.miss_threshold = threshold;
            }
            other => return Err(DcfError::config(format!("unknown config key `{other}`"))),
        }
        Ok(())
    }
}

fn parse_value<T: core::str::FromStr>(key: &str, value: &str) -> Result<T, DcfError> {
    value
        .parse()
        .map_err(|_| DcfError::config(format!("invalid value `{value}` for `{key}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DcfConfig::default();
        assert_eq!(config.mode, Mode::Auto);
        assert_eq!(config.node_id(), "127.0.0.1:50051");
        assert_eq!(config.liveness, LivenessConfig { interval_ms: 1000, miss_threshold: 3 });
        assert_eq!(config.redundancy.retry_rounds, 3);
        assert_eq!(config.dispatch.queue_capacity, 64);
        assert_eq!(
            config.auto.probe_order,
            [ProbeKind::Master, ProbeKind::P2P, ProbeKind::Client]
        );
    }

    #[test]
    fn dialing_modes_get_a_generated_node_id() {
        let mut client = DcfConfig::new(Mode::Client);
        client.assign_node_id();
        let first = client.node_id();
        assert!(first.starts_with("client-"), "{first}");
        assert_ne!(first, client.local_endpoint().to_string());

        let mut other = DcfConfig::new(Mode::Client);
        other.assign_node_id();
        assert_ne!(other.node_id(), first);

        client.assign_node_id();
        assert_eq!(client.node_id(), first);

        let mut named = DcfConfig::new(Mode::Master);
        named.node_id = Some("edge-1".into());
        named.assign_node_id();
        assert_eq!(named.node_id(), "edge-1");

        let mut server = DcfConfig::new(Mode::Server);
        server.assign_node_id();
        assert_eq!(server.node_id, None);
        assert_eq!(server.node_id(), "127.0.0.1:50051");
    }

    #[test]
    fn parses_mixed_redundancy_entries() {
        let config = DcfConfig::from_toml_str(
            r#"
            mode = "master"
            masters = ["10.0.0.1:7000", { host = "10.0.0.2", port = 7001, rank = 0, role = "standby" }]

            [liveness]
            interval_ms = 250
            "#,
        )
        .expect("parse");
        assert_eq!(config.mode, Mode::Master);
        assert_eq!(config.liveness.interval_ms, 250);
        assert_eq!(config.liveness.miss_threshold, 3);

        let set = config.master_set().expect("set");
        let ordered: Vec<String> = set.iter().map(|e| e.id.to_string()).collect();
        // 显式 rank 0 与位置 rank 0 并列，保持书写顺序。
        assert_eq!(ordered, ["10.0.0.1:7000", "10.0.0.2:7001"]);
        assert_eq!(set.as_slice()[1].role, RoleHint::Standby);
        config.validate().expect("valid");
    }

    #[test]
    fn rejects_structural_violations() {
        assert!(DcfConfig::new(Mode::P2P).validate().is_err());
        assert!(DcfConfig::new(Mode::Master).validate().is_err());

        let mut client = DcfConfig::new(Mode::Client);
        client.port = 0;
        assert!(client.validate().is_err());

        let mut dup = DcfConfig::new(Mode::P2P);
        dup.peers = vec![
            EndpointEntry::Address(EndpointId::new("a", 1)),
            EndpointEntry::Address(EndpointId::new("a", 1)),
        ];
        assert_eq!(
            dup.validate().unwrap_err().code(),
            crate::error::codes::CONFIG_INVALID
        );

        let mut zero = DcfConfig::new(Mode::Server);
        zero.dispatch.queue_capacity = 0;
        assert!(zero.validate().is_err());

        assert!(DcfConfig::from_toml_str("mode = \"mesh\"").is_err());
        assert!(DcfConfig::from_toml_str("[auto]\nprobe_order = [\"dns\"]").is_err());
        assert!(DcfConfig::from_toml_str("colour = 1").is_err());
    }

    #[test]
    fn auto_requires_a_probe_target() {
        let mut config = DcfConfig::new(Mode::Auto);
        config.auto.probe_order = vec![ProbeKind::Master, ProbeKind::P2P];
        assert!(config.validate().is_err());
        config.peers = vec![EndpointEntry::Address(EndpointId::new("p", 2))];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn update_applies_known_keys() {
        let mut config = DcfConfig::default();
        config.update("mode", "P2P").expect("mode");
        config.update("port", "9100").expect("port");
        config.update("queue_capacity", "8").expect("capacity");
        assert_eq!(config.mode, Mode::P2P);
        assert_eq!(config.port, 9100);
        assert_eq!(config.dispatch.queue_capacity, 8);

        assert!(config.update("port", "not-a-port").is_err());
        assert!(config.update("queue_capacity", "0").is_err());
        assert!(config.update("unknown", "1").is_err());
    }
}
