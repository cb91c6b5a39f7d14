//! 端点与冗余集合。
//!
//! - [`EndpointId`] 以 `(host, port)` 作为身份，文本形式为 `host:port`（IPv6 写作 `[::1]:80`）；
//! - [`Endpoint`] 在身份之外附带角色提示与故障转移优先级 `rank`（越小越优先）；
//! - [`RedundancySet`] 是按 `rank` 稳定排序、身份唯一的端点序列。

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::DcfError;

/// 端点身份。
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId {
    host: String,
    port: u16,
}

impl EndpointId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 以新端口派生身份，监听端口 0 被实际端口替换时使用。
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for EndpointId {
    type Err = DcfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let (host, port) = text
            .rsplit_once(':')
            .ok_or_else(|| DcfError::config(format!("endpoint `{text}` is not `host:port`")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(DcfError::config(format!("endpoint `{text}` has an empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| DcfError::config(format!("endpoint `{text}` has an invalid port")))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for EndpointId {
    type Error = DcfError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EndpointId> for String {
    fn from(value: EndpointId) -> Self {
        value.to_string()
    }
}

/// 端点在拓扑中的角色提示。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleHint {
    Master,
    Standby,
    #[default]
    Peer,
    Server,
}

/// 冗余集合中的一个候选端点。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub role: RoleHint,
    pub rank: u32,
}

impl Endpoint {
    pub fn new(id: EndpointId, role: RoleHint, rank: u32) -> Self {
        Self { id, role, rank }
    }
}

/// 按 `rank` 排序的候选端点序列。
///
/// - 相同 `rank` 保持插入顺序；
/// - 身份重复在构造时即被拒绝，返回 [`DcfError::ConfigInvalid`]。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RedundancySet {
    endpoints: Vec<Endpoint>,
}

impl RedundancySet {
    pub fn new(mut endpoints: Vec<Endpoint>) -> Result<Self, DcfError> {
        for (index, endpoint) in endpoints.iter().enumerate() {
            if endpoints[..index].iter().any(|seen| seen.id == endpoint.id) {
                return Err(DcfError::config(format!(
                    "endpoint `{}` appears twice in one redundancy set",
                    endpoint.id
                )));
            }
        }
        endpoints.sort_by_key(|endpoint| endpoint.rank);
        Ok(Self { endpoints })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn get(&self, id: &EndpointId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|endpoint| &endpoint.id == id)
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        self.get(id).is_some()
    }

    pub fn position(&self, id: &EndpointId) -> Option<usize> {
        self.endpoints.iter().position(|endpoint| &endpoint.id == id)
    }

    pub fn as_slice(&self) -> &[Endpoint] {
        &self.endpoints
    }
}
