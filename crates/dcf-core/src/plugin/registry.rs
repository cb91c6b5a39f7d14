use std::sync::Arc;

use dashmap::DashMap;

use super::{LoggingPlugin, Plugin};
use crate::error::DcfError;

/// 按名称构造插件的工厂。
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// 插件名称到工厂的映射，配置中的 `plugins` 列表经由它解析。
///
/// 新建的注册表已包含 `"logging"`。
#[derive(Clone)]
pub struct PluginRegistry {
    factories: Arc<DashMap<String, PluginFactory>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        let registry = Self {
            factories: Arc::new(DashMap::new()),
        };
        registry.register(LoggingPlugin::NAME, Arc::new(|| {
            Arc::new(LoggingPlugin::default()) as Arc<dyn Plugin>
        }));
        registry
    }

    /// 注册或覆盖工厂。
    pub fn register(&self, name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Result<Arc<dyn Plugin>, DcfError> {
        let factory = self
            .factories
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DcfError::config(format!("unknown plugin `{name}`")))?;
        Ok(factory())
    }
}
