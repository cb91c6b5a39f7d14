use tracing::Level;

use super::{Plugin, PluginError, Verdict};
use crate::envelope::Envelope;

/// 记录每条消息摘要的日志插件，始终放行。
#[derive(Clone, Debug)]
pub struct LoggingPlugin {
    level: Level,
}

impl Default for LoggingPlugin {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl LoggingPlugin {
    pub const NAME: &'static str = "logging";

    pub fn new(level: Level) -> Self {
        Self { level }
    }

    fn record(&self, envelope: &Envelope) {
        let recipient = envelope
            .recipient
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let sender = envelope.sender.as_deref().unwrap_or_default();
        macro_rules! emit {
            ($lvl:expr) => {
                tracing::event!(
                    $lvl,
                    direction = ?envelope.direction,
                    correlation_id = envelope.correlation_id,
                    sender,
                    recipient = %recipient,
                    bytes = envelope.payload.len(),
                    "message"
                )
            };
        }
        match self.level {
            Level::ERROR => emit!(Level::ERROR),
            Level::WARN => emit!(Level::WARN),
            Level::INFO => emit!(Level::INFO),
            Level::DEBUG => emit!(Level::DEBUG),
            _ => emit!(Level::TRACE),
        }
    }
}

impl Plugin for LoggingPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_outbound(&self, envelope: &Envelope) -> Result<Verdict, PluginError> {
        self.record(envelope);
        Ok(Verdict::Pass)
    }

    fn on_inbound(&self, envelope: &Envelope) -> Result<Verdict, PluginError> {
        self.record(envelope);
        Ok(Verdict::Pass)
    }
}
