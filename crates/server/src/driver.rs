use std::sync::Mutex;

use shared::domain::LightState;
use tracing::info;

/// Output stage behind the controller. Called with every committed state, in
/// commit order.
pub trait LightsDriver: Send + Sync {
    fn render(&self, state: &LightState) -> anyhow::Result<()>;
}

/// Stands in for the LED strip: logs each frame it would have rendered.
#[derive(Default)]
pub struct LoggingDriver {
    last: Mutex<Option<LightState>>,
}

impl LoggingDriver {
    pub fn last_rendered(&self) -> Option<LightState> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

impl LightsDriver for LoggingDriver {
    fn render(&self, state: &LightState) -> anyhow::Result<()> {
        info!(
            power = state.power,
            mode = %state.mode,
            parameters = ?state.parameters,
            "driver: render"
        );
        let mut last = self
            .last
            .lock()
            .map_err(|_| anyhow::anyhow!("driver state lock poisoned"))?;
        *last = Some(state.clone());
        Ok(())
    }
}
