//! Two-phase startup
//!
//! Configuration is validated before the log subscriber is installed.
//! `StartupResult` holds the outcome together with the notes produced on the
//! way, and replays both once logging is available. A deferred configuration
//! error is then served by `server::unconfigured_router`, which keeps `/health`
//! answering and fails every other request with it.

use crate::config::{Config, Settings};
use crate::error::Result;
use tracing::{error, info};

#[derive(Debug)]
pub struct StartupResult {
    notes: Vec<String>,
    outcome: Result<Settings>,
}

impl StartupResult {
    /// Phase one: validate without logging
    pub fn prepare(config: &Config) -> Self {
        let mut notes = vec![format!("Create startup {}", config.application_name)];
        let outcome = config.validate();
        if let Ok(settings) = &outcome {
            notes.push(format!("Listening address: {}", settings.bind_addr));
            notes.push(format!("Login provider: {}", settings.provider.name));
            notes.push(format!(
                "Cookie TTL: {}s, capture TTL: {}s",
                settings.cookie_ttl.as_secs(),
                settings.capture_ttl.as_secs()
            ));
        }
        Self { notes, outcome }
    }

    pub fn is_ready(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Phase two: replay buffered notes, then surface the deferred outcome
    pub fn finish(self) -> Result<Settings> {
        for note in &self.notes {
            info!("{}", note);
        }
        if let Err(e) = &self.outcome {
            error!("Startup failed: {}", e);
        }
        self.outcome
    }
}
