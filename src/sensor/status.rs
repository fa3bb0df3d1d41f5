//! Online beacon
//!
//! Publishes `online` on every forced sweep so consumers can tell the agent is
//! alive even when nothing else changes. `refresh` on `<root>/status/set`
//! forces the next sweep.

use tracing::info;

use crate::registry::{CommandContext, Commandable, EntityError, PublishPolicy, Publishable};

pub const ONLINE_PAYLOAD: &str = "online";
pub const REFRESH_COMMAND: &str = "refresh";

#[derive(Clone, Copy, Debug, Default)]
pub struct StatusBeacon;

impl Publishable for StatusBeacon {
    fn sample(&mut self) -> Result<String, EntityError> {
        Ok(ONLINE_PAYLOAD.to_string())
    }

    fn policy(&self) -> PublishPolicy {
        PublishPolicy::RefreshOnly
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RefreshCommand;

impl Commandable for RefreshCommand {
    fn command(&self, payload: &str, ctx: &CommandContext) -> Result<(), EntityError> {
        if payload.trim().eq_ignore_ascii_case(REFRESH_COMMAND) {
            info!("Full republish requested");
            ctx.request_refresh();
            Ok(())
        } else {
            Err(EntityError::InvalidCommand(format!(
                "expected '{REFRESH_COMMAND}', got '{}'",
                payload.trim()
            )))
        }
    }
}
