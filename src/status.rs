use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Durable status of a persistent projection.
///
/// Operators write a target status (stop, reset, delete); the running
/// projector observes it on its next status check and acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    #[default]
    Idle,
    Running,
    Stopping,
    Resetting,
    Deleting,
    DeletingWithEmittedEvents,
}

impl ProjectionStatus {
    /// Persisted snake_case form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Resetting => "resetting",
            Self::Deleting => "deleting",
            Self::DeletingWithEmittedEvents => "deleting_with_emitted_events",
        }
    }
}

impl fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown projection status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ProjectionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "resetting" => Ok(Self::Resetting),
            "deleting" => Ok(Self::Deleting),
            "deleting_with_emitted_events" => Ok(Self::DeletingWithEmittedEvents),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ProjectionStatus; 6] = [
        ProjectionStatus::Idle,
        ProjectionStatus::Running,
        ProjectionStatus::Stopping,
        ProjectionStatus::Resetting,
        ProjectionStatus::Deleting,
        ProjectionStatus::DeletingWithEmittedEvents,
    ];

    #[test]
    fn serde_and_display_agree() {
        for status in ALL {
            let json = serde_json::to_value(status).expect("serialization should succeed");
            assert_eq!(json, serde_json::Value::String(status.to_string()));
            assert_eq!(status.as_str().parse::<ProjectionStatus>(), Ok(status));
        }
    }

    #[test]
    fn persisted_names() {
        assert_eq!(
            ProjectionStatus::DeletingWithEmittedEvents.as_str(),
            "deleting_with_emitted_events"
        );
        assert_eq!(ProjectionStatus::default(), ProjectionStatus::Idle);
    }

    #[test]
    fn unknown_string_fails() {
        let err = "paused".parse::<ProjectionStatus>().expect_err("unknown status");
        assert_eq!(err.to_string(), "unknown projection status 'paused'");
    }
}
