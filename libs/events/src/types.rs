//! Status enums for deployments, applications, and tasks.

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Implements `as_str`, `Display` and `FromStr` over snake_case names.
macro_rules! status_strings {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(EventError::UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// =============================================================================
// Deployment
// =============================================================================

/// Status of one deployment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Queued,
    Building,
    Deploying,
    Running,
    Failed,
    Cancelled,
}

status_strings!(DeploymentStatus, "deployment", {
    Queued => "queued",
    Building => "building",
    Deploying => "deploying",
    Running => "running",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl DeploymentStatus {
    /// States from which a deployment may still be cancelled.
    pub const IN_PROGRESS: [DeploymentStatus; 3] = [
        DeploymentStatus::Queued,
        DeploymentStatus::Building,
        DeploymentStatus::Deploying,
    ];

    pub fn is_in_progress(&self) -> bool {
        Self::IN_PROGRESS.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_progress()
    }

    fn stage(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Building => 1,
            Self::Deploying => 2,
            Self::Running | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Transitions only move forward, and never out of a terminal state.
    ///
    /// Stages may be skipped (a node may report `running` straight from
    /// `queued`), but a transition to the current state is not a transition.
    pub fn can_transition_to(&self, next: DeploymentStatus) -> bool {
        self.is_in_progress() && next.stage() > self.stage()
    }
}

// =============================================================================
// Application
// =============================================================================

/// Runtime status of an application as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    #[default]
    Stopped,
    Deploying,
    Running,
    Failed,
}

status_strings!(ApplicationStatus, "application", {
    Stopped => "stopped",
    Deploying => "deploying",
    Running => "running",
    Failed => "failed",
});

impl ApplicationStatus {
    /// Application status implied by a terminal deployment status.
    pub fn after(deployment: DeploymentStatus) -> Option<Self> {
        match deployment {
            DeploymentStatus::Running => Some(Self::Running),
            DeploymentStatus::Failed => Some(Self::Failed),
            DeploymentStatus::Cancelled => Some(Self::Stopped),
            _ => None,
        }
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Delivery status of a durable task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
}

status_strings!(TaskStatus, "task", {
    Pending => "pending",
    Sent => "sent",
    Acknowledged => "acknowledged",
    Completed => "completed",
    Failed => "failed",
});

impl TaskStatus {
    /// Rows in these states are no longer handed out by polling.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Completed | Self::Failed)
    }
}

/// Kind of work carried by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Deploy,
    CancelDeployment,
}

status_strings!(TaskType, "task type", {
    Deploy => "deploy",
    CancelDeployment => "cancel_deployment",
});

/// Who triggered an operation, for audit fields and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// A human user.
    User,
    /// A node agent calling back.
    Node,
    /// The control plane itself (cascade redeploys, cleanup).
    #[default]
    System,
}

status_strings!(ActorType, "actor", {
    User => "user",
    Node => "node",
    System => "system",
});

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DeploymentStatus::Queued, DeploymentStatus::Building, true)]
    #[case(DeploymentStatus::Queued, DeploymentStatus::Running, true)]
    #[case(DeploymentStatus::Building, DeploymentStatus::Deploying, true)]
    #[case(DeploymentStatus::Deploying, DeploymentStatus::Failed, true)]
    #[case(DeploymentStatus::Deploying, DeploymentStatus::Cancelled, true)]
    #[case(DeploymentStatus::Deploying, DeploymentStatus::Building, false)]
    #[case(DeploymentStatus::Building, DeploymentStatus::Building, false)]
    #[case(DeploymentStatus::Running, DeploymentStatus::Cancelled, false)]
    #[case(DeploymentStatus::Failed, DeploymentStatus::Running, false)]
    #[case(DeploymentStatus::Cancelled, DeploymentStatus::Queued, false)]
    fn deployment_transitions(
        #[case] from: DeploymentStatus,
        #[case] to: DeploymentStatus,
        #[case] allowed: bool,
    ) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn test_in_progress() {
        assert!(DeploymentStatus::Queued.is_in_progress());
        assert!(DeploymentStatus::Deploying.is_in_progress());
        assert!(DeploymentStatus::Running.is_terminal());
        assert!(DeploymentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!("cancelled".parse::<DeploymentStatus>().unwrap(), DeploymentStatus::Cancelled);
        assert_eq!(TaskStatus::Acknowledged.as_str(), "acknowledged");
        assert_eq!(TaskType::CancelDeployment.to_string(), "cancel_deployment");
        assert!(matches!(
            "paused".parse::<DeploymentStatus>(),
            Err(EventError::UnknownStatus { kind: "deployment", .. })
        ));
    }

    #[test]
    fn test_application_status_after() {
        assert_eq!(
            ApplicationStatus::after(DeploymentStatus::Cancelled),
            Some(ApplicationStatus::Stopped)
        );
        assert_eq!(ApplicationStatus::after(DeploymentStatus::Building), None);
    }
}
