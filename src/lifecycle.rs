//! Campaign lifecycle state machine.
//!
//! `draft → scheduled → active → {completed | failed}`, with `paused` toggled
//! against a campaign that has already started sending.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Active,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Dispatch requested before the campaign's scheduled time.
    Defer,
    /// A batch is about to attempt deliveries.
    Start,
    /// The batch finished with `sent` successes out of `total` attempts.
    Finish { sent: usize, total: usize },
    Pause,
    Resume,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defer => write!(f, "defer"),
            Self::Start => write!(f, "start"),
            Self::Finish { .. } => write!(f, "finish"),
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
        }
    }
}

impl CampaignStatus {
    /// Apply `event`, returning the next status or `None` if the transition
    /// is not allowed from this state.
    pub fn apply(self, event: LifecycleEvent) -> Option<CampaignStatus> {
        use CampaignStatus::*;
        use LifecycleEvent as E;

        match (self, event) {
            (Draft | Scheduled, E::Defer) => Some(Scheduled),
            (Draft | Scheduled | Active | Completed | Failed, E::Start) => Some(Active),
            (Active, E::Finish { sent, total }) => {
                if sent == 0 && total > 0 {
                    Some(Failed)
                } else {
                    Some(Completed)
                }
            }
            (Active | Completed | Failed, E::Pause) => Some(Paused),
            (Paused, E::Resume) => Some(Active),
            _ => None,
        }
    }

    pub fn is_paused(self) -> bool {
        self == CampaignStatus::Paused
    }

    /// Statuses the follow-up scheduler re-dispatches on every tick. `active`
    /// covers resumed campaigns and runs that stopped before finishing.
    pub fn awaiting_followup() -> &'static [CampaignStatus] {
        &[
            CampaignStatus::Scheduled,
            CampaignStatus::Active,
            CampaignStatus::Completed,
        ]
    }
}

impl FromStr for CampaignStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("Invalid campaign status: {}", other),
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::CampaignStatus::*;
    use super::*;

    #[test]
    fn draft_defers_to_scheduled() {
        assert_eq!(Draft.apply(LifecycleEvent::Defer), Some(Scheduled));
        assert_eq!(Scheduled.apply(LifecycleEvent::Defer), Some(Scheduled));
    }

    #[test]
    fn defer_is_rejected_once_sending_started() {
        assert_eq!(Active.apply(LifecycleEvent::Defer), None);
        assert_eq!(Completed.apply(LifecycleEvent::Defer), None);
    }

    #[test]
    fn finish_with_zero_successes_fails() {
        let event = LifecycleEvent::Finish { sent: 0, total: 2 };
        assert_eq!(Active.apply(event), Some(Failed));
    }

    #[test]
    fn finish_with_any_success_completes() {
        let event = LifecycleEvent::Finish { sent: 1, total: 5 };
        assert_eq!(Active.apply(event), Some(Completed));
    }

    #[test]
    fn finish_with_empty_batch_completes() {
        let event = LifecycleEvent::Finish { sent: 0, total: 0 };
        assert_eq!(Active.apply(event), Some(Completed));
    }

    #[test]
    fn finish_requires_active() {
        let event = LifecycleEvent::Finish { sent: 1, total: 1 };
        assert_eq!(Draft.apply(event), None);
    }

    #[test]
    fn pause_only_after_sending_started() {
        assert_eq!(Draft.apply(LifecycleEvent::Pause), None);
        assert_eq!(Scheduled.apply(LifecycleEvent::Pause), None);
        assert_eq!(Active.apply(LifecycleEvent::Pause), Some(Paused));
        assert_eq!(Completed.apply(LifecycleEvent::Pause), Some(Paused));
    }

    #[test]
    fn paused_cannot_start_until_resumed() {
        assert_eq!(Paused.apply(LifecycleEvent::Start), None);
        assert_eq!(Paused.apply(LifecycleEvent::Resume), Some(Active));
        assert_eq!(Active.apply(LifecycleEvent::Resume), None);
    }

    #[test]
    fn resumed_campaigns_are_polled_but_paused_ones_are_not() {
        let polled = CampaignStatus::awaiting_followup();
        assert!(polled.contains(&Paused.apply(LifecycleEvent::Resume).unwrap()));
        assert!(!polled.contains(&Paused));
        assert!(!polled.contains(&Draft));
        assert!(!polled.contains(&Failed));
    }

    #[test]
    fn status_string_form_matches_serde() {
        for status in [Draft, Scheduled, Active, Paused, Completed, Failed] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
            assert_eq!(status.to_string().parse::<CampaignStatus>().unwrap(), status);
        }
    }
}
