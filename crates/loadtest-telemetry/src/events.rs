//! Run lifecycle and progress events.

use crate::scheduler::RunConfig;
use serde::{Deserialize, Serialize};

/// One event of a run, in emission order.
///
/// Serialized with a `type` tag, e.g. `{"type":"progress","sent":11,...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProgressEvent {
    Started {
        config: RunConfig,
    },
    Progress {
        sent: u64,
        /// Seconds since the run started
        elapsed: f64,
        /// Records per second since the run started
        rate: f64,
    },
    Completed {
        sent: u64,
        duration: f64,
    },
    Stopped {
        sent: u64,
        elapsed: f64,
    },
    Failed {
        reason: String,
    },
}

impl ProgressEvent {
    /// True for the last event a run emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. }
                | ProgressEvent::Stopped { .. }
                | ProgressEvent::Failed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(ProgressEvent::Progress {
            sent: 11,
            elapsed: 1.0,
            rate: 11.0,
        })
        .unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["sent"], 11);

        let failed = serde_json::to_string(&ProgressEvent::Failed {
            reason: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(failed, r#"{"type":"failed","reason":"boom"}"#);
    }

    #[test]
    fn test_terminal_events() {
        assert!(ProgressEvent::Completed { sent: 1, duration: 1.0 }.is_terminal());
        assert!(ProgressEvent::Stopped { sent: 1, elapsed: 0.5 }.is_terminal());
        assert!(!ProgressEvent::Progress { sent: 1, elapsed: 1.0, rate: 1.0 }.is_terminal());
    }
}
