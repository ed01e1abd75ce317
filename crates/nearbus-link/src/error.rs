/// Errors returned by the lane layer.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no reachable path to {device_id}")]
    NoPath { device_id: String },

    #[error("link layer rejected the request: {reason}")]
    Rejected { reason: String },

    #[error("unknown lane: {lane_id}")]
    UnknownLane { lane_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_no_path() {
        let err = LinkError::NoPath {
            device_id: "dev-a1".into(),
        };
        assert_eq!(err.to_string(), "no reachable path to dev-a1");
    }

    #[test]
    fn test_display_rejected() {
        let err = LinkError::Rejected {
            reason: "bandwidth class unavailable".into(),
        };
        assert_eq!(
            err.to_string(),
            "link layer rejected the request: bandwidth class unavailable"
        );
    }

    #[test]
    fn test_display_unknown_lane() {
        let err = LinkError::UnknownLane {
            lane_id: "d6f1".into(),
        };
        assert_eq!(err.to_string(), "unknown lane: d6f1");
    }
}
