// Error taxonomy for the control layer

use crate::motor::FeetechError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} is already connected")]
    AlreadyConnected(String),

    #[error("{0} is not connected")]
    NotConnected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Bus transaction failed: {0}")]
    BusTransaction(#[from] FeetechError),

    #[error("Calibration incomplete for {motor}: {reason}")]
    CalibrationIncomplete { motor: String, reason: String },

    #[error("Camera {name} error: {reason}")]
    Camera { name: String, reason: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("{} resource(s) failed to disconnect: {}", .0.len(), summarize(.0))]
    Teardown(Vec<(String, Error)>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn summarize(failures: &[(String, Error)]) -> String {
    failures
        .iter()
        .map(|(resource, e)| format!("{resource}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// True for lifecycle-precondition violations (raised before any side effect)
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Error::AlreadyConnected(_) | Error::NotConnected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_message_lists_every_failure() {
        let err = Error::Teardown(vec![
            ("left arm".to_string(), Error::NotConnected("left arm".into())),
            (
                "camera top".to_string(),
                Error::Camera {
                    name: "top".into(),
                    reason: "device gone".into(),
                },
            ),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 resource(s)"));
        assert!(msg.contains("left arm: left arm is not connected"));
        assert!(msg.contains("device gone"));
    }
}
