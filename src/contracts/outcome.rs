use serde::{Deserialize, Serialize};

/// Result a consumer reports for one delivery attempt of a work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    /// Processing succeeded.
    Ack,
    /// Processing failed; the message is retried or dead-lettered.
    Nack,
}

impl Outcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack)
    }
}

/// Final state of a message after the retry machine is done with it.
///
/// - `Succeeded`: acked on some attempt
/// - `DeadLettered`: retries exhausted, copy published to the error topic
/// - `Lost`: retries exhausted and the dead-letter publish failed
/// - `Abandoned`: nobody is reading work items anymore; the message was
///   never resolved and must be redelivered by the transport
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Terminal {
    Succeeded,
    DeadLettered,
    Lost,
    Abandoned,
}

impl Terminal {
    /// Whether the message left the normal processing path for good, which
    /// makes its offset safe to commit.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Abandoned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::DeadLettered => "dead_lettered",
            Self::Lost => "lost",
            Self::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
