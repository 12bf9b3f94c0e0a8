use serde::{Deserialize, Serialize};

/// What a data range does with a block it cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Log the error, resynchronize on the next indexed block, and end the
    /// range quietly if there is none. A final block missing entirely at
    /// end-of-file is treated as a clean end.
    #[default]
    Skip,
    /// Return block errors to the caller. A final block missing entirely at
    /// end-of-file is `TruncatedBlock`.
    Abort,
}

/// Per-session decode options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Skip computing block checksums. Checksum fields are still read.
    pub disable_checksums: bool,
    pub error_policy: ErrorPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            disable_checksums: true,
            error_policy: ErrorPolicy::Skip,
        }
    }
}

impl ScanConfig {
    /// Verify checksums and fail on the first bad block.
    pub fn strict() -> Self {
        Self {
            disable_checksums: false,
            error_policy: ErrorPolicy::Abort,
        }
    }

    pub fn with_checksums(mut self, verify: bool) -> Self {
        self.disable_checksums = !verify;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }
}
