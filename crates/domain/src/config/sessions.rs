use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions & secondary indexes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session repository configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Max idle time applied to newly created sessions, in seconds.
    /// `0` means sessions never expire on their own.
    #[serde(default = "d_max_idle_secs")]
    pub default_max_idle_secs: u64,

    /// Deployment identity used when destroy notification runs outside a
    /// request (expiration sweeps).
    #[serde(default = "d_deployment")]
    pub deployment: String,

    /// Enable the request-scoped single-entry lookup cache.
    #[serde(default = "d_true")]
    pub request_cache: bool,

    /// Secondary indexes derived from session attributes.
    #[serde(default)]
    pub indexes: Vec<IndexConfig>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            default_max_idle_secs: d_max_idle_secs(),
            deployment: d_deployment(),
            request_cache: true,
            indexes: Vec::new(),
        }
    }
}

/// One secondary index: `name` is looked up by callers, `attribute` is the
/// session attribute whose string value becomes the index value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub name: String,
    pub attribute: String,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_idle_secs() -> u64 {
    1800
}
fn d_deployment() -> String {
    "default".into()
}
fn d_true() -> bool {
    true
}
