//! User-Agent sent with metadata and transfer requests.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/scandl/scandl";

/// Default User-Agent (identifies the tool and its version).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("scandl/{version} (+{PROJECT_UA_URL})")
}
