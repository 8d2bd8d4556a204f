//! Protocol and configuration constants for cora.

use std::time::Duration;

// =============================================================================
// Logon Constants
// =============================================================================

/// First server version that accepts challenge/response logon.
pub const CHALLENGE_LOGON_MIN_VERSION: &str = "1.3.1.28";

/// First server version that accepts access-token logon.
pub const TOKEN_LOGON_MIN_VERSION: &str = "1.3.11.21";

/// Number of random bytes mixed into the challenge client token.
pub const CLIENT_TOKEN_NONCE_LEN: usize = 16;

/// Application name sent with logon when the caller supplies none.
pub const DEFAULT_APPLICATION_NAME: &str = "cora-client";

// =============================================================================
// Outcome Codes
// =============================================================================

/// Generic success outcome carried by acknowledgements and notifications.
pub const OUTCOME_SUCCESS: u32 = 1;

/// Change code for an item added since the previous report.
pub const CHANGE_ADDED: u32 = 1;

/// Change code for an item removed since the previous report.
pub const CHANGE_DELETED: u32 = 2;

// =============================================================================
// Subscription Manager Constants
// =============================================================================

/// Delay before a failed subscription step is re-issued.
pub const RESTART_INTERVAL: Duration = Duration::from_secs(10);

/// Name of the synthetic table built from a device's input locations.
pub const CLASSIC_INLOCS_TABLE: &str = "ClassicInlocs";

/// Number of fields assumed when a device reports no input-location labels.
pub const DEFAULT_INLOC_COUNT: u32 = 28;

/// Prefix of the generated input-location field names (`Input_1` ...).
pub const DEFAULT_INLOC_PREFIX: &str = "Input_";
