//! Well-known context tag keys and correlation id checks.
//!
//! Tag keys are fixed by the envelope schema; the ingestion service only
//! recognizes these exact strings. Identifiers are lowercase hex: 32 chars
//! for a trace id, 16 for a span id, and the all-zero value means "unset".

pub const OPERATION_ID: &str = "ai.operation.id";
pub const OPERATION_PARENT_ID: &str = "ai.operation.parentId";
pub const OPERATION_NAME: &str = "ai.operation.name";
pub const CLOUD_ROLE: &str = "ai.cloud.role";
pub const CLOUD_ROLE_INSTANCE: &str = "ai.cloud.roleInstance";
pub const USER_ID: &str = "ai.user.id";
pub const USER_AGENT: &str = "ai.user.userAgent";
pub const LOCATION_IP: &str = "ai.location.ip";
pub const APPLICATION_VERSION: &str = "ai.application.ver";
pub const INTERNAL_SDK_VERSION: &str = "ai.internal.sdkVersion";
pub const LEGACY_ROOT_ID: &str = "ai_legacyRootID";

const SPAN_ID_HEX_LENGTH: usize = 16;
const TRACE_ID_HEX_LENGTH: usize = 32;

/// Returns true when `hex` is a usable span id: 16 lowercase-insensitive hex
/// chars that are not all zero.
#[must_use]
pub fn span_id_is_valid(hex: &str) -> bool {
    id_is_valid(hex, SPAN_ID_HEX_LENGTH)
}

/// Returns true when `hex` is a usable trace id: 32 hex chars, not all zero.
#[must_use]
pub fn trace_id_is_valid(hex: &str) -> bool {
    id_is_valid(hex, TRACE_ID_HEX_LENGTH)
}

fn id_is_valid(hex: &str, expected_len: usize) -> bool {
    hex.len() == expected_len
        && hex.bytes().all(|b| b.is_ascii_hexdigit())
        && hex.bytes().any(|b| b != b'0')
}
