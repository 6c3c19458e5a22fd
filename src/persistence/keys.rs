//! Durable store key layout.

/// Set of client ids with a persistent session
pub const SESSIONS: &str = "sessions";
/// Set of every filter that has at least one persistent subscriber
pub const SUB_FILTERS: &str = "sub:filters";
/// Hash of retained messages, keyed by exact topic
pub const RETAIN: &str = "retain";
/// Hash of connected client id -> broker id
pub const ONLINE: &str = "online";

/// Session hash fields
pub const FIELD_NEXT_ID: &str = "next_id";
pub const FIELD_WILL: &str = "will";

/// Hash of per-session scalars (`next_id`, `will`)
pub fn session(client_id: &str) -> String {
    format!("session:{}", client_id)
}

/// Hash of packet id -> outbound message awaiting PUBACK/PUBREC
pub fn pending_pub(client_id: &str) -> String {
    format!("pending:pub:{}", client_id)
}

/// Set of inbound QoS 2 packet ids awaiting PUBREL
pub fn pending_rel(client_id: &str) -> String {
    format!("pending:rel:{}", client_id)
}

/// Set of outbound QoS 2 packet ids awaiting PUBCOMP
pub fn pending_comp(client_id: &str) -> String {
    format!("pending:comp:{}", client_id)
}

/// Hash of subscriber key -> granted QoS for one filter
pub fn subscription(filter: &str) -> String {
    format!("sub:filter:{}", filter)
}

/// Set of filters one client holds persistently
pub fn client_subscriptions(client_id: &str) -> String {
    format!("sub:client:{}", client_id)
}
