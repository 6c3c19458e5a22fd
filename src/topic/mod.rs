//! Topic matching and subscription management
//!
//! Implements topic name/filter validation (MQTT 3.1.1 section 4.7) and the
//! subscription registry that maps filters to subscribers.

mod registry;
mod shared;
pub mod validation;

pub use registry::{Subscription, SubscriptionRegistry};
pub use shared::{Selection, SharedSelector};
pub use validation::{
    filter_covered_by, is_valid_filter, is_wildcard, parse_shared_subscription,
    topic_matches_filter, validate_topic_filter, validate_topic_name,
};
