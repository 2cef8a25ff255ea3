// ==== Relay metrics ====
/// Counter for messages accepted into a relay queue, labelled by relay kind
pub const RELAY_MESSAGES_ENQUEUED: &str = "relay_messages_enqueued_total";

/// Counter for publish attempts made by a relay worker, labelled by kind and outcome
pub const RELAY_PUBLISH_ATTEMPTS: &str = "relay_publish_attempts_total";

/// Counter for delivery outcomes drained from the async event streams
pub const RELAY_DELIVERY_REPORTS: &str = "relay_delivery_reports_total";

/// Gauge for the effective queue capacity of a relay
pub const RELAY_BUFFER_SIZE: &str = "relay_buffer_size";

// ==== Consumer group metrics ====
/// Counter for generations that ended cleanly (rebalance or voluntary exit)
pub const CONSUMER_GROUP_GENERATIONS: &str = "consumer_group_generations_total";

/// Counter for consume calls that returned an error
pub const CONSUMER_GROUP_FAILURES: &str = "consumer_group_failures_total";

/// Counter for errors read from the session error stream, labelled by disposition
pub const CONSUMER_GROUP_ERRORS: &str = "consumer_group_errors_total";

/// Counter for sessions cancelled because they need to be created again
pub const CONSUMER_GROUP_RECREATE: &str = "consumer_group_recreate_total";

// ==== Streaming consumer metrics ====
/// Counter for messages handed to a streaming consumer callback
pub const STREAMING_CONSUMER_PROCESSED: &str = "streaming_consumer_processed_total";

/// Counter for errors read from a streaming consumer, labelled by source
pub const STREAMING_CONSUMER_ERRORS: &str = "streaming_consumer_errors_total";

// ==== Service endpoints ====
/// Counter for requests to the health and metrics endpoints, labelled by path and status
pub const ENDPOINT_REQUESTS: &str = "mirror_endpoint_requests_total";

/// Histogram for the time spent answering those requests
pub const ENDPOINT_REQUEST_DURATION: &str = "mirror_endpoint_request_duration_seconds";
