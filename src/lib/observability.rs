use metrics::{describe_counter, describe_histogram};

/// Registers metric descriptions with whatever recorder the host process has
/// installed. Without a recorder the metric macros are no-ops.
pub fn describe() {
    describe_counter!(
        "docvault_store_operations_total",
        "Total number of operations executed by the document store."
    );
    describe_histogram!(
        "docvault_store_operation_duration_seconds",
        "Duration of operations executed by the document store."
    );
    describe_counter!(
        "docvault_crypto_operations_total",
        "Total number of envelope encryption operations by outcome."
    );
}
