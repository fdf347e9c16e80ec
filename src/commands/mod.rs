use std::env;

pub mod config;
pub mod key;
pub mod project;

/// The acting user recorded on change sets: the explicit flag, then the
/// login name from the environment, then `fallback`.
pub(crate) fn resolve_actor_name(explicit: Option<&str>, fallback: &str) -> String {
    if let Some(value) = explicit.and_then(trimmed_non_empty) {
        return value;
    }

    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .ok()
        .and_then(|value| trimmed_non_empty(value.as_str()))
        .unwrap_or_else(|| fallback.to_string())
}

fn trimmed_non_empty(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
