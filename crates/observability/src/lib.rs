//! Process-wide tracing setup and log-field hygiene.

/// Install the global tracing subscriber (JSON unless `DOCFLOW_LOG_FORMAT=pretty`).
///
/// Safe to call more than once.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (format, filter).
pub mod tracing;

/// Sanitisation of identifiers before they are written to log fields.
pub mod redact;
