//! Small helpers shared by events, metrics and failure reporting.

mod panic;
pub mod timestamps;

pub use panic::panic_message;
pub use timestamps::{duration_ms, format_timestamp, iso_timestamp, now_utc, Timestamp};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        // Should be RFC3339 format: YYYY-MM-DDTHH:MM:SS.ssssss+00:00
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }
}
