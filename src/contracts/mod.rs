//! Core message contracts for the paigeant workflow engine.
//!
//! Everything that travels over the bus lives here: the [`RoutingSlip`]
//! carried by every message, the [`ActivitySpec`] steps it is built from,
//! and the [`PaigeantMessage`] wire envelope with its advance/retry/insert
//! operations.

pub mod message;
pub mod routing_slip;

pub use message::{EnvelopeError, PaigeantMessage, PreviousOutput, SPEC_VERSION};
pub use routing_slip::{
    ActivitySpec, ExecutedActivity, ExecutedStatus, RoutingSlip, SerializedDeps,
};

use chrono::{DateTime, TimeZone, Utc};

/// Reserved payload key holding the immediately prior step's output.
pub const PREVIOUS_OUTPUT_KEY: &str = "previous_output";

/// Current UTC time truncated to millisecond precision.
///
/// The wire format carries millisecond timestamps, so every timestamp the
/// engine mints is truncated up front to keep round-trips byte-stable.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

/// Serde adapter for ISO-8601 UTC timestamps with millisecond precision.
pub(crate) mod iso_millis {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_truncates_submillisecond_precision() {
        let ts = now_millis();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
