use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost_types::Timestamp;

/// Current wall-clock time truncated to whole milliseconds, so that times
/// survive a protobuf round trip unchanged and compare equal afterwards.
pub fn now() -> SystemTime {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    UNIX_EPOCH + Duration::from_millis(since_epoch.as_millis() as u64)
}

pub fn to_proto(time: SystemTime) -> Timestamp {
    Timestamp::from(time)
}

/// Converts a protobuf timestamp, mapping a missing or unrepresentable value to
/// the Unix epoch.
pub fn from_proto(timestamp: Option<&Timestamp>) -> SystemTime {
    timestamp
        .and_then(|ts| SystemTime::try_from(ts.clone()).ok())
        .unwrap_or(UNIX_EPOCH)
}

/// Milliseconds since the Unix epoch, used in hashes and human readable output.
pub fn unix_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_round_trip_of_now_is_lossless() {
        let t = now();
        assert_eq!(from_proto(Some(&to_proto(t))), t);
    }
}
