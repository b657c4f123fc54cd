// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fmt::Display,
    sync::atomic::{AtomicUsize, Ordering},
};

use chrono::{DateTime, TimeZone, Utc};

/// 2015-01-01
const EPOCH: i64 = 1420070400000;

/// Unique identifier including a timestamp.
///
/// # Reference
/// See <https://discord.com/developers/docs/reference#snowflakes>
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snowflake(pub u64);

impl Snowflake {
    /// Generates a snowflake for the current timestamp, with worker id 0 and process id 1.
    pub fn generate() -> Self {
        const WORKER_ID: u64 = 0;
        const PROCESS_ID: u64 = 1;
        static INCREMENT: AtomicUsize = AtomicUsize::new(0);

        let time = (Utc::now().timestamp_millis() - EPOCH) << 22;
        let worker = WORKER_ID << 17;
        let process = PROCESS_ID << 12;
        let increment = INCREMENT.fetch_add(1, Ordering::Relaxed) as u64 % 32;

        Self(time as u64 | worker | process | increment)
    }

    /// Returns the snowflake's timestamp
    pub fn timestamp(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt((self.0 >> 22) as i64 + EPOCH)
            .unwrap()
    }

    /// Whether this is the all-zero placeholder id.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for Snowflake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Snowflake {
    fn from(item: u64) -> Self {
        Self(item)
    }
}

impl From<Snowflake> for u64 {
    fn from(item: Snowflake) -> Self {
        item.0
    }
}

impl serde::Serialize for Snowflake {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Snowflake {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct SnowflakeVisitor;
        impl serde::de::Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a string or number snowflake id")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Snowflake(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse::<u64>().map(Snowflake).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snowflake_serialization() {
        let snowflake = Snowflake(1234567890);
        let serialized = serde_json::to_string(&snowflake).unwrap();
        assert_eq!(serialized, "\"1234567890\"");

        let from_string: Snowflake = serde_json::from_str("\"1234567890\"").unwrap();
        let from_number: Snowflake = serde_json::from_str("1234567890").unwrap();
        assert_eq!(from_string, snowflake);
        assert_eq!(from_number, snowflake);
    }
}
