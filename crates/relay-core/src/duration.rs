//! Serde helpers for `Duration` fields.
//!
//! Configuration uses human-readable durations (`500ms`, `60s`, `5m`);
//! execution records use whole milliseconds so logs stay compact.

/// Human-readable durations via `humantime` (`"1m 30s"`).
pub mod human {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Optional human-readable durations.
pub mod human_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Durations as integer milliseconds.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Holder {
        #[serde(with = "super::human")]
        every: Duration,
        #[serde(default, with = "super::human_opt")]
        limit: Option<Duration>,
    }

    #[test]
    fn test_human_durations_parse() {
        let holder: Holder = serde_json::from_str(r#"{"every": "1m 30s", "limit": "500ms"}"#).unwrap();
        assert_eq!(holder.every, Duration::from_secs(90));
        assert_eq!(holder.limit, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_missing_optional_duration() {
        let holder: Holder = serde_json::from_str(r#"{"every": "2s"}"#).unwrap();
        assert_eq!(holder.limit, None);
    }

    #[test]
    fn test_garbage_duration_rejected() {
        assert!(serde_json::from_str::<Holder>(r#"{"every": "soon"}"#).is_err());
    }
}
