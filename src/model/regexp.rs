use super::{MatchTree, MatchValue, ParseModel};
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use regex::bytes::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("regex compilation failed: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("pattern has no capture group named '{0}'")]
    MissingGroup(String),
}

#[derive(Debug, Clone)]
enum TimestampFormat {
    Strptime(String),
    Iso8601,
    Epoch,
    EpochMs,
}

impl TimestampFormat {
    fn from_name(format: &str) -> Self {
        match format {
            "iso8601" => TimestampFormat::Iso8601,
            "epoch" => TimestampFormat::Epoch,
            "epoch_ms" => TimestampFormat::EpochMs,
            other => TimestampFormat::Strptime(other.to_string()),
        }
    }

    fn parse(&self, value: &str) -> Option<DateTime<Utc>> {
        match self {
            TimestampFormat::Iso8601 => DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            TimestampFormat::Epoch => {
                let secs: i64 = value.parse().ok()?;
                Utc.timestamp_opt(secs, 0).single()
            }
            TimestampFormat::EpochMs => {
                let millis: i64 = value.parse().ok()?;
                Utc.timestamp_opt(millis / 1000, ((millis % 1000) * 1_000_000) as u32)
                    .single()
            }
            TimestampFormat::Strptime(fmt) => {
                if fmt.contains("%z") || fmt.contains("%Z") || fmt.contains("%:z") {
                    DateTime::parse_from_str(value, fmt)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc))
                } else if fmt.contains("%Y") || fmt.contains("%y") {
                    // no zone information in the format, assume UTC
                    NaiveDateTime::parse_from_str(value, fmt)
                        .ok()
                        .map(|ndt| Utc.from_utc_datetime(&ndt))
                } else {
                    // syslog-style formats carry no year; chrono refuses to
                    // build a datetime without one, so assume the current year
                    let year = Utc::now().year();
                    NaiveDateTime::parse_from_str(
                        &format!("{year} {value}"),
                        &format!("%Y {fmt}"),
                    )
                    .ok()
                    .map(|ndt| Utc.from_utc_datetime(&ndt))
                }
            }
        }
    }
}

/// A parsing model backed by a single regular expression over raw record
/// bytes. Every named capture group becomes a path `/<group>` in the match
/// tree; one group may be designated as the record timestamp and is parsed
/// with a chrono format (or `iso8601` / `epoch` / `epoch_ms`).
///
/// This is the minimal in-tree implementor of [`ParseModel`]; richer
/// grammar trees live behind the same trait, outside this crate.
#[derive(Debug)]
pub struct RegexModel {
    pattern: Regex,
    timestamp_group: Option<(String, TimestampFormat)>,
}

impl RegexModel {
    pub fn new(pattern: &str) -> Result<Self, ModelError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            timestamp_group: None,
        })
    }

    /// Designate a named capture group as the timestamp field.
    pub fn with_timestamp(mut self, group: &str, format: &str) -> Result<Self, ModelError> {
        if self
            .pattern
            .capture_names()
            .all(|name| name != Some(group))
        {
            return Err(ModelError::MissingGroup(group.to_string()));
        }
        self.timestamp_group = Some((group.to_string(), TimestampFormat::from_name(format)));
        Ok(self)
    }
}

impl ParseModel for RegexModel {
    fn try_match(&self, data: &[u8]) -> Option<MatchTree> {
        let captures = self.pattern.captures(data)?;
        let mut tree = MatchTree::new();

        for name in self.pattern.capture_names().flatten() {
            let Some(group) = captures.name(name) else {
                continue;
            };
            let path = format!("/{name}");
            let timestamp_format = self
                .timestamp_group
                .as_ref()
                .filter(|(ts_name, _)| ts_name == name)
                .map(|(_, format)| format);
            if let Some(format) = timestamp_format {
                if let Some(ts) = std::str::from_utf8(group.as_bytes())
                    .ok()
                    .and_then(|s| format.parse(s))
                {
                    tree.insert(path, MatchValue::Time(ts));
                    continue;
                }
                // unparseable timestamp bytes degrade to a plain value;
                // the atomizer reports the missing timestamp
            }
            tree.insert(path, MatchValue::Bytes(group.as_bytes().to_vec()));
        }
        Some(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_groups_become_paths() {
        let model =
            RegexModel::new(r"^(?P<level>\w+): (?P<msg>.*)$").unwrap();
        let tree = model.try_match(b"warn: disk almost full").unwrap();
        assert_eq!(
            tree.get("/level"),
            Some(&MatchValue::Bytes(b"warn".to_vec()))
        );
        assert_eq!(
            tree.get("/msg"),
            Some(&MatchValue::Bytes(b"disk almost full".to_vec()))
        );
    }

    #[test]
    fn test_no_match_returns_none() {
        let model = RegexModel::new(r"^\d+").unwrap();
        assert!(model.try_match(b"not a number").is_none());
    }

    #[test]
    fn test_iso8601_timestamp_group() {
        let model = RegexModel::new(
            r"^(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z) (?P<msg>.*)$",
        )
        .unwrap()
        .with_timestamp("ts", "iso8601")
        .unwrap();

        let tree = model.try_match(b"2025-12-04T10:00:00Z it begins").unwrap();
        let ts = tree.timestamp_at(["/ts"]).unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-12-04T10:00:00+00:00");
    }

    #[test]
    fn test_strptime_with_zone_converts_to_utc() {
        let model = RegexModel::new(r"\[(?P<ts>[^\]]+)\]")
            .unwrap()
            .with_timestamp("ts", "%d/%b/%Y:%H:%M:%S %z")
            .unwrap();

        let tree = model
            .try_match(b"[04/Dec/2025:02:42:11 +0530] GET /index.html")
            .unwrap();
        let ts = tree.timestamp_at(["/ts"]).unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-12-03T21:12:11+00:00");
    }

    #[test]
    fn test_yearless_strptime_assumes_current_year() {
        use chrono::Timelike;

        let model = RegexModel::new(r"^(?P<ts>\w{3} [ \d]\d \d{2}:\d{2}:\d{2}) ")
            .unwrap()
            .with_timestamp("ts", "%b %e %H:%M:%S")
            .unwrap();

        let tree = model
            .try_match(b"Dec  4 10:00:00 myhost sshd[414]: session opened")
            .unwrap();
        let ts = tree.timestamp_at(["/ts"]).unwrap();
        assert_eq!(ts.year(), Utc::now().year());
        assert_eq!(ts.month(), 12);
        assert_eq!(ts.day(), 4);
        assert_eq!(ts.hour(), 10);
    }

    #[test]
    fn test_epoch_timestamp_group() {
        let model = RegexModel::new(r"^(?P<ts>\d{10})")
            .unwrap()
            .with_timestamp("ts", "epoch")
            .unwrap();
        let tree = model.try_match(b"1733280131 log message").unwrap();
        assert_eq!(tree.timestamp_at(["/ts"]).unwrap().timestamp(), 1733280131);
    }

    #[test]
    fn test_missing_timestamp_group_errors() {
        let result = RegexModel::new(r"^\d+")
            .unwrap()
            .with_timestamp("ts", "epoch");
        assert!(matches!(result, Err(ModelError::MissingGroup(_))));
    }

    #[test]
    fn test_unparseable_timestamp_degrades_to_bytes() {
        let model = RegexModel::new(r"^(?P<ts>\S+)")
            .unwrap()
            .with_timestamp("ts", "epoch")
            .unwrap();
        let tree = model.try_match(b"not_a_number rest").unwrap();
        assert!(tree.timestamp_at(["/ts"]).is_none());
        assert_eq!(
            tree.get("/ts"),
            Some(&MatchValue::Bytes(b"not_a_number".to_vec()))
        );
    }
}
