use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

pub fn now_seconds() -> crate::Result<i64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| crate::se!("invalid duration {:?}", e))?
        .as_secs() as i64)
}

/// Format a timestamp the way spotify's streaming history exports do,
/// e.g. `2024-03-07T21:04:11Z`
pub fn to_history_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Build a `YYYY-MM-DD` date from loose year/month/day query values.
/// Returns `None` for anything that isn't a real calendar date.
pub fn parse_ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let year = year.trim().parse::<i32>().ok()?;
    let month = month.trim().parse::<u32>().ok()?;
    let day = day.trim().parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Strip any directory components and unusual characters from
/// a client-supplied file name
pub fn sanitize_file_name(name: &str) -> String {
    let base = std::path::Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload.json".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn history_timestamp_format() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 7, 21, 4, 11).unwrap();
        assert_eq!(to_history_timestamp(dt), "2024-03-07T21:04:11Z");
    }

    #[test]
    fn parses_unpadded_dates() {
        assert_eq!(
            parse_ymd("2024", "3", "7"),
            NaiveDate::from_ymd_opt(2024, 3, 7)
        );
        assert_eq!(
            parse_ymd("2024", "03", "07").map(|d| d.to_string()),
            Some("2024-03-07".to_string())
        );
        assert_eq!(parse_ymd("2023", "2", "29"), None);
        assert_eq!(parse_ymd("2024", "13", "1"), None);
        assert_eq!(parse_ymd("abc", "1", "1"), None);
    }

    #[test]
    fn sanitizes_file_names() {
        assert_eq!(
            sanitize_file_name("Streaming_History_Audio_2023.json"),
            "Streaming_History_Audio_2023.json"
        );
        assert_eq!(sanitize_file_name("../../etc/passwd.json"), "passwd.json");
        assert_eq!(sanitize_file_name("my history (1).json"), "my_history__1_.json");
        assert_eq!(sanitize_file_name(".."), "upload.json");
    }
}
