use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generates an id of the form `{prefix}-{YYYYMMDD}-{hex6}`, sortable by
/// creation day and collision-resistant within a day.
pub fn generate_id(prefix: &str, now: DateTime<Utc>) -> String {
    let day = now.format("%Y%m%d");
    let hex6 = &Uuid::new_v4().simple().to_string()[..6];
    format!("{prefix}-{day}-{hex6}")
}

/// Extracts the `YYYYMMDD` creation-day component from an id produced by
/// [`generate_id`], if the id follows that shape.
pub fn day_component(id: &str) -> Option<&str> {
    let mut parts = id.rsplitn(3, '-');
    let _hex6 = parts.next()?;
    let day = parts.next()?;
    if day.len() == 8 && day.bytes().all(|b| b.is_ascii_digit()) {
        Some(day)
    } else {
        None
    }
}
