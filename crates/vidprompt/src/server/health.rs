use chrono::{SecondsFormat, Utc};

/// `GET /api/healthcheck`: plain-text liveness probe.
pub async fn check() -> String {
    format!("OK {}", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}
