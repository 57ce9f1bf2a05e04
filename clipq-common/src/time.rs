//! Timestamp utilities

use chrono::Utc;

/// Current time as milliseconds since the Unix epoch
///
/// Store and queue rows keep lease expiries in this form so that expiry
/// comparisons happen inside a single SQL statement.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Milliseconds from now, saturating on overflow
pub fn deadline_ms(after: std::time::Duration) -> i64 {
    let delta = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
    now_ms().saturating_add(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_ms_is_recent() {
        let ms = now_ms();
        assert!(ms > 946_684_800_000); // 2000-01-01
        assert!(ms < 4_102_444_800_000); // 2100-01-01
    }

    #[tokio::test]
    async fn test_now_ms_advances() {
        let t1 = now_ms();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let t2 = now_ms();
        assert!(t2 > t1);
    }

    #[test]
    fn test_deadline_is_in_future() {
        let before = now_ms();
        let deadline = deadline_ms(Duration::from_secs(5));
        assert!(deadline >= before + 5000);
    }

    #[test]
    fn test_deadline_saturates() {
        let deadline = deadline_ms(Duration::from_secs(u64::MAX));
        assert_eq!(deadline, i64::MAX);
    }
}
