//! Formatting utilities for Telegram HTML replies.

use std::time::Duration;

use crate::{
    premium::{PremiumRecord, UNLIMITED_TOKENS},
    quota::LimitStatus,
};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// "1 hour 5 minutes", "10 minutes", "45 seconds". Zero-valued units are skipped.
pub fn readable_duration(d: Duration) -> String {
    let total = d.as_secs();
    if total == 0 {
        return "0 seconds".to_string();
    }

    let units = [
        (total / 86_400, "day"),
        ((total % 86_400) / 3600, "hour"),
        ((total % 3600) / 60, "minute"),
        (total % 60, "second"),
    ];

    units
        .iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, unit)| {
            if *n == 1 {
                format!("1 {unit}")
            } else {
                format!("{n} {unit}s")
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Auto-delete notice with `{time}` substituted.
pub fn auto_delete_notice(template: &str, ttl: Duration) -> String {
    template.replace("{time}", &readable_duration(ttl))
}

pub fn quota_status_line(status: &LimitStatus, free_commands: u32) -> String {
    if status.is_unlimited() {
        return "🔥 <b>Unlimited access</b> - no command limits!".to_string();
    }
    if status.remaining > 0 {
        return format!(
            "🆓 <b>Free commands remaining:</b> {}/{free_commands}",
            status.remaining
        );
    }
    format!("⚠️ <b>Command limit reached</b> - verify with /token to get {free_commands} more free commands!")
}

pub fn token_balance(tokens: i64) -> String {
    if tokens == UNLIMITED_TOKENS {
        "Unlimited".to_string()
    } else {
        format!("{tokens} tokens")
    }
}

pub fn premium_line(rec: &PremiumRecord) -> String {
    format!(
        "<code>{}</code> - {} ({}), since {}",
        rec.user_id.0,
        rec.plan,
        token_balance(rec.tokens_remaining),
        rec.granted_at.format("%Y-%m-%d")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html() {
        let s = r#"<a href="x&y">"#;
        assert_eq!(escape_html(s), "&lt;a href=&quot;x&amp;y&quot;&gt;");
    }

    #[test]
    fn readable_duration_skips_empty_units() {
        assert_eq!(readable_duration(Duration::from_secs(600)), "10 minutes");
        assert_eq!(readable_duration(Duration::from_secs(3661)), "1 hour 1 minute 1 second");
        assert_eq!(readable_duration(Duration::from_secs(86_400 * 2)), "2 days");
        assert_eq!(readable_duration(Duration::ZERO), "0 seconds");
    }

    #[test]
    fn notice_substitutes_time() {
        let s = auto_delete_notice("gone in {time}.", Duration::from_secs(45));
        assert_eq!(s, "gone in 45 seconds.");
    }

    #[test]
    fn quota_line_covers_all_states() {
        let unlimited = LimitStatus { needs_verification: false, remaining: LimitStatus::UNLIMITED };
        assert!(quota_status_line(&unlimited, 3).contains("Unlimited"));
        let some = LimitStatus { needs_verification: false, remaining: 2 };
        assert!(quota_status_line(&some, 3).contains("2/3"));
        let none = LimitStatus { needs_verification: true, remaining: 0 };
        assert!(quota_status_line(&none, 3).contains("/token"));
    }
}
