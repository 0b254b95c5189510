//! Audience fixtures with a scripted Bot API answer per user.

use audience_verify::models::audience::{NewAudienceRecord, Outcome};
use audience_verify::services::telegram::PingFailure;

pub struct AudienceMember {
    pub user_id: i64,
    pub locale: &'static str,
    pub outcome: Outcome,
}

impl AudienceMember {
    /// Bot API answer that classifies to this member's expected outcome.
    pub fn response(&self) -> Result<(), PingFailure> {
        match self.outcome {
            Outcome::Ok => Ok(()),
            Outcome::Blocked => Err(PingFailure::api(403, "Forbidden: bot was blocked by the user")),
            Outcome::NotStarted => Err(PingFailure::api(400, "Bad Request: chat not found")),
            Outcome::OtherError => Err(PingFailure::api(403, "Forbidden: user is deactivated")),
        }
    }
}

/// 30 users: 20 reachable, 5 blocked, 3 never started the bot, 2 deactivated.
pub fn mixed_audience() -> Vec<AudienceMember> {
    const LOCALES: [&str; 4] = ["en", "ru", "pt-BR", ""];
    (1..=30)
        .map(|user_id| {
            let outcome = match user_id {
                1..=20 => Outcome::Ok,
                21..=25 => Outcome::Blocked,
                26..=28 => Outcome::NotStarted,
                _ => Outcome::OtherError,
            };
            AudienceMember { user_id, locale: LOCALES[user_id as usize % LOCALES.len()], outcome }
        })
        .collect()
}

/// `count` reachable users with ids `1..=count`.
pub fn reachable_audience(count: i64) -> Vec<AudienceMember> {
    (1..=count)
        .map(|user_id| AudienceMember { user_id, locale: "en", outcome: Outcome::Ok })
        .collect()
}

pub fn as_records(members: &[AudienceMember]) -> Vec<NewAudienceRecord> {
    members
        .iter()
        .map(|m| NewAudienceRecord { user_id: m.user_id, locale: m.locale.to_string() })
        .collect()
}
