pub mod audience;
pub mod job;
pub mod verification;

/// Bot identifier, assigned by the onboarding collaborator.
pub type BotId = i64;

/// Opaque numeric end-user identifier; also the resume/sort key of a job.
pub type UserId = i64;
