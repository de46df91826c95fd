use thiserror::Error;

#[derive(Error, Debug)]
pub enum DealScoutError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Group not found: {0}")]
    GroupNotFound(uuid::Uuid),

    #[error("Schedule not found: {0}")]
    ScheduleNotFound(uuid::Uuid),

    #[error("Schedule busy: a scrape for this schedule is already in progress")]
    ScheduleBusy,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
