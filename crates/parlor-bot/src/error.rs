use crate::quote::QuoteError;

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("invalid command")]
    InvalidCommand(String),

    #[error("{0} requires an argument")]
    MissingArgument(&'static str),

    #[error("quote error: {0}")]
    Quote(#[from] QuoteError),
}
