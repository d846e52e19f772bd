use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use crate::error::BotError;
use crate::quote::QuoteApi;

/// Commands the assistant knows how to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Stock,
}

impl CommandKind {
    pub const ALL: &'static [CommandKind] = &[CommandKind::Stock];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stock => "stock",
        }
    }
}

impl FromStr for CommandKind {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stock" => Ok(Self::Stock),
            other => Err(BotError::InvalidCommand(other.to_string())),
        }
    }
}

/// Maps command names to their handlers.
pub struct CommandRegistry {
    quotes: Arc<dyn QuoteApi>,
}

impl CommandRegistry {
    pub fn new(quotes: Arc<dyn QuoteApi>) -> Self {
        Self { quotes }
    }

    /// List all command names.
    pub fn names(&self) -> Vec<&'static str> {
        CommandKind::ALL.iter().map(|k| k.as_str()).collect()
    }

    /// Run `name` with its argument and return the text the assistant posts.
    pub async fn execute(&self, name: &str, command: &str) -> Result<String, BotError> {
        let kind: CommandKind = name.parse()?;
        debug!(command = kind.as_str(), argument = command, "executing command");
        match kind {
            CommandKind::Stock => self.stock(command).await,
        }
    }

    async fn stock(&self, symbol: &str) -> Result<String, BotError> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return Err(BotError::MissingArgument("stock"));
        }
        let quote = self.quotes.get_quote(symbol).await?;
        Ok(format!("{} quote is ${} per share", quote.symbol, quote.price))
    }
}
