pub mod error;
pub mod pool;
pub mod quote;
pub mod registry;

pub use error::BotError;
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use quote::{Quote, QuoteApi, QuoteError, StooqClient};
pub use registry::{CommandKind, CommandRegistry};
