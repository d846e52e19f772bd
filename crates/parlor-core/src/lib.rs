pub mod amqp;
pub mod broker;
pub mod commands;
pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod rooms;
pub mod users;

pub use amqp::{AmqpBroker, QueueSide};
pub use broker::{Broker, MemoryBroker};
pub use errors::{BrokerError, DecodeError, RoomStoreError, UserStoreError};
pub use events::{Action, Event};
pub use identity::AuthenticatedUser;
pub use ids::{RoomId, SessionId, UserId};
