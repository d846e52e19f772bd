pub mod database;
pub mod error;
pub mod rooms;
pub mod schema;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use rooms::RoomRepo;
pub use users::UserRepo;
