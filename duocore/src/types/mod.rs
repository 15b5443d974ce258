pub mod call;
pub mod events;
pub mod message;
pub mod room;
pub mod user;
