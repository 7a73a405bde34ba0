pub mod health;
pub mod message;
pub mod room;
pub mod ws;
