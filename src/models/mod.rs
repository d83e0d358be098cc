pub mod chat;
pub mod driver;
pub mod event;
pub mod history;
pub mod order;
