pub mod admin;
pub mod events;
pub mod meta;
pub mod state;
