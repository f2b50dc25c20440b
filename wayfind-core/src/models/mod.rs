pub mod conversation;
pub mod entity;
