pub mod auth;
pub mod controller;
pub mod conversation;
pub mod detector;
pub mod locator;
pub mod portal;
pub mod session_store;
