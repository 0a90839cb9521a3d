pub mod cli;
pub mod core;
pub mod features;
pub mod scraping;
pub mod tools;

// --- Primary core exports ---
pub use core::types;
pub use core::types::*;
pub use core::{AppConfig, ChatError};

// --- Flat module paths ---
pub use features::{auth, controller, conversation, detector, locator, portal, session_store};
pub use scraping::dom;
pub use tools::{batch, export};
