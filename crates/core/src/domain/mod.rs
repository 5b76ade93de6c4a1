pub mod progress;
pub mod resource;
pub mod session;
