mod health;
mod session;
mod settings;
pub mod sse;

pub use health::*;
pub use session::*;
pub use settings::*;
