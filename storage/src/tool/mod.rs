pub mod current_time;
pub mod error;

// Re-export commonly used types
pub use current_time::CurrentTime;
pub use error::*;
