pub mod generations;
pub mod sessions;
pub mod token_usage;

pub use generations::Model as Generation;
pub use sessions::{Model as Session, SessionStatus};
pub use token_usage::Model as TokenUsage;
