// opentxs common library - main library exports

pub mod commands;
pub mod hash;
pub mod messages;
pub mod queries;
pub mod types;
pub mod work;

// Flattened re-exports
pub use self::hash::{BlockHash, FilterHash, Hash};
pub use self::types::*;
pub use self::work::Work;
