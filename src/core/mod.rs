pub mod error;
pub mod letter;
pub mod store;

pub use error::{LetterError, Result};
pub use letter::{next_hour_after, Letter, LetterStatus, Theme};
pub use store::{LetterStore, LetterUpdate};
