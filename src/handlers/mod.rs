mod root;

pub use root::{GREETING, NOT_FOUND_MESSAGE, greeting, not_found};
