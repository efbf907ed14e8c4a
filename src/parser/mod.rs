pub mod explodes;
pub mod subparser;

pub use explodes::{explode, share_link};
pub use subparser::{parse_subscription, ParsedSubscription};
