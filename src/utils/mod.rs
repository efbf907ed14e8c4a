pub mod base64;
pub mod net;
pub mod url;
pub mod version;

pub use url::{url_decode, url_encode};
