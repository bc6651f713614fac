#[cfg(feature = "url_encoding")]
pub mod url_encoding;
pub mod random;

#[cfg(feature = "url_encoding")]
pub use url_encoding::{append_query, decode_url_owned, encode_pairs, encode_url_owned, parse_pairs};
pub use random::random_alphanumeric_string;
