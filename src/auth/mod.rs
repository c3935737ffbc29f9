pub mod token;

pub use token::{AccessToken, TOKEN_BYTES, TokenAuthority};
