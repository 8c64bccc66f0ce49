//! Types shared by the credential monitor crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
