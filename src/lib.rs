mod error;
pub use error::Error;

pub mod encoding;

mod types;
pub use types::*;

pub mod crypto;
pub use crypto::PasswordDerivedSecret;

mod identity_key;
pub use identity_key::*;

mod frame;
pub use frame::*;

mod ratchet;
pub use ratchet::*;

mod handshake;
pub use handshake::*;

pub mod proto;

mod account;
pub use account::*;

pub mod runtime;
