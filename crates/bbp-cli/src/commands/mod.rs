pub mod common;
pub mod info;
pub mod pair;
pub mod pubkey;
pub mod sign;
