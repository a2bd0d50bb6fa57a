pub mod error;
pub mod neynar;
pub mod session;
pub mod signer;
