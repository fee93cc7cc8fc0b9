//! Identity: signing keys, client ids, and session state

mod keypair;
mod session;

pub use keypair::{Keypair, PublicKey, Signature};
pub use session::{ClientId, SessionManager};
