mod signer;
mod rsa;
mod hmac;
pub mod encoding;

pub use signer::PayloadSigner;
pub use self::rsa::{RsaSigner, handshake_secret, sign_handshake};
pub use self::hmac::HmacSigner;
pub use encoding::base64_to_hex;
