//! FTP control-channel protocol
//!
//! Only the commands needed to open, secure, authenticate and close a control
//! connection are modelled.

pub mod constants;
pub mod decode;
pub mod encode;
pub mod message;

pub use decode::decode_reply;
pub use encode::encode_command;
pub use message::{Command, Reply};
