//! Protocol command encoding

use super::constants::CRLF;
use super::message::Command;
use bytes::{BufMut, BytesMut};
use std::io;

/// Encode a command into its wire form, including the trailing CRLF
pub fn encode_command(cmd: &Command) -> io::Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(32);

    match cmd {
        Command::AuthTls => buf.put(&b"AUTH TLS"[..]),
        Command::User(name) => put_with_argument(&mut buf, "USER", name)?,
        Command::Pass(password) => put_with_argument(&mut buf, "PASS", password)?,
        Command::Pbsz(size) => put_with_argument(&mut buf, "PBSZ", &size.to_string())?,
        Command::Prot(level) => put_with_argument(&mut buf, "PROT", &level.to_string())?,
        Command::Quit => buf.put(&b"QUIT"[..]),
    }

    buf.put(CRLF);
    Ok(buf)
}

fn put_with_argument(buf: &mut BytesMut, verb: &str, argument: &str) -> io::Result<()> {
    // A line break inside an argument would smuggle a second command
    if argument.contains(['\r', '\n']) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} argument contains a line break", verb),
        ));
    }

    buf.put(verb.as_bytes());
    buf.put_u8(b' ');
    buf.put(argument.as_bytes());
    Ok(())
}
