//! FTP protocol constants

/// Default control port for plain and explicit FTPS
pub const DEFAULT_PORT: u16 = 21;

/// Default control port for implicit FTPS
pub const DEFAULT_IMPLICIT_PORT: u16 = 990;

/// Line terminator for commands and replies
pub const CRLF: &[u8] = b"\r\n";

/// Reply codes used during login and logout
pub mod codes {
    /// Service ready in nnn minutes (greeting is delayed)
    pub const SERVICE_READY_SOON: u16 = 120;

    /// Command okay
    pub const COMMAND_OK: u16 = 200;

    /// Command not implemented, superfluous at this site
    pub const SUPERFLUOUS: u16 = 202;

    /// Service ready for new user
    pub const SERVICE_READY: u16 = 220;

    /// Service closing control connection
    pub const CLOSING: u16 = 221;

    /// User logged in, proceed
    pub const LOGGED_IN: u16 = 230;

    /// Security data exchange complete (AUTH accepted)
    pub const AUTH_OK: u16 = 234;

    /// User name okay, need password
    pub const NEED_PASSWORD: u16 = 331;

    /// Security mechanism accepted, continue (some servers answer AUTH with it)
    pub const AUTH_CONTINUE: u16 = 334;
}
