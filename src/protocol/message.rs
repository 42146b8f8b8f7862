//! Protocol message types

use std::fmt;

/// Command sent on the control connection (client → server)
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    /// `AUTH TLS`: request explicit TLS upgrade
    AuthTls,

    /// `USER <name>`
    User(String),

    /// `PASS <password>`
    Pass(String),

    /// `PBSZ <size>`: protection buffer size, always 0 for TLS
    Pbsz(u32),

    /// `PROT <level>`: data channel protection level (`P` = private)
    Prot(char),

    /// `QUIT`
    Quit,
}

impl Command {
    /// Command verb, used in logs and errors
    pub fn verb(&self) -> &'static str {
        match self {
            Self::AuthTls => "AUTH",
            Self::User(_) => "USER",
            Self::Pass(_) => "PASS",
            Self::Pbsz(_) => "PBSZ",
            Self::Prot(_) => "PROT",
            Self::Quit => "QUIT",
        }
    }
}

// Keeps passwords out of logs.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthTls => f.write_str("AUTH TLS"),
            Self::User(name) => write!(f, "USER {}", name),
            Self::Pass(_) => f.write_str("PASS ****"),
            Self::Pbsz(size) => write!(f, "PBSZ {}", size),
            Self::Prot(level) => write!(f, "PROT {}", level),
            Self::Quit => f.write_str("QUIT"),
        }
    }
}

/// Reply read from the control connection (server → client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit reply code
    pub code: u16,
    /// Text lines, without the code prefix and line terminators
    pub lines: Vec<String>,
}

impl Reply {
    /// 1xx
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// 2xx
    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// 3xx
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Reply text joined into one line
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message())
    }
}
