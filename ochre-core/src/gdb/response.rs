//! Typed responses and their wire serialization.

use std::fmt::Write;

/// POSIX signal numbers used in stop replies.
pub const SIGINT: u8 = 2;
pub const SIGTRAP: u8 = 5;

/// What a stop reply attributes the halt to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopHit {
    #[default]
    None,
    Breakpoint {
        hardware: bool,
    },
    Watchpoint {
        address: u32,
        is_write: bool,
        is_read: bool,
    },
}

/// A stop reply: signal number plus an optional hit annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReason {
    pub signal: u8,
    pub hit: StopHit,
}

impl StopReason {
    /// A plain signal stop with no breakpoint/watchpoint attribution.
    pub fn signal(signal: u8) -> Self {
        Self {
            signal,
            hit: StopHit::None,
        }
    }

    /// A SIGTRAP stop caused by a breakpoint.
    pub fn breakpoint(hardware: bool) -> Self {
        Self {
            signal: SIGTRAP,
            hit: StopHit::Breakpoint { hardware },
        }
    }

    /// A SIGTRAP stop caused by a watchpoint at `address`.
    pub fn watchpoint(address: u32, is_write: bool, is_read: bool) -> Self {
        Self {
            signal: SIGTRAP,
            hit: StopHit::Watchpoint {
                address,
                is_write,
                is_read,
            },
        }
    }
}

/// Everything the stub can answer with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    /// One register value, or `None` for unavailable (`xxxxxxxx`).
    SingleRegister(Option<u32>),
    /// All registers in numbering order; unavailable slots are `None`.
    AllRegisters(Vec<Option<u32>>),
    /// Raw bytes, hex-encoded on the wire. Empty data becomes `E00`.
    RawBytes(Vec<u8>),
    /// The empty response for unsupported commands.
    Unsupported,
    /// `Exx` numeric error.
    ErrorCode(u8),
    /// `E.<text>` error with a message.
    ErrorMessage(String),
    StopReason(StopReason),
    /// One slice of a qXfer object; `done` selects the `l`/`m` prefix.
    QxferSlice { done: bool, data: Vec<u8> },
    /// The fixed feature advertisement.
    QSupported,
}

/// The static qSupported reply.
pub const STUB_FEATURES: &str = "PacketSize=100000;qXfer:features:read+;qXfer:memory-map:read+;\
                                 hwbreak+;swbreak-;error-message+";

impl Response {
    /// Serializes the response body (escaping and run-length encoding are
    /// applied later by the packet encoder).
    pub fn to_wire(&self) -> String {
        match self {
            Response::Ok => "OK".to_string(),
            Response::SingleRegister(Some(value)) => format!("{value:08x}"),
            Response::SingleRegister(None) => "xxxxxxxx".to_string(),
            Response::AllRegisters(values) => {
                let mut wire = String::with_capacity(values.len() * 8);
                for value in values {
                    match value {
                        // Little-endian byte order in textual order.
                        Some(value) => write!(wire, "{:08x}", value.swap_bytes()).unwrap(),
                        None => wire.push_str("xxxxxxxx"),
                    }
                }
                wire
            }
            Response::RawBytes(data) => {
                if data.is_empty() {
                    return "E00".to_string();
                }
                let mut wire = String::with_capacity(data.len() * 2);
                for byte in data {
                    write!(wire, "{byte:02x}").unwrap();
                }
                wire
            }
            Response::Unsupported => String::new(),
            Response::ErrorCode(code) => format!("E{code:02x}"),
            Response::ErrorMessage(message) => format!("E.{message}"),
            Response::StopReason(reason) => {
                let hit = match &reason.hit {
                    StopHit::None => String::new(),
                    StopHit::Breakpoint { hardware: true } => "hwbreak:;".to_string(),
                    StopHit::Breakpoint { hardware: false } => "swbreak:;".to_string(),
                    StopHit::Watchpoint {
                        address,
                        is_write,
                        is_read,
                    } => {
                        let kind = match (is_read, is_write) {
                            (true, true) => "awatch",
                            (true, false) => "rwatch",
                            (false, true) => "watch",
                            (false, false) => return format!("T{:02x}", reason.signal),
                        };
                        format!("{kind}:{address:x};")
                    }
                };
                format!("T{:02x}{hit}", reason.signal)
            }
            Response::QxferSlice { done, data } => {
                let mut wire = String::with_capacity(data.len() + 1);
                wire.push(if *done { 'l' } else { 'm' });
                wire.extend(data.iter().map(|&byte| byte as char));
                wire
            }
            Response::QSupported => STUB_FEATURES.to_string(),
        }
    }
}
