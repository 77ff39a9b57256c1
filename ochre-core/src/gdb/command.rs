//! Parsing of decoded packet bodies into typed commands.

use std::collections::BTreeMap;

/// Every packet the stub understands, in typed form.
///
/// [`parse`] recognizes commands by their first byte; anything unknown or
/// malformed comes back as `None` and is answered with an empty
/// (unsupported) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `+` / `-`: acknowledgement of the last packet we sent.
    Ack { ok: bool },
    /// `0x03` (Ctrl-C): interrupt a running target.
    Interrupt,
    /// `!`: enable persistent (extended) mode.
    EnablePersistent,
    /// `?`: ask why the target halted.
    AskHaltReason,
    /// `c[addr]`: continue, optionally from a new PC.
    Continue { address: Option<u32> },
    /// `g`: read all registers.
    ReadAllRegisters,
    /// `G<words>`: write all registers; only parsed slots are present.
    WriteAllRegisters { values: BTreeMap<u16, u32> },
    /// `i[addr[,cycles]]`: step by cycles.
    StepCycles {
        address: Option<u32>,
        cycles: Option<u32>,
    },
    /// `k`: kill the session.
    Kill,
    /// `R<payload>`: restart the target.
    Restart,
    /// `m<addr>,<len>`: read memory.
    ReadMemory { address: u32, length: u32 },
    /// `M<addr>,<len>:<hex>`: write memory.
    WriteMemory { address: u32, data: Vec<u8> },
    /// `p<regno>`: read one register.
    ReadSingleRegister { regno: u32 },
    /// `P<regno>=<value>`: write one register.
    WriteSingleRegister { regno: u32, value: u32 },
    /// `s[addr]`: step one instruction.
    StepSingleInst { address: Option<u32> },
    /// `qSupported:<features>`: feature negotiation.
    QuerySupported {
        features: BTreeMap<String, HostFeature>,
    },
    /// `qXfer:features:read:<annex>:<off>,<len>`.
    ReadFeatureXml {
        annex: String,
        offset: u32,
        length: u32,
    },
    /// `qXfer:memory-map:read::<off>,<len>`.
    ReadMemoryMapXml { offset: u32, length: u32 },
    /// `Z0`/`Z1`, with an optional conditional bytecode.
    AddBreakpoint {
        hardware: bool,
        address: u32,
        length: u32,
        condition: Option<Vec<u8>>,
    },
    /// `Z2`/`Z3`/`Z4`.
    AddWatchpoint {
        watch_write: bool,
        watch_read: bool,
        address: u32,
        length: u32,
    },
    /// `z0`/`z1`.
    RemoveBreakpoint {
        hardware: bool,
        address: u32,
        length: u32,
    },
    /// `z2`/`z3`/`z4`.
    RemoveWatchpoint {
        watch_write: bool,
        watch_read: bool,
        address: u32,
        length: u32,
    },
}

/// The host's advertisement for one qSupported feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostFeature {
    Supported,
    Unsupported,
    Unknown,
    Value(String),
}

/// Parses a hex number with no sign, prefix, or trailing garbage.
fn parse_hex(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(text, 16).ok()
}

/// Parses `"<hex>,<hex>"`.
fn parse_hex_pair(text: &str) -> Option<(u32, u32)> {
    let (first, second) = text.split_once(',')?;
    Some((parse_hex(first)?, parse_hex(second)?))
}

/// Parses an even-length string of hex digit pairs into bytes.
fn parse_hex_bytes(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            parse_hex(pair).map(|value| value as u8)
        })
        .collect()
}

fn parse_continue(params: &str) -> Option<Command> {
    if params.is_empty() {
        return Some(Command::Continue { address: None });
    }
    Some(Command::Continue {
        address: Some(parse_hex(params)?),
    })
}

fn parse_step_single(params: &str) -> Option<Command> {
    if params.is_empty() {
        return Some(Command::StepSingleInst { address: None });
    }
    Some(Command::StepSingleInst {
        address: Some(parse_hex(params)?),
    })
}

fn parse_write_all_registers(params: &str) -> Option<Command> {
    if params.is_empty() || params.len() % 8 != 0 {
        return None;
    }
    let mut values = BTreeMap::new();
    for (index, chunk) in params.as_bytes().chunks(8).enumerate() {
        let chunk = std::str::from_utf8(chunk).ok()?;
        if chunk == "xxxxxxxx" {
            continue;
        }
        values.insert(index as u16, parse_hex(chunk)?);
    }
    Some(Command::WriteAllRegisters { values })
}

fn parse_step_cycles(params: &str) -> Option<Command> {
    if params.is_empty() {
        return Some(Command::StepCycles {
            address: None,
            cycles: None,
        });
    }
    let parts: Vec<u32> = params
        .split(',')
        .map(parse_hex)
        .collect::<Option<Vec<u32>>>()?;
    match parts[..] {
        [address] => Some(Command::StepCycles {
            address: Some(address),
            cycles: None,
        }),
        [address, cycles] => Some(Command::StepCycles {
            address: Some(address),
            cycles: Some(cycles),
        }),
        _ => None,
    }
}

fn parse_read_memory(params: &str) -> Option<Command> {
    let (address, length) = parse_hex_pair(params)?;
    Some(Command::ReadMemory { address, length })
}

fn parse_write_memory(params: &str) -> Option<Command> {
    let (location, data) = params.split_once(':')?;
    if location.is_empty() || data.is_empty() {
        return None;
    }
    let (address, length) = parse_hex_pair(location)?;
    if data.len() as u64 != u64::from(length) * 2 {
        return None;
    }
    Some(Command::WriteMemory {
        address,
        data: parse_hex_bytes(data)?,
    })
}

fn parse_read_single_register(params: &str) -> Option<Command> {
    if params.is_empty() || params.len() > 4 {
        return None;
    }
    Some(Command::ReadSingleRegister {
        regno: parse_hex(params)?,
    })
}

fn parse_write_single_register(params: &str) -> Option<Command> {
    let (regno, value) = params.split_once('=')?;
    if regno.is_empty() || regno.len() > 4 || value.len() != 8 {
        return None;
    }
    Some(Command::WriteSingleRegister {
        regno: parse_hex(regno)?,
        value: parse_hex(value)?,
    })
}

fn parse_query_supported(params: &str) -> Option<Command> {
    let mut features = BTreeMap::new();
    for entry in params.split(';') {
        // Entries without any of the four separators are ignored.
        let Some(position) = entry.rfind(['+', '-', '?', '=']) else {
            continue;
        };
        let name = entry[..position].to_string();
        let status = match entry.as_bytes()[position] {
            b'+' => HostFeature::Supported,
            b'-' => HostFeature::Unsupported,
            b'?' => HostFeature::Unknown,
            b'=' => HostFeature::Value(entry[position + 1..].to_string()),
            _ => unreachable!(),
        };
        features.insert(name, status);
    }
    Some(Command::QuerySupported { features })
}

fn parse_qxfer(params: &str) -> Option<Command> {
    if let Some(rest) = params.strip_prefix("features:read:") {
        let (annex, span) = rest.split_once(':')?;
        let (offset, length) = parse_hex_pair(span)?;
        return Some(Command::ReadFeatureXml {
            annex: annex.to_string(),
            offset,
            length,
        });
    }
    if let Some(rest) = params.strip_prefix("memory-map:read:") {
        let (_annex, span) = rest.split_once(':')?;
        let (offset, length) = parse_hex_pair(span)?;
        return Some(Command::ReadMemoryMapXml { offset, length });
    }
    None
}

fn parse_query(params: &str) -> Option<Command> {
    let (kind, rest) = params.split_once(':')?;
    if kind.is_empty() || rest.is_empty() {
        return None;
    }
    match kind {
        "Supported" => parse_query_supported(rest),
        "Xfer" => parse_qxfer(rest),
        _ => None,
    }
}

/// Parses the `X<hexlen>,<hexbytes>` conditional-bytecode suffix.
fn parse_bytecode(text: &str) -> Option<Vec<u8>> {
    let rest = text.strip_prefix('X')?;
    let (length, data) = rest.split_once(',')?;
    if length.is_empty() || data.is_empty() {
        return None;
    }
    let length = parse_hex(length)?;
    if data.len() as u64 != u64::from(length) * 2 {
        return None;
    }
    parse_hex_bytes(data)
}

fn parse_insert_stop_point(params: &str) -> Option<Command> {
    let mut bytes = params.bytes();
    let kind = bytes.next()?;
    if bytes.next() != Some(b',') {
        return None;
    }
    let rest = &params[2..];

    match kind {
        b'0' | b'1' => {
            let parts: Vec<&str> = rest.split(';').collect();
            if parts.is_empty() || parts.len() > 3 {
                return None;
            }
            let (address, length) = parse_hex_pair(parts[0])?;
            let condition = match parts.get(1) {
                Some(part) => Some(parse_bytecode(part)?),
                None => None,
            };
            Some(Command::AddBreakpoint {
                hardware: kind == b'1',
                address,
                length,
                condition,
            })
        }
        b'2' | b'3' | b'4' => {
            let (address, length) = parse_hex_pair(rest)?;
            Some(Command::AddWatchpoint {
                watch_write: kind == b'2' || kind == b'4',
                watch_read: kind == b'3' || kind == b'4',
                address,
                length,
            })
        }
        _ => None,
    }
}

fn parse_remove_stop_point(params: &str) -> Option<Command> {
    let mut bytes = params.bytes();
    let kind = bytes.next()?;
    if bytes.next() != Some(b',') {
        return None;
    }
    let (address, length) = parse_hex_pair(&params[2..])?;

    match kind {
        b'0' | b'1' => Some(Command::RemoveBreakpoint {
            hardware: kind == b'1',
            address,
            length,
        }),
        b'2' | b'3' | b'4' => Some(Command::RemoveWatchpoint {
            watch_write: kind == b'2' || kind == b'4',
            watch_read: kind == b'3' || kind == b'4',
            address,
            length,
        }),
        _ => None,
    }
}

/// Parses one decoded packet body into a [`Command`].
pub fn parse(body: &str) -> Option<Command> {
    if body.is_empty() {
        return None;
    }

    if body.len() == 1 {
        match body.as_bytes()[0] {
            b'+' => return Some(Command::Ack { ok: true }),
            b'-' => return Some(Command::Ack { ok: false }),
            0x03 => return Some(Command::Interrupt),
            b'!' => return Some(Command::EnablePersistent),
            b'?' => return Some(Command::AskHaltReason),
            b'g' => return Some(Command::ReadAllRegisters),
            b'k' => return Some(Command::Kill),
            _ => {}
        }
    }

    let params = &body[1..];
    match body.as_bytes()[0] {
        b'c' => parse_continue(params),
        b'G' => parse_write_all_registers(params),
        b'i' => parse_step_cycles(params),
        b'm' => parse_read_memory(params),
        b'M' => parse_write_memory(params),
        b'p' => parse_read_single_register(params),
        b'P' => parse_write_single_register(params),
        b'R' => Some(Command::Restart),
        b's' => parse_step_single(params),
        b'q' => parse_query(params),
        b'z' => parse_remove_stop_point(params),
        b'Z' => parse_insert_stop_point(params),
        _ => None,
    }
}
