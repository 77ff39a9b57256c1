//! The remote debug stub: protocol plumbing and the session controller.

pub mod accessor;
pub mod command;
pub mod expr;
pub mod network;
pub mod packet;
pub mod response;
pub mod stop_point;
pub mod xml;

use crate::board::Board;
use crate::gdb::accessor::{MemoryAccessor, RegisterAccessor, REGNO_CSR_BASE};
use crate::gdb::command::Command;
use crate::gdb::network::{NetworkError, NetworkHandler};
use crate::gdb::response::{Response, StopReason, SIGINT, SIGTRAP};
use crate::gdb::stop_point::{AddressRange, Breakpoint, Watchpoint};
use crate::bus::Bus;
use crate::core::csr;
use crate::core::lsu::MemOp;
use crate::core::StepRecord;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

/// How often the poller checks the worker for completion.
const COMPLETION_POLL: Duration = Duration::from_millis(50);

/// One debugger session over a machine.
///
/// The controller alternates between two modes: while halted it serves
/// commands from [`NetworkHandler::receive`]; while running it hands the
/// machine to a worker thread and keeps polling the connection, forwarding
/// interrupt requests through a shared flag. The worker's stop reason comes
/// back through a one-shot channel and is reported to the debugger.
pub struct DebugSession {
    board: Board,
    network: NetworkHandler,
    breakpoints: BTreeMap<u32, Breakpoint>,
    watchpoints: BTreeMap<AddressRange, Watchpoint>,
}

/// Why the session loop ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SessionEnd {
    /// The debugger asked to kill the target.
    Killed,
    /// A fatal protocol or internal problem.
    Fatal,
}

impl DebugSession {
    /// Creates a session listening on `port`.
    pub fn new(board: Board, port: u16) -> std::io::Result<Self> {
        let network = NetworkHandler::bind(port)?;
        log::info!("debug stub listening on port {}", network.port());
        Ok(Self {
            board,
            network,
            breakpoints: BTreeMap::new(),
            watchpoints: BTreeMap::new(),
        })
    }

    /// The TCP port the stub listens on.
    pub fn port(&self) -> u16 {
        self.network.port()
    }

    /// Serves the debugger until it kills the session or a fatal error
    /// occurs. Connection drops re-accept on the next iteration.
    pub fn run(&mut self) {
        loop {
            let command = match self.network.receive() {
                Ok(command) => command,
                Err(NetworkError::InternalFail) => {
                    log::warn!("internal error on the debug connection");
                    self.network.close();
                    return;
                }
                Err(NetworkError::ConnectionFault) => {
                    log::warn!("connection to the debugger lost");
                    self.network.close();
                    continue;
                }
                Err(NetworkError::ProtocolFail) => {
                    log::warn!("debugger violated the remote protocol");
                    self.network.close();
                    continue;
                }
                Err(NetworkError::DecodeFail) => {
                    self.send_response(&Response::Unsupported);
                    continue;
                }
                Err(NetworkError::ProtocolRetry) => continue,
            };

            match self.handle_command(command) {
                None => {}
                Some(SessionEnd::Killed) => {
                    log::info!("debugger requested kill; ending session");
                    return;
                }
                Some(SessionEnd::Fatal) => {
                    self.network.close();
                    return;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) -> Option<SessionEnd> {
        match command {
            // Stray acknowledgements between requests carry no information.
            Command::Ack { .. } => {}
            Command::Kill => return Some(SessionEnd::Killed),
            Command::Restart => {
                log::info!("debugger requested restart; clearing RAM");
                self.board.reset_ram();
            }
            Command::Interrupt => {
                log::warn!("interrupt received while halted");
                return Some(SessionEnd::Fatal);
            }
            Command::EnablePersistent => self.send_response(&Response::Ok),
            Command::AskHaltReason => {
                self.send_response(&Response::StopReason(StopReason::signal(SIGINT)))
            }
            Command::QuerySupported { .. } => self.send_response(&Response::QSupported),
            Command::ReadFeatureXml {
                annex,
                offset,
                length,
            } => self.handle_read_feature_xml(&annex, offset, length),
            Command::ReadMemoryMapXml { offset, length } => {
                let slice = xml::memory_map_slice(offset, length);
                self.send_response(&Response::QxferSlice {
                    done: slice.is_end,
                    data: slice.data,
                });
            }
            Command::ReadMemory { address, length } => self.handle_read_memory(address, length),
            Command::WriteMemory { address, data } => self.handle_write_memory(address, &data),
            Command::ReadAllRegisters => self.handle_read_all_registers(),
            Command::WriteAllRegisters { values } => {
                let mut registers = RegisterAccessor {
                    cpu: &mut self.board.cpu,
                };
                for (regno, value) in values {
                    registers.write(u32::from(regno), value);
                }
                self.send_response(&Response::Ok);
            }
            Command::ReadSingleRegister { regno } => {
                let mut registers = RegisterAccessor {
                    cpu: &mut self.board.cpu,
                };
                let value = registers.read(regno);
                self.send_response(&Response::SingleRegister(value));
            }
            Command::WriteSingleRegister { regno, value } => {
                let mut registers = RegisterAccessor {
                    cpu: &mut self.board.cpu,
                };
                registers.write(regno, value);
                self.send_response(&Response::Ok);
            }
            Command::AddBreakpoint {
                hardware,
                address,
                length,
                condition,
            } => self.handle_add_breakpoint(hardware, address, length, condition),
            Command::RemoveBreakpoint {
                hardware, address, ..
            } => self.handle_remove_breakpoint(hardware, address),
            Command::AddWatchpoint {
                watch_write,
                watch_read,
                address,
                length,
            } => self.handle_add_watchpoint(watch_write, watch_read, address, length),
            Command::RemoveWatchpoint {
                address, length, ..
            } => self.handle_remove_watchpoint(address, length),
            Command::Continue { address } => {
                if let Some(address) = address {
                    self.board.cpu.pc = address;
                }
                self.async_run(run_until_trap);
            }
            Command::StepSingleInst { address } => {
                if let Some(address) = address {
                    self.board.cpu.pc = address;
                }
                self.async_run(|board, stops, interrupt| run_steps(1, board, stops, interrupt));
            }
            Command::StepCycles { address, cycles } => {
                if let Some(address) = address {
                    self.board.cpu.pc = address;
                }
                let cycles = u64::from(cycles.unwrap_or(1));
                self.async_run(move |board, stops, interrupt| {
                    run_steps(cycles, board, stops, interrupt)
                });
            }
        }
        None
    }

    fn send_response(&mut self, response: &Response) {
        if let Err(error) = self.network.send(response) {
            log::warn!("failed to deliver response ({error}); dropping connection");
            self.network.close();
        }
    }

    fn handle_read_feature_xml(&mut self, annex: &str, offset: u32, length: u32) {
        match xml::annex_slice(annex, offset, length) {
            Some(slice) => self.send_response(&Response::QxferSlice {
                done: slice.is_end,
                data: slice.data,
            }),
            None => {
                self.send_response(&Response::ErrorMessage(format!("Unknown annex: {annex}")))
            }
        }
    }

    /// Collects `length` bytes starting at `address` through aligned word
    /// reads, one read per touched word. A failed read truncates the data.
    fn handle_read_memory(&mut self, address: u32, length: u32) {
        let mut data = Vec::with_capacity(length as usize);
        let mut offset = 0;
        'words: while offset < length {
            let current = address.wrapping_add(offset);
            let word = match self.board.map.read(u64::from(current & !0x3)) {
                Ok(word) => word,
                Err(_) => break,
            };
            let bytes = word.to_le_bytes();
            for lane in (current & 0x3)..4 {
                if offset >= length {
                    break 'words;
                }
                data.push(bytes[lane as usize]);
                offset += 1;
            }
        }
        self.send_response(&Response::RawBytes(data));
    }

    fn handle_write_memory(&mut self, address: u32, data: &[u8]) {
        let mut memory = MemoryAccessor {
            bus: &mut self.board.map,
        };
        for (offset, &byte) in data.iter().enumerate() {
            if !memory.write(address.wrapping_add(offset as u32), byte) {
                self.send_response(&Response::ErrorCode(0));
                return;
            }
        }
        self.send_response(&Response::Ok);
    }

    fn handle_read_all_registers(&mut self) {
        let mut registers = RegisterAccessor {
            cpu: &mut self.board.cpu,
        };
        let regnos = (0..33).chain(
            csr::METADATA
                .iter()
                .map(|meta| u32::from(meta.address) + REGNO_CSR_BASE),
        );
        let values: Vec<Option<u32>> = regnos.map(|regno| registers.read(regno)).collect();
        self.send_response(&Response::AllRegisters(values));
    }

    fn handle_add_breakpoint(
        &mut self,
        hardware: bool,
        address: u32,
        length: u32,
        condition: Option<Vec<u8>>,
    ) {
        if !hardware {
            self.send_response(&Response::Unsupported);
            return;
        }
        if length != 4 {
            self.send_response(&Response::ErrorMessage(
                "Only 4-byte breakpoints are supported".to_string(),
            ));
            return;
        }
        self.breakpoints
            .insert(address, Breakpoint { address, condition });
        self.send_response(&Response::Ok);
    }

    fn handle_remove_breakpoint(&mut self, hardware: bool, address: u32) {
        if !hardware {
            self.send_response(&Response::Unsupported);
            return;
        }
        if self.breakpoints.remove(&address).is_none() {
            self.send_response(&Response::ErrorMessage("No such breakpoint".to_string()));
            return;
        }
        self.send_response(&Response::Ok);
    }

    fn handle_add_watchpoint(
        &mut self,
        watch_write: bool,
        watch_read: bool,
        address: u32,
        length: u32,
    ) {
        if length == 0 {
            self.send_response(&Response::ErrorMessage(
                "Watchpoint length must be greater than 0".to_string(),
            ));
            return;
        }
        if !watch_read && !watch_write {
            self.send_response(&Response::ErrorMessage(
                "Watchpoint must watch read or write".to_string(),
            ));
            return;
        }
        let range = AddressRange {
            start: address,
            size: length,
        };
        self.watchpoints.insert(
            range,
            Watchpoint {
                watch_write,
                watch_read,
                range,
            },
        );
        self.send_response(&Response::Ok);
    }

    fn handle_remove_watchpoint(&mut self, address: u32, length: u32) {
        let range = AddressRange {
            start: address,
            size: length,
        };
        if self.watchpoints.remove(&range).is_none() {
            self.send_response(&Response::ErrorMessage("No such watchpoint".to_string()));
            return;
        }
        self.send_response(&Response::Ok);
    }

    /// Runs `run` on a worker thread while polling the connection.
    ///
    /// An interrupt or halt-reason packet raises the shared cancel flag; any
    /// other packet mid-run drops the connection (the flag is raised anyway
    /// so the worker can be joined, but its stop reason is discarded).
    fn async_run<F>(&mut self, run: F)
    where
        F: FnOnce(&mut Board, &StopPoints<'_>, &AtomicBool) -> StopReason + Send,
    {
        let interrupt = AtomicBool::new(false);
        let (sender, receiver) = mpsc::sync_channel::<StopReason>(1);

        let board = &mut self.board;
        let stops = StopPoints {
            breakpoints: &self.breakpoints,
            watchpoints: &self.watchpoints,
        };
        let network = &mut self.network;

        let outcome = std::thread::scope(|scope| {
            let interrupt = &interrupt;
            scope.spawn(move || {
                let _ = sender.send(run(board, &stops, interrupt));
            });

            loop {
                match receiver.recv_timeout(COMPLETION_POLL) {
                    Ok(reason) => break Some(reason),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break None,
                }

                match network.try_receive() {
                    Ok(Some(Command::Interrupt)) | Ok(Some(Command::AskHaltReason)) => {
                        interrupt.store(true, Ordering::Release);
                    }
                    Ok(Some(_)) => {
                        log::warn!("unexpected packet while running; dropping connection");
                        interrupt.store(true, Ordering::Release);
                        network.close();
                        let _ = receiver.recv();
                        break None;
                    }
                    Ok(None) | Err(_) => {}
                }
            }
        });

        if let Some(reason) = outcome {
            self.send_response(&Response::StopReason(reason));
        }
    }
}

/// The stop-point maps a running worker consults after every cycle.
pub struct StopPoints<'a> {
    pub breakpoints: &'a BTreeMap<u32, Breakpoint>,
    pub watchpoints: &'a BTreeMap<AddressRange, Watchpoint>,
}

impl StopPoints<'_> {
    /// Does a breakpoint (with a passing condition) sit at the current PC?
    fn breakpoint_hit(&self, board: &mut Board) -> bool {
        let Some(breakpoint) = self.breakpoints.get(&board.cpu.pc) else {
            return false;
        };
        let Board { cpu, map } = board;
        breakpoint.is_triggered_by(cpu, map)
    }

    /// Did the just-executed cycle touch a watchpoint in a watched
    /// direction? Returns `(read_matched, write_matched)`.
    fn watchpoint_hit(&self, record: &StepRecord) -> Option<(bool, bool)> {
        if record.mem_op == MemOp::None {
            return None;
        }
        let size = record.mem_funct.size();
        if size == 0 {
            return None;
        }

        let is_write = record.mem_op == MemOp::Store;
        let is_read = record.mem_op == MemOp::Load;

        let watchpoint = self.watchpoints.get(&AddressRange {
            start: record.alu_result,
            size,
        })?;

        if !(is_write && watchpoint.watch_write) && !(is_read && watchpoint.watch_read) {
            return None;
        }
        Some((
            is_read && watchpoint.watch_read,
            is_write && watchpoint.watch_write,
        ))
    }
}

/// Steps until a stop point fires or the cancel flag is raised.
fn run_until_trap(board: &mut Board, stops: &StopPoints<'_>, interrupt: &AtomicBool) -> StopReason {
    loop {
        let record = board.step();

        if stops.breakpoint_hit(board) {
            return StopReason::breakpoint(true);
        }
        if let Some((read_hit, write_hit)) = stops.watchpoint_hit(&record) {
            return StopReason::watchpoint(record.alu_result, write_hit, read_hit);
        }
        if interrupt.load(Ordering::Acquire) {
            return StopReason::signal(SIGINT);
        }
    }
}

/// Steps at most `cycles` cycles, still honoring stop points and the cancel
/// flag.
fn run_steps(
    cycles: u64,
    board: &mut Board,
    stops: &StopPoints<'_>,
    interrupt: &AtomicBool,
) -> StopReason {
    for _ in 0..cycles {
        let record = board.step();

        if stops.breakpoint_hit(board) {
            return StopReason::breakpoint(true);
        }
        if let Some((read_hit, write_hit)) = stops.watchpoint_hit(&record) {
            return StopReason::watchpoint(record.alu_result, write_hit, read_hit);
        }
        if interrupt.load(Ordering::Acquire) {
            return StopReason::signal(SIGINT);
        }
    }
    StopReason::signal(SIGTRAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FillPolicy;

    fn board_with_program(program: &[u32]) -> Board {
        let flash: Vec<u8> = program.iter().flat_map(|inst| inst.to_le_bytes()).collect();
        Board::new(&flash, FillPolicy::Zero).unwrap()
    }

    fn stop_points<'a>(
        breakpoints: &'a BTreeMap<u32, Breakpoint>,
        watchpoints: &'a BTreeMap<AddressRange, Watchpoint>,
    ) -> StopPoints<'a> {
        StopPoints {
            breakpoints,
            watchpoints,
        }
    }

    #[test]
    fn run_until_breakpoint() {
        // Three nops, then loop forever: jal x0, 0
        let mut board =
            board_with_program(&[0x0000_0013, 0x0000_0013, 0x0000_0013, 0x0000_006f]);
        let mut breakpoints = BTreeMap::new();
        breakpoints.insert(
            0x0010_0008,
            Breakpoint {
                address: 0x0010_0008,
                condition: None,
            },
        );
        let watchpoints = BTreeMap::new();
        let interrupt = AtomicBool::new(false);

        let reason = run_until_trap(
            &mut board,
            &stop_points(&breakpoints, &watchpoints),
            &interrupt,
        );
        assert_eq!(StopReason::breakpoint(true), reason);
        assert_eq!(0x0010_0008, board.cpu.pc);
    }

    #[test]
    fn run_until_watchpoint() {
        // addi x2, x0, 0x100 ; lui x2 would be needed for big addresses, so
        // watch a low RAM mirror through the store at 0x8000_0000 instead:
        // lui x2, 0x80000 ; sw x0, 16(x2) ; jal x0, 0
        let mut board = board_with_program(&[0x8000_0137, 0x0001_2823, 0x0000_006f]);
        let breakpoints = BTreeMap::new();
        let mut watchpoints = BTreeMap::new();
        let range = AddressRange {
            start: 0x8000_0010,
            size: 4,
        };
        watchpoints.insert(
            range,
            Watchpoint {
                watch_write: true,
                watch_read: false,
                range,
            },
        );
        let interrupt = AtomicBool::new(false);

        let reason = run_until_trap(
            &mut board,
            &stop_points(&breakpoints, &watchpoints),
            &interrupt,
        );
        assert_eq!(
            StopReason::watchpoint(0x8000_0010, true, false),
            reason
        );
    }

    #[test]
    fn read_only_watchpoint_ignores_stores() {
        let mut board = board_with_program(&[0x8000_0137, 0x0001_2823, 0x0000_006f]);
        let breakpoints = BTreeMap::new();
        let mut watchpoints = BTreeMap::new();
        let range = AddressRange {
            start: 0x8000_0010,
            size: 4,
        };
        watchpoints.insert(
            range,
            Watchpoint {
                watch_write: false,
                watch_read: true,
                range,
            },
        );
        let interrupt = AtomicBool::new(false);

        let reason = run_steps(
            8,
            &mut board,
            &stop_points(&breakpoints, &watchpoints),
            &interrupt,
        );
        assert_eq!(StopReason::signal(SIGTRAP), reason);
    }

    #[test]
    fn run_steps_counts_cycles() {
        let mut board = board_with_program(&[0x0000_0013; 16]);
        let breakpoints = BTreeMap::new();
        let watchpoints = BTreeMap::new();
        let interrupt = AtomicBool::new(false);

        let reason = run_steps(
            5,
            &mut board,
            &stop_points(&breakpoints, &watchpoints),
            &interrupt,
        );
        assert_eq!(StopReason::signal(SIGTRAP), reason);
        assert_eq!(0x0010_0014, board.cpu.pc);
        assert_eq!(5, board.cpu.csr.mcycle);
    }

    #[test]
    fn interrupt_flag_stops_the_run() {
        // jal x0, 0: spins forever without the flag.
        let mut board = board_with_program(&[0x0000_006f]);
        let breakpoints = BTreeMap::new();
        let watchpoints = BTreeMap::new();
        let interrupt = AtomicBool::new(true);

        let reason = run_until_trap(
            &mut board,
            &stop_points(&breakpoints, &watchpoints),
            &interrupt,
        );
        assert_eq!(StopReason::signal(SIGINT), reason);
    }

    #[test]
    fn conditional_breakpoint_gates_the_stop() {
        // addi x1, x1, 1 ; jal x0, -4 -- increments x1 forever.
        let mut board = board_with_program(&[0x0010_8093, 0xffdf_f06f]);
        let mut breakpoints = BTreeMap::new();
        // Condition: reg 1 == 5
        let condition = vec![0x26, 0x00, 0x01, 0x22, 5, 0x13, 0x27];
        breakpoints.insert(
            0x0010_0004,
            Breakpoint {
                address: 0x0010_0004,
                condition: Some(condition),
            },
        );
        let watchpoints = BTreeMap::new();
        let interrupt = AtomicBool::new(false);

        let reason = run_until_trap(
            &mut board,
            &stop_points(&breakpoints, &watchpoints),
            &interrupt,
        );
        assert_eq!(StopReason::breakpoint(true), reason);
        assert_eq!(
            5,
            board
                .cpu
                .registers
                .x(crate::registers::Specifier::new(1).unwrap())
        );
    }
}
