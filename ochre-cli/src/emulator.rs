//! The non-debug run loop.

use ochre_core::core::Trap;
use ochre_core::Board;

/// Which traps end the run with a report.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrapCapture {
    /// Never stop on traps.
    NoCapture,
    /// Stop on interrupt-class traps other than an environment call.
    ExceptionOnly,
    /// Stop on any trap.
    All,
}

/// Runs the machine until a capture condition fires.
pub struct Emulator {
    board: Board,
    trap_capture: TrapCapture,
    stop_at_infinite_loop: bool,
    cycles_executed: u64,
}

impl Emulator {
    pub fn new(board: Board, trap_capture: TrapCapture, stop_at_infinite_loop: bool) -> Self {
        Self {
            board,
            trap_capture,
            stop_at_infinite_loop,
            cycles_executed: 0,
        }
    }

    pub fn run(&mut self) {
        loop {
            let record = self.board.step();
            self.cycles_executed += 1;

            match self.trap_capture {
                TrapCapture::NoCapture => {}
                TrapCapture::ExceptionOnly => {
                    if let Some(trap) = record.trap {
                        if trap.is_interrupt() && trap != Trap::EnvCallFromMMode {
                            log::info!(
                                "exception detected at pc {:#010x} (inst {:#010x}), trap code {}",
                                record.pc,
                                record.inst,
                                trap.exception_code(),
                            );
                            break;
                        }
                    }
                }
                TrapCapture::All => {
                    if let Some(trap) = record.trap {
                        log::info!(
                            "{} captured at pc {:#010x} (inst {:#010x}), trap code {}",
                            if trap.is_interrupt() {
                                "interrupt"
                            } else {
                                "exception"
                            },
                            record.pc,
                            record.inst,
                            trap.exception_code(),
                        );
                        break;
                    }
                }
            }

            if self.stop_at_infinite_loop
                && record.trap.is_none()
                && record.branch_taken
                && record.pc == record.alu_result
            {
                log::info!("infinite loop detected at pc {:#010x}", record.pc);
                break;
            }
        }
        log::info!("executed {} cycles", self.cycles_executed);
    }
}
