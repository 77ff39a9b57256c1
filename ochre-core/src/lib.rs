//! Core of the ochre emulator: a single-hart RV32IM_Zicond machine with a
//! memory-mapped platform and an integrated GDB remote stub.
//!
//! The crate splits into four layers:
//!
//! - [`word`] and [`registers`]: the bit-vector utility and the register
//!   file underlying the datapath.
//! - [`core`]: the hart itself (decode, ALU, CSRs, fetch cache, load/store
//!   unit, and the step sequencer with precise M-mode trap delivery).
//! - [`bus`], [`device`], and [`board`]: the memory interface, the devices
//!   (paged block memory, UART, machine timer), and the platform wiring
//!   them at fixed addresses.
//! - [`gdb`]: the remote-serial-protocol stub, from packet framing up to
//!   the session controller with its run/interrupt concurrency.
//!
//! A front-end builds a [`board::Board`] from a flash image and either steps
//! it directly or hands it to a [`gdb::DebugSession`].

#[macro_use]
extern crate static_assertions;

pub mod board;
pub mod bus;
pub mod core;
pub mod device;
pub mod gdb;
pub mod registers;
pub mod word;

pub use board::Board;
pub use bus::{Bus, BusError};
pub use word::Word;
