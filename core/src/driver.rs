//! Driver surfaces
//!
//! A driver exposes the chip to the framework in one of two styles: a
//! jump table of four register-level operations, or a single `exec_op`
//! entry point that interprets an ordered instruction list. The framework
//! dispatches on the tag and never touches the device directly.
//!
//! Both reference drivers here are bound to the in-process emulator.
//! `wait_ready` polls the status pin with a short sleep between polls, so
//! nearly all of the wait interval is spent sleeping rather than burning
//! the CPU.

use std::thread;
use std::time::Duration;

use log::trace;
use thiserror::Error;

use crate::clock;
use crate::device::DeviceHandle;
use crate::dib::{verify_dib, Dib, DibError, NandDevice};
use crate::geometry::ChipGeometry;
use crate::registers::{LineLevel, Opcode, Pin, REG_ADDRESS, REG_COMMAND, REG_DATA};

/// Driver-side timeouts, 10% longer than the device's busy durations to
/// absorb polling granularity and scheduling jitter.
pub const TIMEOUT_READ_PAGE_US: u64 = 110;
pub const TIMEOUT_PROGRAM_PAGE_US: u64 = 660;
pub const TIMEOUT_ERASE_BLOCK_US: u64 = 2200;
pub const TIMEOUT_RESET_US: u64 = 550;

/// Sleep between status polls while waiting for ready.
pub const POLL_INTERVAL_US: u64 = 25;

/// Make/model string the exec-op reference driver registers in the DIB.
pub const EMULATED_MAKEMODEL: &str = "nandemu 16MiB emulated NAND";

/// Driver-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("device stayed busy past the {timeout_us}us timeout")]
    Timeout { timeout_us: u64 },
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Address cycles for an ADDR instruction: three bytes (block, page,
/// byte) for I/O operations, one byte (block) for erases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrCycles {
    bytes: [u8; 3],
    len: u8,
}

impl AddrCycles {
    /// The block/page/byte triple a read or program operation loads.
    pub fn io(block: u8, page: u8, byte: u8) -> Self {
        Self {
            bytes: [block, page, byte],
            len: 3,
        }
    }

    /// The single block address an erase loads.
    pub fn erase(block: u8) -> Self {
        Self {
            bytes: [block, 0, 0],
            len: 1,
        }
    }

    /// The address bytes, in the order they are written to the address
    /// register.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// One typed instruction in an exec-op operation.
#[derive(Debug)]
pub enum Instr<'a> {
    /// Write an opcode into the command register.
    Cmd(Opcode),
    /// Write successive bytes into the address register.
    Addr(AddrCycles),
    /// Write the buffer into the data register, byte by byte.
    DataIn(&'a [u8]),
    /// Read from the data register into the buffer, byte by byte.
    DataOut(&'a mut [u8]),
    /// Poll the status pin until ready or the timeout elapses.
    WaitReady(u64),
}

/// An ordered instruction list, executed as a unit by an exec-op driver.
#[derive(Debug, Default)]
pub struct Operation<'a> {
    pub instrs: Vec<Instr<'a>>,
}

impl<'a> Operation<'a> {
    pub fn with_capacity(ninstrs: usize) -> Self {
        Self {
            instrs: Vec::with_capacity(ninstrs),
        }
    }

    pub fn push(&mut self, instr: Instr<'a>) {
        self.instrs.push(instr);
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }
}

/// The jump-table driver surface: four register-level operations.
pub trait JumpTable {
    fn set_register(&mut self, offset: u8, value: u8);
    fn read_buffer(&mut self, buffer: &mut [u8]) -> DriverResult<()>;
    fn write_buffer(&mut self, buffer: &[u8]) -> DriverResult<()>;
    fn wait_ready(&mut self, timeout_us: u64) -> DriverResult<()>;
}

/// The exec-op driver surface: a single instruction interpreter.
pub trait ExecOp {
    fn exec_op(&mut self, operation: &mut Operation<'_>) -> DriverResult<()>;
}

/// A driver is one of the two surfaces.
pub enum Driver {
    JumpTable(Box<dyn JumpTable>),
    ExecOp(Box<dyn ExecOp>),
}

/// Poll the status pin until the device reports ready.
///
/// Returns as soon as ready is observed, sleeping [`POLL_INTERVAL_US`]
/// between polls so the wait costs almost no CPU. After the timeout
/// elapses the pin gets one final look before the wait is declared a
/// failure.
pub fn wait_for_ready(device: &DeviceHandle, timeout_us: u64) -> DriverResult<()> {
    let timeout = clock::now_us() + timeout_us;

    loop {
        if device.borrow().pin_get(Pin::Status) == LineLevel::Ready {
            return Ok(());
        }
        thread::sleep(Duration::from_micros(POLL_INTERVAL_US));
        if clock::now_us() >= timeout {
            break;
        }
    }

    if device.borrow().pin_get(Pin::Status) == LineLevel::Ready {
        Ok(())
    } else {
        Err(DriverError::Timeout { timeout_us })
    }
}

/// Jump-table reference driver over the emulated device.
pub struct EmuJumpTableDriver {
    device: DeviceHandle,
}

impl EmuJumpTableDriver {
    /// Bind to the device. This driver leaves the DIB untouched.
    pub fn new(device: DeviceHandle) -> Self {
        Self { device }
    }

    pub fn into_driver(self) -> Driver {
        Driver::JumpTable(Box::new(self))
    }
}

impl JumpTable for EmuJumpTableDriver {
    fn set_register(&mut self, offset: u8, value: u8) {
        self.device.borrow_mut().write_register(offset, value);
    }

    fn read_buffer(&mut self, buffer: &mut [u8]) -> DriverResult<()> {
        for slot in buffer.iter_mut() {
            *slot = self.device.borrow_mut().read_register(REG_DATA);
        }
        Ok(())
    }

    fn write_buffer(&mut self, buffer: &[u8]) -> DriverResult<()> {
        for &byte in buffer {
            self.device.borrow_mut().write_register(REG_DATA, byte);
        }
        Ok(())
    }

    fn wait_ready(&mut self, timeout_us: u64) -> DriverResult<()> {
        wait_for_ready(&self.device, timeout_us)
    }
}

/// Exec-op reference driver over the emulated device.
pub struct EmuExecOpDriver {
    device: DeviceHandle,
}

impl EmuExecOpDriver {
    /// Bind to the device and register it in the DIB.
    ///
    /// Refuses to touch a malformed DIB; on success the returned DIB has
    /// this driver's device as its first entry.
    pub fn new(device: DeviceHandle, mut old_dib: Dib) -> Result<(Self, Dib), DibError> {
        verify_dib(&old_dib)?;
        old_dib.push_front(NandDevice::single_chip(
            EMULATED_MAKEMODEL,
            ChipGeometry::device(),
        ));
        Ok((Self { device }, old_dib))
    }

    pub fn into_driver(self) -> Driver {
        Driver::ExecOp(Box::new(self))
    }
}

impl ExecOp for EmuExecOpDriver {
    fn exec_op(&mut self, operation: &mut Operation<'_>) -> DriverResult<()> {
        for instr in operation.instrs.iter_mut() {
            match instr {
                Instr::Cmd(opcode) => {
                    trace!("exec_op CMD {:?}", opcode);
                    self.device
                        .borrow_mut()
                        .write_register(REG_COMMAND, *opcode as u8);
                }
                Instr::Addr(cycles) => {
                    trace!("exec_op ADDR {:?}", cycles.bytes());
                    for &byte in cycles.bytes() {
                        self.device.borrow_mut().write_register(REG_ADDRESS, byte);
                    }
                }
                Instr::DataIn(buffer) => {
                    trace!("exec_op DATA_IN {} bytes", buffer.len());
                    for &byte in buffer.iter() {
                        self.device.borrow_mut().write_register(REG_DATA, byte);
                    }
                }
                Instr::DataOut(buffer) => {
                    trace!("exec_op DATA_OUT {} bytes", buffer.len());
                    for slot in buffer.iter_mut() {
                        *slot = self.device.borrow_mut().read_register(REG_DATA);
                    }
                }
                Instr::WaitReady(timeout_us) => {
                    trace!("exec_op WAITRDY {}us", timeout_us);
                    wait_for_ready(&self.device, *timeout_us)?;
                }
            }
        }
        Ok(())
    }
}
