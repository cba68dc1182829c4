//! Access framework: logical read/write/erase over a pluggable driver
//!
//! The framework turns a linear byte offset and a buffer into the chip's
//! shape: one setup plus one address load, then per-page execute/wait/data
//! trios for reads and writes, or per-block execute/wait pairs for erases.
//!
//! The first page of a transfer is special. The chip streams within a
//! page but always starts at a page boundary on a fresh execute, so the
//! first page only has room for `PAGE_SIZE - byte` bytes; every later
//! page contributes a full page or whatever remains.
//!
//! Offsets past the end of the device wrap around; that is defined
//! behavior, not an error. A wait timeout aborts the operation and
//! surfaces to the caller; whatever the chip already did stays done.

use log::debug;
use thiserror::Error;

use crate::driver::{
    AddrCycles, Driver, DriverError, DriverResult, Instr, JumpTable, Operation,
    TIMEOUT_ERASE_BLOCK_US, TIMEOUT_PROGRAM_PAGE_US, TIMEOUT_READ_PAGE_US,
};
use crate::geometry::{wrap, BLOCK_SIZE, PAGE_SIZE};
use crate::registers::{Opcode, REG_ADDRESS, REG_COMMAND};

/// Instructions per page moved: data transfer, execute, wait.
const DATA_XFER_INSTRUCTIONS: usize = 3;
/// Instructions per block erased: execute, wait.
const ERASE_INSTRUCTIONS: usize = 2;

/// Framework-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameworkError {
    #[error(transparent)]
    Driver(#[from] DriverError),
}

pub type FrameworkResult<T> = Result<T, FrameworkError>;

/// Split a linear device offset into chip address cycles.
pub fn decompose_offset(offset: u32) -> (u8, u8, u8) {
    let offset = wrap(offset as usize);
    (
        (offset / BLOCK_SIZE) as u8,
        ((offset % BLOCK_SIZE) / PAGE_SIZE) as u8,
        (offset % PAGE_SIZE) as u8,
    )
}

/// Number of instructions a read or program of `size` bytes starting
/// `byte_addr` into its first page needs: setup, address, and one
/// execute/wait/data trio per page touched, counting any final partial
/// page.
pub fn data_transfer_instruction_count(byte_addr: u8, size: usize) -> usize {
    2 + DATA_XFER_INSTRUCTIONS * (size + byte_addr as usize).div_ceil(PAGE_SIZE)
}

/// Number of instructions an erase of `num_blocks` blocks needs.
pub fn erase_instruction_count(num_blocks: usize) -> usize {
    2 + ERASE_INSTRUCTIONS * num_blocks
}

/// The block range an erase covers: the region rounds down to the start
/// of its first block and up to the next block boundary, because the chip
/// only erases whole blocks.
pub fn erase_block_span(offset: u32, size: u32) -> (u8, usize) {
    let offset = wrap(offset as usize);
    let start_block = (offset / BLOCK_SIZE) as u8;
    let num_blocks = (size as usize + offset % BLOCK_SIZE).div_ceil(BLOCK_SIZE);
    (start_block, num_blocks)
}

/// Byte counts of the per-page chunks of a transfer, first page short.
fn page_spans(byte_addr: u8, len: usize) -> Vec<usize> {
    let mut spans = Vec::new();
    let mut capacity = PAGE_SIZE - byte_addr as usize;
    let mut remaining = len;
    while remaining > 0 {
        let take = capacity.min(remaining);
        spans.push(take);
        remaining -= take;
        capacity = PAGE_SIZE;
    }
    spans
}

/// Build the instruction list for a read into `buffer` at `offset`.
pub fn plan_read(buffer: &mut [u8], offset: u32) -> Operation<'_> {
    let (block, page, byte) = decompose_offset(offset);
    let count = data_transfer_instruction_count(byte, buffer.len());

    let mut operation = Operation::with_capacity(count);
    operation.push(Instr::Cmd(Opcode::ReadSetup));
    operation.push(Instr::Addr(AddrCycles::io(block, page, byte)));

    let spans = page_spans(byte, buffer.len());
    let mut rest = buffer;
    for span in spans {
        let (chunk, tail) = rest.split_at_mut(span);
        operation.push(Instr::Cmd(Opcode::ReadExecute));
        operation.push(Instr::WaitReady(TIMEOUT_READ_PAGE_US));
        operation.push(Instr::DataOut(chunk));
        rest = tail;
    }

    debug_assert_eq!(operation.len(), count);
    operation
}

/// Build the instruction list for a write of `buffer` at `offset`.
pub fn plan_write(buffer: &[u8], offset: u32) -> Operation<'_> {
    let (block, page, byte) = decompose_offset(offset);
    let count = data_transfer_instruction_count(byte, buffer.len());

    let mut operation = Operation::with_capacity(count);
    operation.push(Instr::Cmd(Opcode::ProgramSetup));
    operation.push(Instr::Addr(AddrCycles::io(block, page, byte)));

    let spans = page_spans(byte, buffer.len());
    let mut rest = buffer;
    for span in spans {
        let (chunk, tail) = rest.split_at(span);
        operation.push(Instr::DataIn(chunk));
        operation.push(Instr::Cmd(Opcode::ProgramExecute));
        operation.push(Instr::WaitReady(TIMEOUT_PROGRAM_PAGE_US));
        rest = tail;
    }

    debug_assert_eq!(operation.len(), count);
    operation
}

/// Build the instruction list for an erase of the blocks covering
/// `offset..offset + size`.
pub fn plan_erase(offset: u32, size: u32) -> Operation<'static> {
    let (start_block, num_blocks) = erase_block_span(offset, size);
    let count = erase_instruction_count(num_blocks);

    let mut operation = Operation::with_capacity(count);
    operation.push(Instr::Cmd(Opcode::EraseSetup));
    operation.push(Instr::Addr(AddrCycles::erase(start_block)));
    for _ in 0..num_blocks {
        operation.push(Instr::Cmd(Opcode::EraseExecute));
        operation.push(Instr::WaitReady(TIMEOUT_ERASE_BLOCK_US));
    }

    debug_assert_eq!(operation.len(), count);
    operation
}

fn jt_read(jt: &mut dyn JumpTable, buffer: &mut [u8], offset: u32) -> DriverResult<()> {
    let (block, page, byte) = decompose_offset(offset);

    jt.set_register(REG_COMMAND, Opcode::ReadSetup as u8);
    jt.set_register(REG_ADDRESS, block);
    jt.set_register(REG_ADDRESS, page);
    jt.set_register(REG_ADDRESS, byte);

    let spans = page_spans(byte, buffer.len());
    let mut rest = buffer;
    for span in spans {
        jt.set_register(REG_COMMAND, Opcode::ReadExecute as u8);
        jt.wait_ready(TIMEOUT_READ_PAGE_US)?;
        let (chunk, tail) = rest.split_at_mut(span);
        jt.read_buffer(chunk)?;
        rest = tail;
    }
    Ok(())
}

fn jt_write(jt: &mut dyn JumpTable, buffer: &[u8], offset: u32) -> DriverResult<()> {
    let (block, page, byte) = decompose_offset(offset);

    jt.set_register(REG_COMMAND, Opcode::ProgramSetup as u8);
    jt.set_register(REG_ADDRESS, block);
    jt.set_register(REG_ADDRESS, page);
    jt.set_register(REG_ADDRESS, byte);

    let spans = page_spans(byte, buffer.len());
    let mut rest = buffer;
    for span in spans {
        let (chunk, tail) = rest.split_at(span);
        jt.write_buffer(chunk)?;
        jt.set_register(REG_COMMAND, Opcode::ProgramExecute as u8);
        jt.wait_ready(TIMEOUT_PROGRAM_PAGE_US)?;
        rest = tail;
    }
    Ok(())
}

fn jt_erase(jt: &mut dyn JumpTable, offset: u32, size: u32) -> DriverResult<()> {
    let (start_block, num_blocks) = erase_block_span(offset, size);

    jt.set_register(REG_COMMAND, Opcode::EraseSetup as u8);
    jt.set_register(REG_ADDRESS, start_block);
    for _ in 0..num_blocks {
        jt.set_register(REG_COMMAND, Opcode::EraseExecute as u8);
        jt.wait_ready(TIMEOUT_ERASE_BLOCK_US)?;
    }
    Ok(())
}

/// The user-facing access framework.
pub struct Framework {
    driver: Driver,
}

impl Framework {
    pub fn new(driver: Driver) -> Self {
        Self { driver }
    }

    /// Read `buffer.len()` bytes starting at the linear device `offset`.
    pub fn read(&mut self, buffer: &mut [u8], offset: u32) -> FrameworkResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        debug!("read {} bytes at offset {:#010x}", buffer.len(), offset);
        match &mut self.driver {
            Driver::JumpTable(jt) => jt_read(jt.as_mut(), buffer, offset)?,
            Driver::ExecOp(driver) => {
                let mut operation = plan_read(buffer, offset);
                driver.exec_op(&mut operation)?;
            }
        }
        Ok(())
    }

    /// Write `buffer` to the device starting at the linear `offset`.
    pub fn write(&mut self, buffer: &[u8], offset: u32) -> FrameworkResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        debug!("write {} bytes at offset {:#010x}", buffer.len(), offset);
        match &mut self.driver {
            Driver::JumpTable(jt) => jt_write(jt.as_mut(), buffer, offset)?,
            Driver::ExecOp(driver) => {
                let mut operation = plan_write(buffer, offset);
                driver.exec_op(&mut operation)?;
            }
        }
        Ok(())
    }

    /// Erase every block intersecting `offset..offset + size`.
    pub fn erase(&mut self, offset: u32, size: u32) -> FrameworkResult<()> {
        if size == 0 {
            return Ok(());
        }
        debug!("erase {} bytes at offset {:#010x}", size, offset);
        match &mut self.driver {
            Driver::JumpTable(jt) => jt_erase(jt.as_mut(), offset, size)?,
            Driver::ExecOp(driver) => {
                let mut operation = plan_erase(offset, size);
                driver.exec_op(&mut operation)?;
            }
        }
        Ok(())
    }
}
