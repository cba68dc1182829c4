//! Command parser state machine
//!
//! Every host access to the register word lands here. The parser walks a
//! command through its lifecycle: a setup opcode, the address cycles that
//! load the cursor one field at a time, an execute, and, for reads and
//! programs, a streaming phase in which each data-register access moves
//! one byte through the cache.
//!
//! Two rules cut across every state. A setup opcode is always accepted,
//! even mid-operation or while the device is busy: it clears the cursor,
//! deadline, and cache and restarts the matching lifecycle. Any other
//! command that arrives while the busy deadline is armed is a protocol
//! violation and drives the machine into the terminal `Bug` state.

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deadline::{
    Deadline, ERASE_BLOCK_DURATION_US, PROGRAM_PAGE_DURATION_US, READ_PAGE_DURATION_US,
};
use crate::registers::{Opcode, RegisterWord};
use crate::store::Store;

/// Parser machine states. `Idle` is initial; `Bug` is terminal and fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    ReadAwaitBlock,
    ReadAwaitPage,
    ReadAwaitByte,
    ReadAwaitExec,
    ReadProvidingData,
    ProgramAwaitBlock,
    ProgramAwaitPage,
    ProgramAwaitByte,
    ProgramAcceptingData,
    EraseAwaitBlock,
    EraseAwaitExec,
    Bug,
}

/// A command the state machine cannot accept. Raising one of these models
/// a breach of the hardware contract; there is no recovery path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("machine state bug: command {command:#04x} in state {state:?}")]
pub struct ProtocolFault {
    pub state: MachineState,
    pub command: u8,
}

pub struct Parser {
    state: MachineState,
    store: Store,
    deadline: Deadline,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// A parser over blank storage, ready for its first command.
    pub fn new() -> Self {
        Self {
            state: MachineState::Idle,
            store: Store::new(),
            deadline: Deadline::new(),
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// True while the armed operation deadline has not yet elapsed.
    pub fn busy(&self) -> bool {
        self.deadline.busy()
    }

    /// Arm the busy deadline directly, without running a command. Timing
    /// tests and the wait-check tooling use this to present a device that
    /// stays busy for as long as they need.
    pub fn hold_busy(&mut self, duration_us: u64) {
        self.deadline.set(duration_us);
    }

    /// Clear cursor, deadline, and cache but keep the machine state.
    fn clear_state(&mut self) {
        self.deadline.clear();
        self.store.clear_cursor();
        self.store.clear_cache();
    }

    /// Full reset: clear internal state and return to `Idle`. This is the
    /// reset-pin entry point.
    pub fn reset(&mut self) {
        self.clear_state();
        self.state = MachineState::Idle;
    }

    /// Restart into the lifecycle selected by a setup opcode.
    fn restart(&mut self, setup: Opcode) {
        self.clear_state();
        self.state = match setup {
            Opcode::ReadSetup => MachineState::ReadAwaitBlock,
            Opcode::ProgramSetup => MachineState::ProgramAwaitBlock,
            Opcode::EraseSetup => MachineState::EraseAwaitBlock,
            _ => unreachable!("restart is only reached for setup opcodes"),
        };
    }

    fn bug(&mut self, command: u8) -> Result<Option<RegisterWord>, ProtocolFault> {
        let fault = ProtocolFault {
            state: self.state,
            command,
        };
        self.state = MachineState::Bug;
        Err(fault)
    }

    /// Process one host access to the register word.
    ///
    /// Returns `Ok(Some(word))` when the device rewrites the register --
    /// either the bare dummy command acknowledging an execute, or a dummy
    /// word carrying the next cache byte for a streaming read. The caller
    /// must make that word visible to the host before the host's access
    /// completes.
    pub fn handle(&mut self, word: RegisterWord) -> Result<Option<RegisterWord>, ProtocolFault> {
        let raw = word.command_bits();
        let command = word.command();

        trace!(
            "parser in state {:?} received C={:#04x} A={:#04x} D={:#04x}",
            self.state,
            raw,
            word.address(),
            word.data()
        );

        if self.state == MachineState::Bug {
            return self.bug(raw);
        }

        // Commands during a busy interval: setups restart, everything
        // else breaches the contract.
        if self.deadline.busy() {
            return match command {
                Some(setup) if setup.is_setup() => {
                    debug!("setup {:?} restarts the busy device", setup);
                    self.restart(setup);
                    Ok(None)
                }
                _ => self.bug(raw),
            };
        }

        match self.state {
            MachineState::Idle => match command {
                Some(setup) if setup.is_setup() => {
                    self.restart(setup);
                    Ok(None)
                }
                _ => self.bug(raw),
            },

            MachineState::ReadAwaitBlock => match command {
                Some(Opcode::ReadSetup) => {
                    self.store.cursor_mut().set_block(word.address());
                    self.state = MachineState::ReadAwaitPage;
                    Ok(None)
                }
                _ => self.bug(raw),
            },
            MachineState::ReadAwaitPage => match command {
                Some(Opcode::ReadSetup) => {
                    self.store.cursor_mut().set_page(word.address());
                    self.state = MachineState::ReadAwaitByte;
                    Ok(None)
                }
                _ => self.bug(raw),
            },
            MachineState::ReadAwaitByte => match command {
                Some(Opcode::ReadSetup) => {
                    self.store.cursor_mut().set_byte(word.address());
                    self.state = MachineState::ReadAwaitExec;
                    Ok(None)
                }
                _ => self.bug(raw),
            },
            MachineState::ReadAwaitExec => match command {
                Some(Opcode::ReadExecute) => {
                    self.deadline.set(READ_PAGE_DURATION_US);
                    self.store.copy_page_to_cache();
                    self.state = MachineState::ReadProvidingData;
                    Ok(Some(RegisterWord::dummy()))
                }
                _ => self.bug(raw),
            },
            MachineState::ReadProvidingData => match command {
                Some(Opcode::Dummy) => {
                    // The host is reading the data register: hand back the
                    // next cache byte and move on.
                    let byte = self.store.cache_byte();
                    self.store.cursor_mut().advance_byte(false);
                    Ok(Some(RegisterWord::dummy_with_data(byte)))
                }
                Some(Opcode::ReadExecute) => {
                    // Re-execute after a page's worth of streaming: load
                    // the page the cursor has advanced into.
                    self.deadline.set(READ_PAGE_DURATION_US);
                    self.store.copy_page_to_cache();
                    Ok(Some(RegisterWord::dummy()))
                }
                Some(setup) if setup.is_setup() => {
                    self.restart(setup);
                    Ok(None)
                }
                _ => self.bug(raw),
            },

            MachineState::ProgramAwaitBlock => match command {
                Some(Opcode::ProgramSetup) => {
                    self.store.cursor_mut().set_block(word.address());
                    self.state = MachineState::ProgramAwaitPage;
                    Ok(None)
                }
                _ => self.bug(raw),
            },
            MachineState::ProgramAwaitPage => match command {
                Some(Opcode::ProgramSetup) => {
                    self.store.cursor_mut().set_page(word.address());
                    self.state = MachineState::ProgramAwaitByte;
                    Ok(None)
                }
                _ => self.bug(raw),
            },
            MachineState::ProgramAwaitByte => match command {
                Some(Opcode::ProgramSetup) => {
                    self.store.cursor_mut().set_byte(word.address());
                    self.state = MachineState::ProgramAcceptingData;
                    // Signal the host to begin streaming data bytes.
                    Ok(Some(RegisterWord::dummy()))
                }
                _ => self.bug(raw),
            },
            MachineState::ProgramAcceptingData => match command {
                Some(Opcode::Dummy) => {
                    self.store.set_cache_byte(word.data());
                    self.store.cursor_mut().advance_byte(true);
                    Ok(None)
                }
                Some(Opcode::ProgramExecute) => {
                    self.deadline.set(PROGRAM_PAGE_DURATION_US);
                    self.store.copy_page_from_cache();
                    self.store.clear_cache();
                    self.store.cursor_mut().advance_page();
                    Ok(Some(RegisterWord::dummy()))
                }
                Some(setup) if setup.is_setup() => {
                    self.restart(setup);
                    Ok(None)
                }
                _ => self.bug(raw),
            },

            MachineState::EraseAwaitBlock => match command {
                Some(Opcode::EraseSetup) => {
                    self.store.cursor_mut().set_block(word.address());
                    self.state = MachineState::EraseAwaitExec;
                    Ok(None)
                }
                _ => self.bug(raw),
            },
            MachineState::EraseAwaitExec => match command {
                Some(Opcode::EraseExecute) => {
                    self.deadline.set(ERASE_BLOCK_DURATION_US);
                    self.store.erase_block();
                    self.store.cursor_mut().advance_block();
                    Ok(Some(RegisterWord::dummy()))
                }
                Some(setup) if setup.is_setup() => {
                    self.restart(setup);
                    Ok(None)
                }
                _ => self.bug(raw),
            },

            MachineState::Bug => self.bug(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BLOCK_SIZE, PAGE_SIZE};
    use crate::registers::{REG_ADDRESS, REG_COMMAND, REG_DATA};
    use std::thread;
    use std::time::Duration;

    /// Drive one register-byte write through the parser, mirroring what
    /// the device facade does with the shared register word.
    fn poke(parser: &mut Parser, word: &mut RegisterWord, offset: u8, value: u8) {
        word.set_byte(offset, value);
        if let Some(rewrite) = parser.handle(*word).expect("unexpected bug state") {
            *word = rewrite;
        }
    }

    fn read_data(parser: &mut Parser, word: &mut RegisterWord) -> u8 {
        if let Some(rewrite) = parser.handle(*word).expect("unexpected bug state") {
            *word = rewrite;
        }
        word.data()
    }

    fn settle(parser: &Parser) {
        while parser.busy() {
            thread::sleep(Duration::from_micros(25));
        }
    }

    fn program_page(parser: &mut Parser, word: &mut RegisterWord, addr: [u8; 3], data: &[u8]) {
        poke(parser, word, REG_COMMAND, Opcode::ProgramSetup as u8);
        for byte in addr {
            poke(parser, word, REG_ADDRESS, byte);
        }
        for &byte in data {
            poke(parser, word, REG_DATA, byte);
        }
        poke(parser, word, REG_COMMAND, Opcode::ProgramExecute as u8);
        settle(parser);
    }

    #[test]
    fn test_read_lifecycle_state_walk() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();

        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ReadSetup as u8);
        assert_eq!(parser.state(), MachineState::ReadAwaitBlock);
        poke(&mut parser, &mut word, REG_ADDRESS, 1);
        assert_eq!(parser.state(), MachineState::ReadAwaitPage);
        poke(&mut parser, &mut word, REG_ADDRESS, 2);
        assert_eq!(parser.state(), MachineState::ReadAwaitByte);
        poke(&mut parser, &mut word, REG_ADDRESS, 3);
        assert_eq!(parser.state(), MachineState::ReadAwaitExec);
        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ReadExecute as u8);
        assert_eq!(parser.state(), MachineState::ReadProvidingData);
        assert_eq!(word.command(), Some(Opcode::Dummy));
        settle(&parser);
    }

    #[test]
    fn test_program_then_read_roundtrip() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();
        let data: Vec<u8> = (0..PAGE_SIZE).map(|i| i as u8).collect();

        program_page(&mut parser, &mut word, [0, 0, 0], &data);

        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ReadSetup as u8);
        for byte in [0, 0, 0] {
            poke(&mut parser, &mut word, REG_ADDRESS, byte);
        }
        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ReadExecute as u8);
        settle(&parser);
        for i in 0..PAGE_SIZE {
            assert_eq!(read_data(&mut parser, &mut word), i as u8);
        }
    }

    #[test]
    fn test_streamed_write_wraps_within_page() {
        // Stream a page and a half of data before executing: the cursor
        // wraps inside the page and the later bytes win.
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();

        let mut data = vec![0xAA; PAGE_SIZE / 2];
        data.extend(std::iter::repeat(0xBB).take(PAGE_SIZE));
        program_page(&mut parser, &mut word, [0, 0, 0], &data);

        let page = &parser.store().data()[..PAGE_SIZE];
        assert!(page.iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn test_program_execute_advances_to_next_page() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();

        program_page(&mut parser, &mut word, [0, 0, 0], &vec![0xAA; PAGE_SIZE]);
        // No new setup: the cursor has advanced to page 1.
        for _ in 0..PAGE_SIZE {
            poke(&mut parser, &mut word, REG_DATA, 0xBB);
        }
        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ProgramExecute as u8);
        settle(&parser);

        let data = parser.store().data();
        assert!(data[..PAGE_SIZE].iter().all(|&b| b == 0xAA));
        assert!(data[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn test_sub_page_program_zeroes_rest_of_page() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();

        program_page(&mut parser, &mut word, [0, 0, 10], &vec![0xFF; 10]);

        let page = &parser.store().data()[..PAGE_SIZE];
        assert!(page[..10].iter().all(|&b| b == 0));
        assert!(page[10..20].iter().all(|&b| b == 0xFF));
        assert!(page[20..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_erase_wraps_from_last_block_to_first() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();

        program_page(&mut parser, &mut word, [255, 0, 0], &vec![0x11; PAGE_SIZE]);
        program_page(&mut parser, &mut word, [0, 0, 0], &vec![0x22; PAGE_SIZE]);

        poke(&mut parser, &mut word, REG_COMMAND, Opcode::EraseSetup as u8);
        poke(&mut parser, &mut word, REG_ADDRESS, 255);
        poke(&mut parser, &mut word, REG_COMMAND, Opcode::EraseExecute as u8);
        settle(&parser);
        assert_eq!(parser.state(), MachineState::EraseAwaitExec);
        poke(&mut parser, &mut word, REG_COMMAND, Opcode::EraseExecute as u8);
        settle(&parser);

        let data = parser.store().data();
        assert!(data[255 * BLOCK_SIZE..].iter().all(|&b| b == 0));
        assert!(data[..BLOCK_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_multi_page_streaming_read() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();

        program_page(&mut parser, &mut word, [0, 0, 0], &vec![0xA1; PAGE_SIZE]);
        program_page(&mut parser, &mut word, [0, 1, 0], &vec![0xB2; PAGE_SIZE]);

        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ReadSetup as u8);
        for byte in [0, 0, 0] {
            poke(&mut parser, &mut word, REG_ADDRESS, byte);
        }
        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ReadExecute as u8);
        settle(&parser);
        for _ in 0..PAGE_SIZE {
            assert_eq!(read_data(&mut parser, &mut word), 0xA1);
        }
        // Second execute without a new setup streams the next page.
        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ReadExecute as u8);
        settle(&parser);
        for _ in 0..PAGE_SIZE {
            assert_eq!(read_data(&mut parser, &mut word), 0xB2);
        }
    }

    #[test]
    fn test_unknown_command_in_idle_is_a_bug() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();
        word.set_byte(REG_COMMAND, Opcode::ReadExecute as u8);
        assert!(parser.handle(word).is_err());
        assert_eq!(parser.state(), MachineState::Bug);
    }

    #[test]
    fn test_non_setup_while_busy_is_a_bug() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();

        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ProgramSetup as u8);
        for byte in [0, 0, 0] {
            poke(&mut parser, &mut word, REG_ADDRESS, byte);
        }
        poke(&mut parser, &mut word, REG_DATA, 0x7E);
        word.set_byte(REG_COMMAND, Opcode::ProgramExecute as u8);
        parser.handle(word).unwrap();
        assert!(parser.busy());

        // Read-execute with the program deadline still armed.
        word.set_byte(REG_COMMAND, Opcode::ReadExecute as u8);
        assert!(parser.handle(word).is_err());
        assert_eq!(parser.state(), MachineState::Bug);
    }

    #[test]
    fn test_setup_while_busy_restarts() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();

        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ProgramSetup as u8);
        for byte in [0, 0, 0] {
            poke(&mut parser, &mut word, REG_ADDRESS, byte);
        }
        poke(&mut parser, &mut word, REG_DATA, 0x7E);
        word.set_byte(REG_COMMAND, Opcode::ProgramExecute as u8);
        parser.handle(word).unwrap();
        assert!(parser.busy());

        word.set_byte(REG_COMMAND, Opcode::ReadSetup as u8);
        parser.handle(word).unwrap();
        assert_eq!(parser.state(), MachineState::ReadAwaitBlock);
        assert!(!parser.busy());
    }

    #[test]
    fn test_setup_mid_erase_clears_and_retransitions() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();

        poke(&mut parser, &mut word, REG_COMMAND, Opcode::EraseSetup as u8);
        poke(&mut parser, &mut word, REG_ADDRESS, 9);
        assert_eq!(parser.state(), MachineState::EraseAwaitExec);

        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ProgramSetup as u8);
        assert_eq!(parser.state(), MachineState::ProgramAwaitBlock);
        assert_eq!(parser.store().cursor().offset(), 0);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();
        poke(&mut parser, &mut word, REG_COMMAND, Opcode::ReadSetup as u8);
        poke(&mut parser, &mut word, REG_ADDRESS, 5);
        parser.reset();
        assert_eq!(parser.state(), MachineState::Idle);
        assert_eq!(parser.store().cursor().offset(), 0);
        assert!(!parser.busy());
    }

    #[test]
    fn test_bug_state_is_terminal() {
        let mut parser = Parser::new();
        let mut word = RegisterWord::new();
        word.set_byte(REG_COMMAND, Opcode::Dummy as u8);
        assert!(parser.handle(word).is_err());
        // Even a setup cannot leave the bug state.
        word.set_byte(REG_COMMAND, Opcode::ReadSetup as u8);
        assert!(parser.handle(word).is_err());
        assert_eq!(parser.state(), MachineState::Bug);
    }
}
