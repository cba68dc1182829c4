//! Device emulator facade
//!
//! Binds the parser, storage, and deadline behind the two interfaces a
//! host sees: the register word and the pins. Host and emulator run as
//! in-process components; each register access is a direct function call
//! that the emulator processes to completion before returning, so the
//! register-read side effect is simply the return value of
//! [`Device::read_register`].

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use log::debug;

use crate::deadline::RESET_DURATION_US;
use crate::parser::{MachineState, Parser};
use crate::registers::{LineLevel, Pin, RegisterWord};

/// What to do when the parser enters the terminal `Bug` state.
///
/// A protocol violation models a breach of the hardware contract, so the
/// default is to die loudly. Tests that assert on violations use `Latch`,
/// which freezes the machine in `Bug` and ignores further accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BugPolicy {
    #[default]
    Fatal,
    Latch,
}

/// Shared handle to an emulated device. The host side is single-threaded
/// and cooperative, so a plain `Rc<RefCell<_>>` carries the device between
/// the driver, the pins, and test code.
pub type DeviceHandle = Rc<RefCell<Device>>;

pub struct Device {
    parser: Parser,
    reg: RegisterWord,
    bug_policy: BugPolicy,
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    /// A blank device with fatal bug handling.
    pub fn new() -> Self {
        Self::with_bug_policy(BugPolicy::Fatal)
    }

    pub fn with_bug_policy(bug_policy: BugPolicy) -> Self {
        Self {
            parser: Parser::new(),
            reg: RegisterWord::new(),
            bug_policy,
        }
    }

    pub fn new_shared() -> DeviceHandle {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn shared_with_bug_policy(bug_policy: BugPolicy) -> DeviceHandle {
        Rc::new(RefCell::new(Self::with_bug_policy(bug_policy)))
    }

    pub fn machine_state(&self) -> MachineState {
        self.parser.state()
    }

    /// Raw storage contents, for test oracles and tooling.
    pub fn storage(&self) -> &[u8] {
        self.parser.store().data()
    }

    /// Keep the device busy for `duration_us` without running a command.
    /// Timing tests and the wait-check tooling rely on this.
    pub fn hold_busy(&mut self, duration_us: u64) {
        self.parser.hold_busy(duration_us);
    }

    /// Host write of one register byte. The emulator parses the updated
    /// word before control returns to the host.
    pub fn write_register(&mut self, offset: u8, value: u8) {
        self.reg.set_byte(offset, value);
        self.step();
    }

    /// Host read of one register byte.
    ///
    /// The access itself is an event: during a streaming read the parser
    /// synthesizes the next cache byte into the word before the requested
    /// byte is returned, so the value the host observes is the one the
    /// device intended it to see.
    pub fn read_register(&mut self, offset: u8) -> u8 {
        self.step();
        self.reg.byte(offset)
    }

    fn step(&mut self) {
        match self.parser.handle(self.reg) {
            Ok(Some(rewrite)) => self.reg = rewrite,
            Ok(None) => {}
            Err(fault) => match self.bug_policy {
                BugPolicy::Fatal => panic!("device emulator: {fault}"),
                BugPolicy::Latch => debug!("latched protocol fault: {fault}"),
            },
        }
    }

    /// Read a pin. `Status` reports busy while an operation deadline is
    /// armed; `Reset` always reads as ready (low), for symmetry.
    pub fn pin_get(&self, pin: Pin) -> LineLevel {
        match pin {
            Pin::Status => {
                if self.parser.busy() {
                    LineLevel::Busy
                } else {
                    LineLevel::Ready
                }
            }
            Pin::Reset => LineLevel::Ready,
        }
    }

    /// Write a pin. Writing `Status` is a no-op. A nonzero write to
    /// `Reset` clears the full parser state, returns the machine to idle,
    /// and blocks for the reset duration before the host regains control.
    pub fn pin_set(&mut self, pin: Pin, value: u8) {
        match pin {
            Pin::Status => {}
            Pin::Reset => {
                if value != 0 {
                    debug!("reset pin pulsed");
                    self.parser.reset();
                    thread::sleep(Duration::from_micros(RESET_DURATION_US));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PAGE_SIZE;
    use crate::registers::{Opcode, REG_ADDRESS, REG_COMMAND, REG_DATA};
    use std::thread;
    use std::time::Duration;

    fn settle(device: &Device) {
        while device.pin_get(Pin::Status) == LineLevel::Busy {
            thread::sleep(Duration::from_micros(25));
        }
    }

    fn program(device: &mut Device, addr: [u8; 3], data: &[u8]) {
        device.write_register(REG_COMMAND, Opcode::ProgramSetup as u8);
        for byte in addr {
            device.write_register(REG_ADDRESS, byte);
        }
        for &byte in data {
            device.write_register(REG_DATA, byte);
        }
        device.write_register(REG_COMMAND, Opcode::ProgramExecute as u8);
        settle(device);
    }

    #[test]
    fn test_status_pin_tracks_deadline() {
        let mut device = Device::new();
        assert_eq!(device.pin_get(Pin::Status), LineLevel::Ready);
        program(&mut device, [0, 0, 0], &[0x42]);
        assert_eq!(device.pin_get(Pin::Status), LineLevel::Ready);

        device.write_register(REG_COMMAND, Opcode::EraseSetup as u8);
        device.write_register(REG_ADDRESS, 0);
        device.write_register(REG_COMMAND, Opcode::EraseExecute as u8);
        assert_eq!(device.pin_get(Pin::Status), LineLevel::Busy);
        settle(&device);
        assert_eq!(device.pin_get(Pin::Status), LineLevel::Ready);
    }

    #[test]
    fn test_register_read_synthesizes_cache_bytes() {
        let mut device = Device::new();
        let data: Vec<u8> = (0..PAGE_SIZE).map(|i| (i as u8) ^ 0x5A).collect();
        program(&mut device, [0, 3, 0], &data);

        device.write_register(REG_COMMAND, Opcode::ReadSetup as u8);
        for byte in [0, 3, 0] {
            device.write_register(REG_ADDRESS, byte);
        }
        device.write_register(REG_COMMAND, Opcode::ReadExecute as u8);
        settle(&device);
        for i in 0..PAGE_SIZE {
            assert_eq!(device.read_register(REG_DATA), (i as u8) ^ 0x5A);
        }
    }

    #[test]
    fn test_reset_pin_returns_device_to_idle() {
        let mut device = Device::new();
        device.write_register(REG_COMMAND, Opcode::ReadSetup as u8);
        device.write_register(REG_ADDRESS, 7);
        assert_eq!(device.machine_state(), MachineState::ReadAwaitPage);

        device.pin_set(Pin::Reset, 1);
        assert_eq!(device.machine_state(), MachineState::Idle);
        assert_eq!(device.pin_get(Pin::Status), LineLevel::Ready);
    }

    #[test]
    fn test_reset_pin_write_of_zero_is_ignored() {
        let mut device = Device::new();
        device.write_register(REG_COMMAND, Opcode::ReadSetup as u8);
        device.pin_set(Pin::Reset, 0);
        assert_eq!(device.machine_state(), MachineState::ReadAwaitBlock);
    }

    #[test]
    fn test_reset_pin_reads_low() {
        let device = Device::new();
        assert_eq!(device.pin_get(Pin::Reset), LineLevel::Ready);
    }

    #[test]
    fn test_status_pin_write_is_a_no_op() {
        let mut device = Device::new();
        device.pin_set(Pin::Status, 1);
        assert_eq!(device.machine_state(), MachineState::Idle);
    }

    #[test]
    fn test_setup_mid_operation_restarts_parser() {
        // A fresh setup is permitted even with the program deadline armed.
        let mut device = Device::with_bug_policy(BugPolicy::Latch);
        device.write_register(REG_COMMAND, Opcode::ProgramSetup as u8);
        for byte in [0, 0, 0] {
            device.write_register(REG_ADDRESS, byte);
        }
        for _ in 0..PAGE_SIZE {
            device.write_register(REG_DATA, 0xCC);
        }
        device.write_register(REG_COMMAND, Opcode::ProgramExecute as u8);
        assert_eq!(device.pin_get(Pin::Status), LineLevel::Busy);

        device.write_register(REG_COMMAND, Opcode::ReadSetup as u8);
        assert_eq!(device.machine_state(), MachineState::ReadAwaitBlock);
    }

    #[test]
    fn test_non_setup_mid_operation_latches_bug() {
        let mut device = Device::with_bug_policy(BugPolicy::Latch);
        device.write_register(REG_COMMAND, Opcode::ProgramSetup as u8);
        for byte in [0, 0, 0] {
            device.write_register(REG_ADDRESS, byte);
        }
        device.write_register(REG_DATA, 0x01);
        device.write_register(REG_COMMAND, Opcode::ProgramExecute as u8);
        assert_eq!(device.pin_get(Pin::Status), LineLevel::Busy);

        device.write_register(REG_COMMAND, Opcode::ReadExecute as u8);
        assert_eq!(device.machine_state(), MachineState::Bug);
    }

    #[test]
    #[should_panic(expected = "machine state bug")]
    fn test_fatal_policy_panics_on_violation() {
        let mut device = Device::new();
        device.write_register(REG_COMMAND, Opcode::Dummy as u8);
    }
}
