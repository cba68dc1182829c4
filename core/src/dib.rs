//! Device Information Base
//!
//! A small registry describing the installed NAND devices: each device
//! references one controller chip, and each controller owns a list of
//! storage chips. Ownership runs parent to child; the first and last
//! storage chips carry weak back-references to their controller, which is
//! what keeps the naive ownership graph acyclic.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use thiserror::Error;

use crate::geometry::ChipGeometry;

/// Most devices a DIB may register.
pub const MAX_NAND_DEVICES: usize = 64;
/// Most storage chips one controller may own.
pub const MAX_STORAGE_CHIPS: usize = 8;

pub type ControllerRef = Rc<RefCell<ControllerChip>>;
pub type StorageRef = Rc<RefCell<StorageChip>>;

/// One physical storage die.
#[derive(Debug)]
pub struct StorageChip {
    pub geometry: ChipGeometry,
    /// Back-reference to the owning controller. Only the first and last
    /// chips in a controller's list carry one; middle chips hold `None`.
    pub controller: Option<Weak<RefCell<ControllerChip>>>,
    pub ref_count: u32,
}

/// A controller chip and the storage dies behind it.
#[derive(Debug)]
pub struct ControllerChip {
    pub nstorage: u32,
    pub storage: Vec<StorageRef>,
    pub ref_count: u32,
}

impl ControllerChip {
    pub fn first_storage(&self) -> Option<&StorageRef> {
        self.storage.first()
    }

    pub fn last_storage(&self) -> Option<&StorageRef> {
        self.storage.last()
    }
}

/// One installed NAND device.
#[derive(Debug)]
pub struct NandDevice {
    pub makemodel: String,
    pub controller: Option<ControllerRef>,
    pub ref_count: u32,
}

impl NandDevice {
    /// A well-formed device record with one controller and one storage
    /// chip, the shape the reference driver registers.
    pub fn single_chip(makemodel: &str, geometry: ChipGeometry) -> Self {
        let controller = Rc::new(RefCell::new(ControllerChip {
            nstorage: 1,
            storage: Vec::new(),
            ref_count: 1,
        }));
        let chip = Rc::new(RefCell::new(StorageChip {
            geometry,
            controller: Some(Rc::downgrade(&controller)),
            ref_count: 1,
        }));
        controller.borrow_mut().storage.push(chip);

        Self {
            makemodel: makemodel.to_string(),
            controller: Some(controller),
            // One reference from the DIB plus one per controller.
            ref_count: 2,
        }
    }
}

/// The registry itself: an acyclic list of devices. An empty DIB is
/// well-formed.
#[derive(Debug, Default)]
pub struct Dib {
    pub devices: Vec<NandDevice>,
}

impl Dib {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device at the front of the list.
    pub fn push_front(&mut self, device: NandDevice) {
        self.devices.insert(0, device);
    }
}

/// Ways a DIB can be malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DibError {
    #[error("device information base has too many devices")]
    TooManyDevices,
    #[error("device '{0}' has no controller chip")]
    MissingController(String),
    #[error("controller chip has no storage chips")]
    NoStorageChips,
    #[error("controller chip has too many storage chips")]
    TooManyStorageChips,
    #[error("first and last storage chips do not point back to their controller")]
    BrokenBackReference,
    #[error("middle storage chips must not reference a controller")]
    UnexpectedBackReference,
    #[error("storage chip has reference count != 1")]
    StorageRefCount,
    #[error("controller reference count is incorrect")]
    ControllerRefCount,
    #[error("device reference count is incorrect")]
    DeviceRefCount,
}

fn verify_storage(
    controller: &ControllerRef,
    storage: &StorageRef,
    is_endpoint: bool,
) -> Result<(), DibError> {
    let chip = storage.borrow();

    // First and last chips link back to the controller; the rest carry
    // no back-reference at all.
    if is_endpoint {
        let links_back = chip
            .controller
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|upgraded| Rc::ptr_eq(&upgraded, controller))
            .unwrap_or(false);
        if !links_back {
            return Err(DibError::BrokenBackReference);
        }
    } else if chip.controller.is_some() {
        return Err(DibError::UnexpectedBackReference);
    }

    if chip.ref_count != 1 {
        return Err(DibError::StorageRefCount);
    }

    Ok(())
}

fn verify_controller(controller: &ControllerRef) -> Result<(), DibError> {
    let chip = controller.borrow();

    if chip.storage.len() > MAX_STORAGE_CHIPS {
        return Err(DibError::TooManyStorageChips);
    }

    let first = chip.first_storage().ok_or(DibError::NoStorageChips)?;
    let last = chip.last_storage().ok_or(DibError::NoStorageChips)?;
    for storage in &chip.storage {
        let is_endpoint = Rc::ptr_eq(storage, first) || Rc::ptr_eq(storage, last);
        verify_storage(controller, storage, is_endpoint)?;
    }

    // The reference count must equal the storage-node count, and the
    // recorded count must be accurate.
    if chip.ref_count != chip.nstorage || chip.nstorage as usize != chip.storage.len() {
        return Err(DibError::ControllerRefCount);
    }

    Ok(())
}

fn verify_device(device: &NandDevice) -> Result<(), DibError> {
    let controller = device
        .controller
        .as_ref()
        .ok_or_else(|| DibError::MissingController(device.makemodel.clone()))?;

    verify_controller(controller)?;

    if device.ref_count != controller.borrow().ref_count + 1 {
        return Err(DibError::DeviceRefCount);
    }

    Ok(())
}

/// Check every device in the DIB for well-formedness.
pub fn verify_dib(dib: &Dib) -> Result<(), DibError> {
    if dib.devices.len() > MAX_NAND_DEVICES {
        return Err(DibError::TooManyDevices);
    }
    for device in &dib.devices {
        verify_device(device)?;
    }
    Ok(())
}
