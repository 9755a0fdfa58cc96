//! SpaceWire drivers.
//!
//! The registry maps the device index carried in work messages back to
//! the core. Bus enumeration hands devices in at discovery time.

pub mod grspw;

use alloc::{sync::Arc, vec::Vec};

use spwkernel_lib::sync::mutex::Mutex;

use self::grspw::Grspw;

static DEVICES: Mutex<Vec<Option<Arc<Grspw>>>> = Mutex::new(Vec::new());

/// Add a device and assign it the index work messages will carry.
pub fn register(dev: Arc<Grspw>) -> usize {
    let mut devices = DEVICES.lock();

    let index = match devices.iter().position(|slot| slot.is_none()) {
        Some(i) => {
            devices[i] = Some(dev.clone());
            i
        }
        None => {
            devices.push(Some(dev.clone()));
            devices.len() - 1
        }
    };

    dev.set_index(index);
    log::debug!("grspw{index}: registered");
    index
}

pub fn device(index: usize) -> Option<Arc<Grspw>> {
    DEVICES.lock().get(index)?.clone()
}

pub fn unregister(index: usize) -> Option<Arc<Grspw>> {
    let mut devices = DEVICES.lock();
    devices.get_mut(index)?.take()
}
