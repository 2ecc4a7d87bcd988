//! Hardware abstraction: the block-device contract.
//!
//! Disk drivers are external collaborators; the kernel only assumes this
//! synchronous read/write contract per device number. The driver is
//! responsible for suspending the calling process while a request is in
//! flight. Tests register a RAM-backed `MemDisk`.

use spin::Once;

use crate::param::{BSIZE, NDEV};

pub trait BlockDevice: Sync {
    /// Reads block `bno` into `data`.
    fn read_block(&self, bno: u32, data: &mut [u8; BSIZE]);

    /// Writes `data` to block `bno`.
    fn write_block(&self, bno: u32, data: &[u8; BSIZE]);
}

/// Registered block devices, indexed by device number.
pub struct BlockDevices {
    devices: [Once<&'static dyn BlockDevice>; NDEV],
}

impl BlockDevices {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const NONE: Once<&'static dyn BlockDevice> = Once::new();
        Self {
            devices: [NONE; NDEV],
        }
    }

    /// Registers the driver for device `dev`. May be called once per slot.
    pub fn register(&self, dev: u32, device: &'static dyn BlockDevice) {
        let slot = &self.devices[dev as usize];
        assert!(slot.get().is_none(), "block device registered twice");
        let _ = slot.call_once(|| device);
    }

    pub fn get(&self, dev: u32) -> &'static dyn BlockDevice {
        *self
            .devices
            .get(dev as usize)
            .and_then(|d| d.get())
            .expect("no driver for block device")
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// RAM-backed block device for host tests. Supports snapshotting the
    /// raw image so crash-recovery tests can rewind the "disk".
    pub struct MemDisk {
        blocks: Mutex<Vec<[u8; BSIZE]>>,
    }

    impl MemDisk {
        pub fn new(nblocks: usize) -> Self {
            Self {
                blocks: Mutex::new(vec![[0; BSIZE]; nblocks]),
            }
        }

        pub fn from_image(image: &[u8]) -> Self {
            assert_eq!(image.len() % BSIZE, 0);
            let blocks = image
                .chunks_exact(BSIZE)
                .map(|c| {
                    let mut b = [0; BSIZE];
                    b.copy_from_slice(c);
                    b
                })
                .collect();
            Self {
                blocks: Mutex::new(blocks),
            }
        }

        pub fn snapshot(&self) -> Vec<[u8; BSIZE]> {
            self.blocks.lock().unwrap().clone()
        }

        pub fn restore(&self, snapshot: Vec<[u8; BSIZE]>) {
            *self.blocks.lock().unwrap() = snapshot;
        }

        pub fn peek(&self, bno: u32) -> [u8; BSIZE] {
            self.blocks.lock().unwrap()[bno as usize]
        }

        pub fn poke(&self, bno: u32, data: &[u8; BSIZE]) {
            self.blocks.lock().unwrap()[bno as usize] = *data;
        }
    }

    impl BlockDevice for MemDisk {
        fn read_block(&self, bno: u32, data: &mut [u8; BSIZE]) {
            *data = self.blocks.lock().unwrap()[bno as usize];
        }

        fn write_block(&self, bno: u32, data: &[u8; BSIZE]) {
            self.blocks.lock().unwrap()[bno as usize] = *data;
        }
    }
}
