// Port allocator - hands out distinct host ports from a fixed contiguous range

use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("all ports are already allocated")]
pub struct AllPortsAllocated;

#[derive(Debug)]
struct PortSlot {
    port: u16,
    in_use: bool,
}

/// Fixed-size table of host ports, one slot per allowable concurrent server.
/// Slot `i` holds `min_port + i`.
#[derive(Debug)]
pub struct PortAllocator {
    slots: Mutex<Vec<PortSlot>>,
}

impl PortAllocator {
    pub fn new(min_port: u16, count: usize) -> Self {
        let slots = (0..count)
            .map(|i| PortSlot {
                port: min_port + i as u16,
                in_use: false,
            })
            .collect();

        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Marks the first free slot as in use and returns its port.
    pub fn alloc(&self) -> Result<u16, AllPortsAllocated> {
        let mut slots = self.slots.lock().expect("port table lock poisoned");

        for slot in slots.iter_mut() {
            if slot.in_use {
                continue;
            }

            tracing::debug!(port = slot.port, "allocating port");
            slot.in_use = true;
            return Ok(slot.port);
        }

        Err(AllPortsAllocated)
    }

    /// Returns a port to the table. Freeing a port that was never handed out
    /// is a no-op.
    pub fn free(&self, port: u16) {
        let mut slots = self.slots.lock().expect("port table lock poisoned");

        for slot in slots.iter_mut() {
            if slot.port != port {
                continue;
            }

            tracing::debug!(port = slot.port, "freeing port");
            slot.in_use = false;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_lifecycle() {
        let ports = PortAllocator::new(27015, 2);

        let p1 = ports.alloc().expect("first port allocated");
        assert_eq!(p1, 27015);

        let p2 = ports.alloc().expect("second port allocated");
        assert_eq!(p2, 27016);
        assert_ne!(p1, p2);

        ports
            .alloc()
            .expect_err("cannot allocate more ports than given capacity");

        ports.free(p1);
        let p3 = ports.alloc().expect("port allocated after free");
        assert_eq!(p3, p1, "freed port is handed out again");
    }

    #[test]
    fn ports_stay_within_range() {
        let ports = PortAllocator::new(27015, 4);

        for _ in 0..4 {
            let port = ports.alloc().expect("port allocated");
            assert!((27015..27019).contains(&port));
        }
    }

    #[test]
    fn freeing_unknown_port_is_a_noop() {
        let ports = PortAllocator::new(27015, 1);
        ports.free(1234);

        assert_eq!(ports.alloc().expect("port allocated"), 27015);
    }
}
