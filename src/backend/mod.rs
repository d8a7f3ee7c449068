//! VideoCore platform backends
//!
//! A [`Platform`] bundles the two device seams the runtime needs: the
//! firmware mailbox transport and the bus memory mapper. Hardware uses
//! `/dev/vcio` and `/dev/mem`; tests use [`simulated::SimulatedDevice`].

pub mod busmem;
pub mod mailbox;
pub mod simulated;

pub use busmem::{BusMemory, CacheOp, CachePolicy, DevMemMapper, MappedRegion};
pub use mailbox::{FirmwareChannel, FirmwareTransport, MailboxError, MemFlags, VcioDevice};

use crate::runtime::RuntimeConfig;

/// Device access used by a runtime
pub struct Platform {
    transport: Box<dyn FirmwareTransport>,
    memory: Box<dyn BusMemory>,
}

impl Platform {
    pub fn new(transport: Box<dyn FirmwareTransport>, memory: Box<dyn BusMemory>) -> Self {
        Self { transport, memory }
    }

    /// Real VideoCore devices at the configured paths
    pub fn hardware(config: &RuntimeConfig) -> Self {
        Self::new(
            Box::new(VcioDevice::new(&config.mailbox_path)),
            Box::new(DevMemMapper::new(&config.devmem_path)),
        )
    }

    pub(crate) fn into_parts(self) -> (Box<dyn FirmwareTransport>, Box<dyn BusMemory>) {
        (self.transport, self.memory)
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("mailbox_open", &self.transport.is_open())
            .finish()
    }
}
