//! Synchronous request/response channel to the VideoCore firmware

use super::error::{MailboxError, MailboxResult};
use super::ffi::{
    MemFlags, MBOX_END_TAG, MBOX_ERROR, MBOX_PROCESS_REQUEST, MBOX_SUCCESS, TAG_ALLOCATE_MEMORY,
    TAG_EXECUTE_QPU, TAG_LOCK_MEMORY, TAG_RELEASE_MEMORY, TAG_SET_ENABLE_QPU, TAG_UNLOCK_MEMORY,
};

/// Number of words in a property buffer around the tag payload:
/// total size, request code, tag, buffer size, request length, end tag.
const PROPERTY_OVERHEAD_WORDS: usize = 6;
const PAYLOAD_OFFSET: usize = 5;

/// Transport that carries one property buffer to the firmware and back
///
/// The hardware implementation is [`super::VcioDevice`]; the in-process
/// simulator implements the same trait so the whole stack above it can be
/// exercised without a VideoCore.
pub trait FirmwareTransport: Send {
    /// Acquire the underlying device
    fn open(&mut self) -> MailboxResult<()>;

    /// Release the underlying device
    fn close(&mut self) -> MailboxResult<()>;

    fn is_open(&self) -> bool;

    /// Hand `buffer` to the firmware; the response is written in place
    fn exchange(&mut self, buffer: &mut [u32]) -> MailboxResult<()>;
}

/// Typed firmware operations on top of a [`FirmwareTransport`]
pub struct FirmwareChannel {
    transport: Box<dyn FirmwareTransport>,
    calls: u64,
}

impl std::fmt::Debug for FirmwareChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareChannel")
            .field("open", &self.transport.is_open())
            .field("calls", &self.calls)
            .finish()
    }
}

impl FirmwareChannel {
    pub fn new(transport: Box<dyn FirmwareTransport>) -> Self {
        Self { transport, calls: 0 }
    }

    pub fn open(&mut self) -> MailboxResult<()> {
        tracing::debug!("FirmwareChannel::open");
        self.transport.open()
    }

    pub fn close(&mut self) -> MailboxResult<()> {
        tracing::debug!("FirmwareChannel::close after {} property calls", self.calls);
        self.transport.close()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Number of property calls issued through this channel
    pub fn call_count(&self) -> u64 {
        self.calls
    }

    /// Issue one property request and return the response payload
    ///
    /// The returned vector has the same number of words as `payload`.
    pub fn property_call(&mut self, tag: u32, payload: &[u32]) -> MailboxResult<Vec<u32>> {
        if !self.transport.is_open() {
            return Err(MailboxError::NotOpen);
        }

        let words = payload.len();
        let mut buffer = vec![0u32; words + PROPERTY_OVERHEAD_WORDS];
        buffer[0] = (buffer.len() * 4) as u32;
        buffer[1] = MBOX_PROCESS_REQUEST;
        buffer[2] = tag;
        buffer[3] = (words * 4) as u32;
        buffer[4] = (words * 4) as u32;
        buffer[PAYLOAD_OFFSET..PAYLOAD_OFFSET + words].copy_from_slice(payload);
        buffer[PAYLOAD_OFFSET + words] = MBOX_END_TAG;

        tracing::trace!("property_call: tag={:#x} payload={:x?}", tag, payload);
        self.calls += 1;
        self.transport.exchange(&mut buffer)?;

        match buffer[1] {
            MBOX_SUCCESS => {}
            MBOX_ERROR => {
                tracing::error!("property_call: firmware failed request for tag {:#x}", tag);
                return Err(MailboxError::RequestFailed { tag });
            }
            status => {
                tracing::error!(
                    "property_call: unrecognized status {:#010x} for tag {:#x}",
                    status,
                    tag
                );
                return Err(MailboxError::UnrecognizedStatus { tag, status });
            }
        }

        if buffer[2] != tag {
            return Err(MailboxError::MalformedResponse {
                tag,
                reason: format!("response carries tag {:#x}", buffer[2]),
            });
        }

        let response = buffer[PAYLOAD_OFFSET..PAYLOAD_OFFSET + words].to_vec();
        tracing::trace!("property_call: tag={:#x} response={:x?}", tag, response);
        Ok(response)
    }

    /// Allocate contiguous memory on the GPU and return its handle
    pub fn allocate_memory(&mut self, size: u32, align: u32, flags: MemFlags) -> MailboxResult<u32> {
        let handle = self.property_call(TAG_ALLOCATE_MEMORY, &[size, align, flags.bits()])?[0];
        if handle == 0 {
            return Err(MailboxError::Rejected {
                operation: "allocate_memory",
                value: handle,
            });
        }
        Ok(handle)
    }

    /// Lock an allocation in place and return its bus address
    pub fn lock_memory(&mut self, handle: u32) -> MailboxResult<u32> {
        let bus = self.property_call(TAG_LOCK_MEMORY, &[handle])?[0];
        if bus == 0 {
            return Err(MailboxError::Rejected {
                operation: "lock_memory",
                value: bus,
            });
        }
        Ok(bus)
    }

    pub fn unlock_memory(&mut self, bus_address: u32) -> MailboxResult<()> {
        let status = self.property_call(TAG_UNLOCK_MEMORY, &[bus_address])?[0];
        check_zero("unlock_memory", status)
    }

    pub fn release_memory(&mut self, handle: u32) -> MailboxResult<()> {
        let status = self.property_call(TAG_RELEASE_MEMORY, &[handle])?[0];
        check_zero("release_memory", status)
    }

    /// Start `num_qpus` units from the control block at `control` and wait
    pub fn execute_qpu(
        &mut self,
        num_qpus: u32,
        control: u32,
        noflush: bool,
        timeout_ms: u32,
    ) -> MailboxResult<()> {
        let status = self.property_call(
            TAG_EXECUTE_QPU,
            &[num_qpus, control, noflush as u32, timeout_ms],
        )?[0];
        check_zero("execute_qpu", status)
    }

    /// Power the QPU block up or down
    pub fn enable_qpu(&mut self, enable: bool) -> MailboxResult<()> {
        let status = self.property_call(TAG_SET_ENABLE_QPU, &[enable as u32])?[0];
        check_zero("enable_qpu", status)
    }
}

fn check_zero(operation: &'static str, value: u32) -> MailboxResult<()> {
    if value != 0 {
        tracing::error!("{} returned {:#x}", operation, value);
        return Err(MailboxError::Rejected { operation, value });
    }
    Ok(())
}
