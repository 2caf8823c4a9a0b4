use std::time::Duration;

use bbp_codec::DEFAULT_MAX_PAYLOAD;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Long enough for a user to read and confirm a transaction on the device.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_QUEUE_DEPTH: usize = 32;
pub const DEFAULT_MAX_RESPONSE_LEN: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub max_payload: usize,
    pub max_response_len: usize,
    pub handshake_timeout: Duration,
    pub call_timeout: Duration,
    pub remember_channel: bool,
    pub queue_depth: usize,
    pub max_read_retries: Option<u32>,
    pub event_capacity: usize,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_response_len: DEFAULT_MAX_RESPONSE_LEN,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            remember_channel: true,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_read_retries: None,
            event_capacity: 64,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_remember_channel(mut self, remember: bool) -> Self {
        self.remember_channel = remember;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn with_max_read_retries(mut self, retries: Option<u32>) -> Self {
        self.max_read_retries = retries;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Upper bound on a response reassembled from partial pieces.
    pub fn with_max_response_len(mut self, len: usize) -> Self {
        self.max_response_len = len;
        self
    }
}
