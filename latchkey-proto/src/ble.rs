//! BLE GATT constants for the Latchkey control channel
//!
//! A lock exposes one primary service with a single characteristic. The
//! client writes framed JSON commands to it and the lock answers with framed
//! JSON notifications on the same characteristic.

/// Control service UUID: 0000ffe0-0000-1000-8000-00805f9b34fb
pub const CONTROL_SERVICE_UUID: u128 = 0x0000ffe0_0000_1000_8000_00805f9b34fb;

/// Control characteristic UUID (write + notify)
pub const CONTROL_CHAR_UUID: u128 = 0x0000ffe1_0000_1000_8000_00805f9b34fb;

/// Largest attribute value a single write may carry (ATT_MTU permitting)
pub const MAX_WRITE_LEN: usize = 512;

/// Advertised name prefix of unprovisioned locks
pub const DEVICE_NAME_PREFIX: &str = "Latchkey";
