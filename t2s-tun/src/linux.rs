//! Linux-specific helpers
//!
//! Used to check whether the tun driver is present and whether an
//! interface created by the bridge still exists after it was released.

use std::ffi::CString;

use crate::error::{Error, Result};

/// Get the interface index for a given interface name
pub fn get_interface_index(name: &str) -> Result<u32> {
    let c_name = CString::new(name).map_err(|_| Error::Config("invalid interface name".into()))?;

    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        return Err(Error::DeviceNotFound(name.to_string()));
    }

    Ok(index)
}

/// Whether an interface with this name currently exists
pub fn interface_exists(name: &str) -> bool {
    get_interface_index(name).is_ok()
}

/// Check if the TUN kernel module is loaded
pub fn is_tun_available() -> bool {
    std::path::Path::new("/dev/net/tun").exists()
}
