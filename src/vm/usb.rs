//! Host USB device discovery for passthrough.
//!
//! Attaching and detaching go over the monitor
//! ([`ControlCommand::UsbAttach`](crate::vm::monitor::ControlCommand::UsbAttach));
//! this module only lists what the host has.

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbDevice {
    pub bus: String,
    pub device: String,
    pub vendor_id: String,
    pub product_id: String,
    pub name: String,
    /// `vendor:product`, as printed by `lsusb`.
    pub id: String,
}

/// Run `lsusb`. No tool or no devices both yield an empty list.
pub async fn list_devices() -> Vec<UsbDevice> {
    match Command::new("lsusb").output().await {
        Ok(output) if output.status.success() => {
            parse_lsusb(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            debug!(status = %output.status, "lsusb failed");
            Vec::new()
        }
        Err(e) => {
            debug!(error = %e, "lsusb unavailable");
            Vec::new()
        }
    }
}

/// Parse lines like `Bus 001 Device 002: ID 0a5c:4500 Broadcom Corp. BCM2046B1`.
pub fn parse_lsusb(text: &str) -> Vec<UsbDevice> {
    text.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<UsbDevice> {
    let rest = line.trim().strip_prefix("Bus ")?;
    let (bus, rest) = rest.split_once(" Device ")?;
    let (device, rest) = rest.split_once(": ID ")?;
    let (id, name) = rest.split_once(' ').unwrap_or((rest, ""));
    let (vendor_id, product_id) = id.split_once(':')?;

    let hex4 = |s: &str| s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit());
    if !hex4(vendor_id) || !hex4(product_id) {
        return None;
    }

    Some(UsbDevice {
        bus: bus.to_string(),
        device: device.to_string(),
        vendor_id: vendor_id.to_ascii_lowercase(),
        product_id: product_id.to_ascii_lowercase(),
        name: name.trim().to_string(),
        id: id.to_ascii_lowercase(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lsusb_output() {
        let text = "Bus 001 Device 002: ID 0a5c:4500 Broadcom Corp. BCM2046B1\n\
                    Bus 002 Device 001: ID 1d6b:0003 Linux Foundation 3.0 root hub\n";
        let devices = parse_lsusb(text);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].bus, "001");
        assert_eq!(devices[0].device, "002");
        assert_eq!(devices[0].vendor_id, "0a5c");
        assert_eq!(devices[0].product_id, "4500");
        assert_eq!(devices[0].name, "Broadcom Corp. BCM2046B1");
        assert_eq!(devices[1].id, "1d6b:0003");
    }

    #[test]
    fn unnamed_device_and_noise() {
        let text = "garbage\nBus 003 Device 004: ID 05ac:12a8\nBus 1 Device 2: ID zz:yy thing\n";
        let devices = parse_lsusb(text);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "");
        assert_eq!(devices[0].product_id, "12a8");
    }
}
