//! USB device identity, vendor filters and endpoint selection
//!
//! Plain data types shared by the rusb backend, the transport and the
//! hot-plug supervisor. Nothing in here touches libusb, so filter and
//! endpoint logic can be tested without hardware.

use crate::error::{LinkError, Result};
use std::fmt;
use std::str::FromStr;

/// Vendor id of Woosim receipt printers, used by the default filter
pub const WOOSIM_VENDOR_ID: u16 = 0x2a92;

/// Location of a device on the bus
///
/// Stable for as long as the device stays plugged in; a re-plugged device
/// gets a new address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbDeviceId {
    pub bus: u8,
    pub address: u8,
}

impl UsbDeviceId {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for UsbDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Descriptor summary of an attached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub id: UsbDeviceId,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl UsbDeviceInfo {
    /// Human readable label, e.g. `Woosim WSP-i350 (2a92:0010)`
    pub fn label(&self) -> String {
        let ids = format!("{:04x}:{:04x}", self.vendor_id, self.product_id);
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) => format!("{} {} ({})", m, p, ids),
            (None, Some(p)) => format!("{} ({})", p, ids),
            (Some(m), None) => format!("{} ({})", m, ids),
            (None, None) => ids,
        }
    }
}

/// Vendor/product filter written as `0xVID:0xPID` or `0xVID:*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbFilter {
    pub vendor_id: u16,
    /// `None` matches any product of the vendor
    pub product_id: Option<u16>,
}

impl UsbFilter {
    pub fn vendor(vendor_id: u16) -> Self {
        Self {
            vendor_id,
            product_id: None,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id.is_none_or(|p| p == product_id)
    }
}

impl Default for UsbFilter {
    fn default() -> Self {
        Self::vendor(WOOSIM_VENDOR_ID)
    }
}

impl FromStr for UsbFilter {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let (vid, pid) = s.trim().split_once(':').ok_or_else(|| {
            LinkError::InvalidTarget(format!(
                "invalid filter '{}', expected VID:PID (e.g. '0x2a92:0x0010' or '0x2a92:*')",
                s
            ))
        })?;

        let vendor_id = parse_hex_id(vid, "VID")?;
        let product_id = match pid {
            "*" => None,
            pid => Some(parse_hex_id(pid, "PID")?),
        };
        Ok(Self {
            vendor_id,
            product_id,
        })
    }
}

impl fmt::Display for UsbFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.product_id {
            Some(pid) => write!(f, "0x{:04x}:0x{:04x}", self.vendor_id, pid),
            None => write!(f, "0x{:04x}:*", self.vendor_id),
        }
    }
}

/// Parse a `0x`-prefixed hex id of one to four digits
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| {
            LinkError::InvalidTarget(format!(
                "invalid {} '{}', must start with '0x' (e.g. '0x2a92')",
                name, id
            ))
        })?;
    if hex.is_empty() || hex.len() > 4 {
        return Err(LinkError::InvalidTarget(format!(
            "invalid {} '{}', hex part must be 1-4 digits",
            name, id
        )));
    }
    u16::from_str_radix(hex, 16)
        .map_err(|_| LinkError::InvalidTarget(format!("invalid {} '{}', not hex", name, id)))
}

/// Returns true if any filter matches; an empty list matches everything
pub fn matches_any(filters: &[UsbFilter], vendor_id: u16, product_id: u16) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(vendor_id, product_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One endpoint of an interface's active alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub max_packet_size: u16,
}

impl EndpointInfo {
    pub fn bulk(address: u8, direction: Direction) -> Self {
        Self {
            address,
            direction,
            kind: TransferKind::Bulk,
            max_packet_size: 64,
        }
    }
}

/// The bulk pair a printer link uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub interface: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
}

/// Pick the first bulk-IN and first bulk-OUT endpoint of `interface`
///
/// Fails with [`LinkError::EndpointsNotFound`] if either is missing.
pub fn select_bulk_endpoints(interface: u8, endpoints: &[EndpointInfo]) -> Result<BulkEndpoints> {
    let find = |direction| {
        endpoints
            .iter()
            .find(|ep| ep.kind == TransferKind::Bulk && ep.direction == direction)
            .map(|ep| ep.address)
    };

    match (find(Direction::In), find(Direction::Out)) {
        (Some(bulk_in), Some(bulk_out)) => Ok(BulkEndpoints {
            interface,
            bulk_in,
            bulk_out,
        }),
        _ => Err(LinkError::EndpointsNotFound { interface }),
    }
}
