//! USB transport: device enumeration and the raw bulk read/write primitives the session and
//! transfer pipeline build their framing on top of.

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, UsbContext};

use crate::{Error, Result, COMMAND_TIMEOUT, PRODUCT_IDS, VENDOR_ID};

/// Writes larger than this are split into multiple bulk transfers.
const MAX_SINGLE_WRITE: usize = 65536;

/// Identifying information for a device found during enumeration.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
  pub vendor_id: u16,
  pub product_id: u16,
  pub manufacturer: Option<String>,
  pub product: Option<String>,
  pub serial: Option<String>,
  pub bus_number: u8,
  pub address: u8,
}

/// The raw transport primitives a session is built on. Implemented by [`UsbTransport`] for real
/// hardware and by a scripted mock in tests.
pub trait Transport {
  /// Write `bytes`, transparently chunking any write over 64 KiB. Returns the total bytes
  /// written.
  fn write(&mut self, bytes: &[u8]) -> Result<usize>;

  /// Read up to `max_bytes`, honoring `timeout`. Short reads are allowed; exceeding the
  /// timeout is reported as [`Error::Timeout`], distinguishable from any protocol error.
  fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>>;

  /// Perform a zero-length bulk write. Required before/after certain frames in the transfer
  /// pipeline as a synchronization marker the device expects.
  fn zero_length_write(&mut self) -> Result<()>;
}

/// Enumerate connected devices matching the Samsung Odin/Loke vendor/product ids, without
/// opening or claiming any of them.
pub fn enumerate() -> Result<Vec<DeviceInfo>> {
  let context = Context::new()?;
  let mut found = Vec::new();

  for device in context.devices()?.iter() {
    let Ok(desc) = device.device_descriptor() else { continue };
    if desc.vendor_id() != VENDOR_ID || !PRODUCT_IDS.contains(&desc.product_id()) {
      continue;
    }

    let (manufacturer, product, serial) = match device.open() {
      Ok(handle) => read_strings(&device, &handle, &desc),
      Err(_) => (None, None, None),
    };

    found.push(DeviceInfo {
      vendor_id: desc.vendor_id(),
      product_id: desc.product_id(),
      manufacturer,
      product,
      serial,
      bus_number: device.bus_number(),
      address: device.address(),
    });
  }

  Ok(found)
}

fn read_strings<C: UsbContext>(
  device: &Device<C>,
  handle: &DeviceHandle<C>,
  desc: &rusb::DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
  let _ = device;
  let timeout = Duration::from_millis(200);
  let Ok(languages) = handle.read_languages(timeout) else {
    return (None, None, None);
  };
  let Some(lang) = languages.first().copied() else {
    return (None, None, None);
  };

  let manufacturer = handle.read_manufacturer_string(lang, desc, timeout).ok();
  let product = handle.read_product_string(lang, desc, timeout).ok();
  let serial = handle.read_serial_number_string(lang, desc, timeout).ok();
  (manufacturer, product, serial)
}

struct UsbInner {
  handle: DeviceHandle<Context>,
  interface_number: u8,
  endpoint_in: u8,
  endpoint_out: u8,
}

/// A claimed USB connection to one device, implementing [`Transport`] over bulk transfers.
pub struct UsbTransport {
  inner: UsbInner,
}

impl UsbTransport {
  /// Open the first device matching the Samsung vendor/product ids, claim its interface and
  /// discover bulk endpoints.
  pub fn open() -> Result<Self> {
    let context = Context::new()?;
    let device = context
      .devices()?
      .iter()
      .find(|device| {
        device
          .device_descriptor()
          .map(|desc| desc.vendor_id() == VENDOR_ID && PRODUCT_IDS.contains(&desc.product_id()))
          .unwrap_or(false)
      })
      .ok_or(Error::NoDevice)?;

    let handle = device.open().map_err(|e| Error::UsbOpen(e.to_string()))?;
    handle.set_active_configuration(1)?;

    let interface_number: u8 = 0;
    handle.claim_interface(interface_number)?;

    let config_desc = device.active_config_descriptor()?;
    let interface = config_desc
      .interfaces()
      .find(|i| i.number() == interface_number)
      .ok_or_else(|| Error::UsbOpen("interface not found".into()))?;
    let descriptor = interface
      .descriptors()
      .next()
      .ok_or_else(|| Error::UsbOpen("no alternate setting".into()))?;

    let mut endpoint_in = None;
    let mut endpoint_out = None;
    for ep in descriptor.endpoint_descriptors() {
      match ep.direction() {
        Direction::In => endpoint_in = Some(ep.address()),
        Direction::Out => endpoint_out = Some(ep.address()),
      }
    }
    let endpoint_in = endpoint_in.ok_or_else(|| Error::UsbOpen("no IN endpoint".into()))?;
    let endpoint_out = endpoint_out.ok_or_else(|| Error::UsbOpen("no OUT endpoint".into()))?;

    tracing::info!(interface_number, endpoint_in, endpoint_out, "claimed usb interface");

    Ok(Self { inner: UsbInner { handle, interface_number, endpoint_in, endpoint_out } })
  }
}

impl Transport for UsbTransport {
  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  fn write(&mut self, bytes: &[u8]) -> Result<usize> {
    let mut offset = 0;
    let mut written = 0;
    while offset < bytes.len() {
      let end = (offset + MAX_SINGLE_WRITE).min(bytes.len());
      written += self.inner.handle.write_bulk(self.inner.endpoint_out, &bytes[offset..end], COMMAND_TIMEOUT)?;
      offset = end;
    }
    Ok(written)
  }

  #[cfg_attr(feature = "instrument", tracing::instrument(level = "trace", skip_all))]
  fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; max_bytes];
    match self.inner.handle.read_bulk(self.inner.endpoint_in, &mut buf, timeout) {
      Ok(read) => {
        buf.truncate(read);
        Ok(buf)
      }
      Err(rusb::Error::Timeout) => Err(Error::Timeout { phase: "transport read" }),
      Err(e) => Err(Error::UsbError(e)),
    }
  }

  fn zero_length_write(&mut self) -> Result<()> {
    self.inner.handle.write_bulk(self.inner.endpoint_out, &[], COMMAND_TIMEOUT)?;
    Ok(())
  }
}

impl Drop for UsbTransport {
  fn drop(&mut self) {
    match self.inner.handle.release_interface(self.inner.interface_number) {
      Ok(()) => tracing::trace!("released usb interface"),
      Err(err) => tracing::warn!(error = %err, "failed to release usb interface"),
    }
  }
}
