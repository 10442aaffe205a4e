//! Capability checks and format negotiation against any [`CaptureDriver`].

use log::{debug, warn};

use crate::traits::{CameraError, CaptureDriver, DeviceCapabilities, Format, FourCC, Result};

/// Query the device and make sure it can stream video capture.
///
/// Devices that only offer `read()` I/O are rejected.
pub fn query_capabilities<D: CaptureDriver>(driver: &D) -> Result<DeviceCapabilities> {
    let caps = driver
        .query_capabilities()
        .map_err(|err| CameraError::UnsupportedDevice(format!("capability query failed: {err}")))?;
    debug!(
        "device: {} (driver {}, bus {})",
        caps.card, caps.driver, caps.bus_info
    );

    if !caps.can_capture {
        return Err(CameraError::UnsupportedDevice(format!(
            "{} does not support video capture",
            caps.card
        )));
    }
    if !caps.can_stream {
        return Err(CameraError::UnsupportedDevice(format!(
            "{} does not support streaming I/O",
            caps.card
        )));
    }

    Ok(caps)
}

/// Ask the driver for `width`x`height` in `fourcc`, starting from its current
/// format. The returned format is what the driver actually chose and is the
/// one to size buffers by.
pub fn negotiate_format<D: CaptureDriver>(
    driver: &mut D,
    width: u32,
    height: u32,
    fourcc: FourCC,
) -> Result<Format> {
    let rejected = |reason: String, source| CameraError::FormatRejected { reason, source };

    let current = driver
        .format()
        .map_err(|err| rejected("failed to read current format".to_owned(), Some(err)))?;
    debug!("current format: {current}");

    let requested = Format {
        width,
        height,
        fourcc,
        ..current
    };
    let actual = driver.set_format(&requested).map_err(|err| {
        rejected(
            format!("driver refused {width}x{height} {fourcc}"),
            Some(err),
        )
    })?;

    if actual.size == 0 {
        return Err(rejected(
            format!("driver reported a zero frame size for {actual}"),
            None,
        ));
    }
    if (actual.width, actual.height, actual.fourcc) != (width, height, fourcc) {
        warn!("requested {width}x{height} {fourcc}, driver chose {actual}");
    }
    debug!("negotiated format: {actual}");

    Ok(actual)
}
