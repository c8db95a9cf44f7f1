use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc};
use tracing::debug;

use aperture_device::CameraDevice;

use crate::{
    session::CaptureSession,
    sink::FrameSink,
    tunables::SessionTunables,
};

/// A device id unavailable because another session holds it.
#[derive(Debug, thiserror::Error)]
#[error("device {0} already has an open session")]
pub struct DeviceBusy(pub String);

/// Tracks which device ids have open sessions.
///
/// Opening through a registry gives each process-local device id at most one
/// live session; the claim is returned to the registry when the session is
/// dropped, not just when it is stopped.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use aperture::prelude::*;
///
/// let registry = DeviceRegistry::default();
/// let (device, _handle) = VirtualDevice::with_defaults();
/// let session = registry
///     .open(Box::new(device), Arc::new(NullSink))
///     .unwrap();
/// let (second, _handle) = VirtualDevice::with_defaults();
/// assert!(registry.open(Box::new(second), Arc::new(NullSink)).is_err());
/// drop(session);
/// ```
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl DeviceRegistry {
    /// Open a session for `device`, claiming its id.
    pub fn open(
        &self,
        device: Box<dyn CameraDevice>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<CaptureSession, DeviceBusy> {
        self.open_with_tunables(device, sink, SessionTunables::default())
    }

    /// Open a session with explicit tunables.
    pub fn open_with_tunables(
        &self,
        device: Box<dyn CameraDevice>,
        sink: Arc<dyn FrameSink>,
        tunables: SessionTunables,
    ) -> Result<CaptureSession, DeviceBusy> {
        let id = device.descriptor().id.clone();
        if !self.active.lock().insert(id.clone()) {
            return Err(DeviceBusy(id));
        }
        debug!(device = %id, "session claim taken");
        let claim = RegistryClaim {
            id,
            active: self.active.clone(),
        };
        let mut session = CaptureSession::with_tunables(device, sink, tunables);
        session.attach_claim(claim);
        Ok(session)
    }

    /// Device ids with open sessions, for diagnostics.
    pub fn active_ids(&self) -> Vec<String> {
        self.active.lock().iter().cloned().collect()
    }
}

/// Releases the registry slot when its session is dropped.
pub(crate) struct RegistryClaim {
    id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RegistryClaim {
    fn drop(&mut self) {
        self.active.lock().remove(&self.id);
        debug!(device = %self.id, "session claim released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;
    use aperture_device::virtual_device::VirtualDevice;

    #[test]
    fn second_open_for_same_id_is_refused() {
        let registry = DeviceRegistry::default();
        let (first, _h1) = VirtualDevice::with_defaults();
        let (second, _h2) = VirtualDevice::with_defaults();
        let session = registry.open(Box::new(first), Arc::new(NullSink)).unwrap();
        let err = registry
            .open(Box::new(second), Arc::new(NullSink))
            .unwrap_err();
        assert_eq!(err.0, "virtual0");
        drop(session);
        let (third, _h3) = VirtualDevice::with_defaults();
        assert!(registry.open(Box::new(third), Arc::new(NullSink)).is_ok());
    }

    #[test]
    fn active_ids_reflects_claims() {
        let registry = DeviceRegistry::default();
        let (device, _handle) = VirtualDevice::with_defaults();
        let session = registry.open(Box::new(device), Arc::new(NullSink)).unwrap();
        assert_eq!(registry.active_ids(), vec!["virtual0".to_string()]);
        drop(session);
        assert!(registry.active_ids().is_empty());
    }
}
