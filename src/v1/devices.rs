use std::path::Path;

use oci_spec::runtime::LinuxDeviceCgroup;

use super::controller::Controller;
use crate::common::{self, default_device_rules, ControllerOpt, WrappedIoError};

pub struct Devices {}

impl Controller for Devices {
    type Error = WrappedIoError;
    type Resource = ();

    fn apply(controller_opt: &ControllerOpt, cgroup_root: &Path) -> Result<(), Self::Error> {
        tracing::debug!("Apply Devices cgroup config");

        match Self::apply_all(controller_opt, cgroup_root) {
            Ok(()) => Ok(()),
            // A rootless user's cgroup namespace typically can't write
            // devices.allow/devices.deny at all; tolerate that uniformly,
            // the same way crun's write_devices_resources does for both
            // cgroup versions.
            Err(err) if common::is_rootless() => {
                tracing::warn!("ignoring devices cgroup failure while rootless: {}", err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // always needs to be called due to default devices
    fn needs_to_handle<'a>(_controller_opt: &'a ControllerOpt) -> Option<&'a Self::Resource> {
        Some(&())
    }
}

impl Devices {
    fn apply_all(controller_opt: &ControllerOpt, cgroup_root: &Path) -> Result<(), WrappedIoError> {
        // User rules first, then the fixed default table, matching the order
        // crun writes devices.allow/devices.deny in.
        if let Some(devices) = controller_opt.resources.devices().as_ref() {
            for d in devices {
                Self::apply_device(d, cgroup_root)?;
            }
        }

        for d in default_device_rules() {
            Self::apply_device(&d, cgroup_root)?;
        }

        Ok(())
    }

    fn apply_device(device: &LinuxDeviceCgroup, cgroup_root: &Path) -> Result<(), WrappedIoError> {
        let path = if device.allow() {
            cgroup_root.join("devices.allow")
        } else {
            cgroup_root.join("devices.deny")
        };

        common::write_cgroup_file_str(path, &device.to_string())?;
        Ok(())
    }
}
