use tracing::{debug, info, warn};

use crate::driver::{Driver, ListId, ModuleId, QueueId};
use crate::kernels::KernelLibrary;
use crate::validation::validate;
use crate::{DeviceCapability, Error};

/// Per-device bundle created once at session open.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub device: usize,
    pub module: ModuleId,
    pub queue: QueueId,
    pub list: ListId,
    pub capability: DeviceCapability,
}

/// Owns the driver and one context per device of the group.
pub struct Session<D: Driver> {
    driver: D,
    contexts: Vec<DeviceContext>,
}

impl<D: Driver> Session<D> {
    pub fn open(mut driver: D, library: &KernelLibrary) -> Result<Self, Error> {
        let device_count = driver.device_count();
        if device_count == 0 {
            return Err(Error::GpuInit("no devices in the device group".into()));
        }

        let contexts = open_contexts(&mut driver, library)?;
        Ok(Self { driver, contexts })
    }

    pub fn device_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn context(&self, device: usize) -> &DeviceContext {
        &self.contexts[device]
    }

    pub fn contexts(&self) -> &[DeviceContext] {
        &self.contexts
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Mutable driver access alongside the (immutable) contexts.
    pub fn split(&mut self) -> (&mut D, &[DeviceContext]) {
        (&mut self.driver, &self.contexts)
    }

    /// Destroys every context in reverse order and hands the driver back.
    pub fn close(mut self) -> Result<D, Error> {
        while let Some(ctx) = self.contexts.pop() {
            self.driver.destroy_list(ctx.list)?;
            self.driver.destroy_queue(ctx.queue)?;
            self.driver.destroy_module(ctx.module)?;
            debug!(device = ctx.device, "device_closed");
        }
        Ok(self.driver)
    }
}

/// Opens every device of the group; on failure the devices already opened
/// are torn down again before the error is returned.
fn open_contexts<D: Driver>(driver: &mut D, library: &KernelLibrary) -> Result<Vec<DeviceContext>, Error> {
    let device_count = driver.device_count();
    let mut contexts = Vec::with_capacity(device_count);
    for device in 0..device_count {
        match open_device(driver, device, library) {
            Ok(ctx) => contexts.push(ctx),
            Err(e) => {
                warn!(device, error = %e, "device_open_failed");
                for ctx in contexts.into_iter().rev() {
                    let _ = driver.destroy_list(ctx.list);
                    let _ = driver.destroy_queue(ctx.queue);
                    let _ = driver.destroy_module(ctx.module);
                }
                return Err(e);
            }
        }
    }
    Ok(contexts)
}

fn open_device<D: Driver>(driver: &mut D, device: usize, library: &KernelLibrary) -> Result<DeviceContext, Error> {
    let capability = driver.capability(device)?;
    validate(&capability)?;
    info!(device, name = %capability.name, "device_opened");

    let module = driver.create_module(device, library)?;
    let queue = match driver.create_queue(device) {
        Ok(queue) => queue,
        Err(e) => {
            let _ = driver.destroy_module(module);
            return Err(e);
        }
    };
    let list = match driver.create_list(device) {
        Ok(list) => list,
        Err(e) => {
            let _ = driver.destroy_queue(queue);
            let _ = driver.destroy_module(module);
            return Err(e);
        }
    };
    debug!(device, "module, queue and list created");

    Ok(DeviceContext {
        device,
        module,
        queue,
        list,
        capability,
    })
}
