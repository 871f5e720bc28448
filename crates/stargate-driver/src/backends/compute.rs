//! Compute-offload backend
//!
//! Discovers accelerators through a [`ComputePlatform`], selects one when a
//! config is first applied, and runs the clustering kernel on staged input.
//!
//! Writing to a compute device stages the input and runs the kernel in one
//! step; reading returns the staged response:
//!
//! ```text
//! [N][membership_0 .. membership_N-1][K*F][centre_0 .. centre_K*F-1]
//! ```
//!
//! every element an `f32`. Failing to create the execution queue is fatal:
//! the backend refuses all later work with `BackendInit`.

use crate::backend::{BackendKind, DeviceBackend, RegistrationState};
use crate::compute::platform::probe_pci;
use crate::compute::{
    ClusterKernel, ClusterOutput, ClusterRequest, ComputeDeviceInfo, ComputePlatform,
    ExecutionQueue, StagedInput,
};
use crate::device::{
    ComputeParams, ConfigHandle, ConfigTable, DeviceConfig, DeviceDescriptor, DeviceId, InputKind,
};
use crate::error::{DispatchError, Result};
use stargate_wire::response;
use tracing::{debug, info, warn};

/// Compute-offload backend
#[derive(Debug)]
pub struct ComputeBackend {
    platform: Box<dyn ComputePlatform>,
    kernel: Box<dyn ClusterKernel>,
    vendor: String,
    probe_pattern: Option<String>,
    defaults: ComputeParams,
    state: RegistrationState,
    device_offset: usize,
    descriptors: Vec<DeviceDescriptor>,
    devices: Vec<ComputeDeviceInfo>,
    configs: ConfigTable,
    queue: Option<ExecutionQueue>,
    /// Set once queue creation fails; never cleared
    init_failure: Option<String>,
    staged: Option<StagedInput>,
    result: Option<ClusterOutput>,
}

impl ComputeBackend {
    /// Backend matching platforms named `vendor`
    pub fn new(
        platform: Box<dyn ComputePlatform>,
        kernel: Box<dyn ClusterKernel>,
        vendor: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            kernel,
            vendor: vendor.into(),
            probe_pattern: None,
            defaults: ComputeParams::default(),
            state: RegistrationState::NotRegistered,
            device_offset: 0,
            descriptors: Vec::new(),
            devices: Vec::new(),
            configs: ConfigTable::default(),
            queue: None,
            init_failure: None,
            staged: None,
            result: None,
        }
    }

    /// Require an `lspci` line containing `pattern` before enumerating
    #[must_use]
    pub fn with_probe(mut self, pattern: impl Into<String>) -> Self {
        self.probe_pattern = Some(pattern.into());
        self
    }

    /// Parameters given to newly opened configs
    #[must_use]
    pub fn with_defaults(mut self, defaults: ComputeParams) -> Self {
        self.defaults = defaults;
        self
    }

    /// Queue of the selected device, once one is selected
    #[must_use]
    pub const fn queue(&self) -> Option<&ExecutionQueue> {
        self.queue.as_ref()
    }

    /// Currently staged input
    #[must_use]
    pub const fn staged(&self) -> Option<&StagedInput> {
        self.staged.as_ref()
    }

    /// Output of the last successful kernel run
    #[must_use]
    pub const fn last_result(&self) -> Option<&ClusterOutput> {
        self.result.as_ref()
    }

    /// Whether queue creation failed and the backend is unusable
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.init_failure.is_some()
    }

    /// Stage input for `config` from `data` or from its input file
    ///
    /// Drops any previously staged input and the last result first, so a
    /// failed load leaves nothing to read.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a stale handle or a file-mode config
    /// without an input path, `InputParse` or `Io` for an unreadable file,
    /// and `InvalidArgument` for a raw buffer that does not match its shape.
    pub fn load_input(&mut self, config: &ConfigHandle, data: &[u8]) -> Result<()> {
        let (_, snapshot) = self.resolve(config)?;
        let params = compute_params(&snapshot)?;
        self.unload_input();

        let staged = match snapshot.input_kind {
            InputKind::File => {
                let path = snapshot.input_path.as_deref().ok_or_else(|| {
                    DispatchError::invalid_config(snapshot.id(), "file input without input_path")
                })?;
                StagedInput::from_file(path)?
            }
            InputKind::Float => {
                StagedInput::from_f32_bytes(data, params.row_count, params.col_count)?
            }
            InputKind::Int => StagedInput::from_i32_bytes(data, params.row_count, params.col_count)?,
        };

        debug!(
            "Staged {}x{} input for id {}",
            staged.rows(),
            staged.cols(),
            snapshot.id()
        );
        self.staged = Some(staged);
        Ok(())
    }

    /// Run the clustering kernel on the staged input
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if nothing is staged or no device is selected,
    /// `BackendInit` if the backend has failed, or `KernelExecutionFailure`
    /// with the kernel's status.
    pub fn run_kernel(&mut self, config: &ConfigHandle) -> Result<()> {
        let (_, snapshot) = self.resolve(config)?;
        let params = compute_params(&snapshot)?;
        self.ensure_usable()?;
        if self.queue.is_none() {
            return Err(DispatchError::invalid_state(
                "no compute device selected; configure first",
            ));
        }
        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| DispatchError::invalid_state("no input staged"))?;

        let request = ClusterRequest {
            features: staged.features(),
            points: staged.rows(),
            features_per_point: staged.cols(),
            min_clusters: params.min_clusters,
            max_clusters: params.max_clusters,
            threshold: params.threshold,
            loops: params.loops,
            compute_rmse: params.compute_rmse,
            output_path: snapshot.output_path.as_deref(),
            bit_image: &params.bit_image_path,
        };

        info!(
            "Running kernel on {}x{} (k {}..={}, threshold {})",
            request.points,
            request.features_per_point,
            request.min_clusters,
            request.max_clusters,
            request.threshold
        );
        match self.kernel.cluster(&request) {
            Ok(output) => {
                debug!(
                    "Kernel done: k={} rmse={:?}",
                    output.best_clusters, output.rmse
                );
                self.result = Some(output);
                Ok(())
            }
            Err(status) => {
                warn!("Kernel failed with status {status}");
                Err(DispatchError::KernelExecutionFailure { status })
            }
        }
    }

    /// Release the staged input and membership
    pub fn unload_input(&mut self) {
        if self.staged.take().is_some() {
            debug!("Staged input released");
        }
        self.result = None;
    }

    fn key(&self, id: DeviceId) -> Option<usize> {
        id.checked_sub(self.device_offset)
            .filter(|&key| key < self.descriptors.len())
    }

    fn resolve(&self, handle: &ConfigHandle) -> Result<(usize, DeviceConfig)> {
        if handle.kind() != BackendKind::Compute {
            return Err(DispatchError::invalid_config(
                handle.id(),
                format!("{} config given to the compute backend", handle.kind()),
            ));
        }
        let key = self
            .key(handle.id())
            .ok_or_else(|| DispatchError::invalid_config(handle.id(), "device not open"))?;
        self.configs.resolve(key, handle)?;
        let config = handle.snapshot();
        config.check_kind()?;
        Ok((key, config))
    }

    fn ensure_usable(&self) -> Result<()> {
        match &self.init_failure {
            Some(reason) => Err(DispatchError::backend_init(reason.clone())),
            None => Ok(()),
        }
    }

    /// Create the context and queue on device `key`
    ///
    /// Runs once, for the first id configured. Every other compute id then
    /// submits to this queue.
    fn select_device(&mut self, key: usize) -> Result<()> {
        self.ensure_usable()?;
        let device = &self.devices[key];
        match self.platform.create_queue(device) {
            Ok(queue) => {
                info!("Selected compute device {} ({})", device.name, queue.mode.as_str());
                self.queue = Some(queue);
                Ok(())
            }
            Err(e) => {
                let reason = format!("queue creation on {} failed: {e}", device.name);
                warn!("{reason}; compute backend disabled");
                self.init_failure = Some(reason.clone());
                Err(DispatchError::backend_init(reason))
            }
        }
    }

    fn discover(&mut self) -> Result<()> {
        if let Some(pattern) = &self.probe_pattern {
            if !probe_pci(pattern)? {
                info!("No board matching '{pattern}', skipping compute discovery");
                return Ok(());
            }
        }

        let platforms = self.platform.platforms()?;
        for platform in platforms.iter().filter(|p| p.name == self.vendor) {
            debug!("Platform {} {}", platform.name, platform.version);
            self.devices.extend(self.platform.devices(platform)?);
        }

        self.descriptors = self
            .devices
            .iter()
            .enumerate()
            .map(|(index, device)| DeviceDescriptor {
                id: self.device_offset + index,
                backend: BackendKind::Compute,
                name: device.name.clone(),
                channel_count: 1,
                vendor_id: device.vendor_id,
                device_id: 0,
                frequency_mhz: device.frequency_mhz,
                global_memory_bytes: device.global_memory_bytes,
            })
            .collect();
        Ok(())
    }
}

fn compute_params(config: &DeviceConfig) -> Result<&ComputeParams> {
    config
        .compute_params()
        .ok_or_else(|| DispatchError::invalid_config(config.id(), "missing compute parameters"))
}

fn validate(config: &DeviceConfig) -> Result<()> {
    let params = compute_params(config)?;
    let reject = |reason: String| Err(DispatchError::invalid_config(config.id(), reason));

    if params.min_clusters == 0 || params.min_clusters > params.max_clusters {
        return reject(format!(
            "cluster range {}..={} is empty",
            params.min_clusters, params.max_clusters
        ));
    }
    if !params.threshold.is_finite() || params.threshold <= 0.0 {
        return reject(format!("threshold {} must be positive", params.threshold));
    }
    if params.loops == 0 {
        return reject("loops must be at least 1".into());
    }
    match config.input_kind {
        InputKind::File if config.input_path.is_none() => {
            reject("file input without input_path".into())
        }
        InputKind::Float | InputKind::Int if params.row_count == 0 || params.col_count == 0 => {
            reject(format!(
                "raw input needs rows and columns, got {}x{}",
                params.row_count, params.col_count
            ))
        }
        _ => Ok(()),
    }
}

impl DeviceBackend for ComputeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Compute
    }

    fn enumerate(&mut self, id_offset: usize) -> Result<Vec<DeviceDescriptor>> {
        if self.state.is_registered() {
            return Ok(self.descriptors.clone());
        }
        self.state = RegistrationState::Registered;
        self.device_offset = id_offset;

        if let Err(e) = self.discover() {
            self.devices.clear();
            self.descriptors.clear();
            return Err(e);
        }

        info!(
            "Compute backend: {} '{}' device(s)",
            self.descriptors.len(),
            self.vendor
        );
        Ok(self.descriptors.clone())
    }

    fn device_count(&self) -> usize {
        self.descriptors.len()
    }

    fn registration(&self) -> RegistrationState {
        self.state
    }

    fn open(&mut self, id: DeviceId) -> Result<ConfigHandle> {
        self.ensure_usable()?;
        let key = self.key(id).ok_or(DispatchError::UnknownDevice {
            id,
            count: self.device_offset + self.descriptors.len(),
        })?;
        let defaults = &self.defaults;
        Ok(self
            .configs
            .open_or_insert(key, || DeviceConfig::compute(id, defaults.clone())))
    }

    fn configure(&mut self, id: DeviceId) -> Result<()> {
        let key = self
            .key(id)
            .ok_or_else(|| DispatchError::invalid_config(id, "device not open"))?;
        let config = self
            .configs
            .get(key)
            .ok_or_else(|| DispatchError::invalid_config(id, "device not open"))?
            .snapshot();
        config.check_kind()?;
        validate(&config)?;

        match &self.queue {
            None => self.select_device(key)?,
            Some(queue) => {
                self.ensure_usable()?;
                if queue.device != self.devices[key].name {
                    debug!(
                        "Compute id {id} reuses the queue on {}, not {}",
                        queue.device, self.devices[key].name
                    );
                }
            }
        }
        debug!("Configured compute id {id}");
        Ok(())
    }

    fn write(&mut self, config: &ConfigHandle, channel: u32, data: &[u8]) -> Result<usize> {
        self.resolve(config)?;
        self.ensure_usable()?;
        if self.queue.is_none() {
            return Err(DispatchError::invalid_state(
                "no compute device selected; configure first",
            ));
        }
        if channel != 0 {
            debug!("Compute write ignores channel {channel}");
        }

        self.load_input(config, data)?;
        if let Err(e) = self.run_kernel(config) {
            self.unload_input();
            return Err(e);
        }
        Ok(self.staged.as_ref().map_or(0, StagedInput::byte_len))
    }

    fn read(&mut self, config: &ConfigHandle, _channel: u32, buffer: &mut [u8]) -> Result<usize> {
        self.resolve(config)?;
        let output = self
            .result
            .as_ref()
            .ok_or_else(|| DispatchError::invalid_state("no kernel result to read"))?;

        let encoded = response::encode(&output.membership, &output.centres)
            .map_err(|e| DispatchError::invalid_state(format!("cannot stage response: {e}")))?;
        let bytes: &[u8] = bytemuck::cast_slice(&encoded);
        if buffer.len() < bytes.len() {
            return Err(DispatchError::invalid_argument(format!(
                "response needs {} bytes, buffer holds {}",
                bytes.len(),
                buffer.len()
            )));
        }
        buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn reset(&mut self, config: &ConfigHandle) -> Result<()> {
        self.resolve(config)?;
        self.unload_input();
        info!("Reset compute id {}", config.id());
        Ok(())
    }

    fn close(&mut self, config: &ConfigHandle) -> Result<()> {
        let removed = self
            .key(config.id())
            .is_some_and(|key| self.configs.remove(key, config));
        if removed {
            debug!("Closed compute config for id {}", config.id());
            if self.configs.is_empty() {
                self.unload_input();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{PlatformInfo, SoftwareKmeans, SoftwarePlatform};
    use crate::config::EmulationMode;

    #[derive(Debug)]
    struct NoQueue;

    impl ComputePlatform for NoQueue {
        fn platforms(&self) -> Result<Vec<PlatformInfo>> {
            Ok(vec![PlatformInfo {
                name: "Xilinx".into(),
                version: "test".into(),
            }])
        }

        fn devices(&self, _platform: &PlatformInfo) -> Result<Vec<ComputeDeviceInfo>> {
            Ok(vec![ComputeDeviceInfo {
                name: "xcvu9p".into(),
                frequency_mhz: 300,
                global_memory_bytes: 64 << 30,
                vendor_id: 0x10EE,
            }])
        }

        fn create_queue(&mut self, _device: &ComputeDeviceInfo) -> Result<ExecutionQueue> {
            Err(DispatchError::backend_init("context refused"))
        }
    }

    fn software() -> ComputeBackend {
        ComputeBackend::new(
            Box::new(SoftwarePlatform::new("Xilinx", EmulationMode::SoftwareEmulation)),
            Box::new(SoftwareKmeans::new()),
            "Xilinx",
        )
    }

    fn raw_config(backend: &mut ComputeBackend) -> ConfigHandle {
        let handle = backend.open(0).unwrap();
        handle.update(|c| {
            c.input_kind = InputKind::Float;
            if let crate::device::BackendParams::Compute(p) = &mut c.params {
                p.row_count = 4;
                p.col_count = 1;
                p.min_clusters = 2;
                p.max_clusters = 2;
            }
        });
        handle
    }

    #[test]
    fn vendor_filter_applies() {
        let mut backend = ComputeBackend::new(
            Box::new(SoftwarePlatform::new("Xilinx", EmulationMode::Hardware)),
            Box::new(SoftwareKmeans::new()),
            "Intel(R) FPGA SDK",
        );
        assert!(backend.enumerate(0).unwrap().is_empty());
        assert!(matches!(
            backend.open(0),
            Err(DispatchError::UnknownDevice { id: 0, count: 0 })
        ));
    }

    #[test]
    fn write_runs_kernel_and_read_stages_response() {
        let mut backend = software();
        backend.enumerate(0).unwrap();
        let handle = raw_config(&mut backend);
        backend.configure(0).unwrap();

        let points = [0.0f32, 0.1, 9.9, 10.0];
        let written = backend
            .write(&handle, 0, bytemuck::cast_slice(&points))
            .unwrap();
        assert_eq!(written, 16);

        let mut buf = vec![0u8; 64];
        let n = backend.read(&handle, 0, &mut buf).unwrap();
        assert_eq!(n, (2 + 4 + 2) * 4);
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(&buf[..n]);
        let decoded = response::decode(&values).unwrap();
        assert_eq!(decoded.membership.len(), 4);
        assert_eq!(decoded.membership[0], decoded.membership[1]);
        assert_ne!(decoded.membership[0], decoded.membership[3]);
        assert_eq!(decoded.centres.len(), 2);
    }

    #[test]
    fn write_before_configure_is_invalid_state() {
        let mut backend = software();
        backend.enumerate(0).unwrap();
        let handle = raw_config(&mut backend);
        assert!(matches!(
            backend.write(&handle, 0, &[0; 16]),
            Err(DispatchError::InvalidState { .. })
        ));
    }

    #[test]
    fn kernel_failure_releases_staged_input() {
        let mut backend = software();
        backend.enumerate(0).unwrap();
        let handle = raw_config(&mut backend);
        backend.configure(0).unwrap();
        // 4 points cannot hold 5 clusters
        handle.update(|c| {
            if let crate::device::BackendParams::Compute(p) = &mut c.params {
                p.min_clusters = 5;
                p.max_clusters = 5;
            }
        });

        let err = backend.write(&handle, 0, &[0; 16]).unwrap_err();
        assert!(matches!(err, DispatchError::KernelExecutionFailure { .. }));
        assert!(backend.staged().is_none());
        assert!(backend.last_result().is_none());
    }

    #[test]
    fn queue_failure_is_fatal() {
        let mut backend =
            ComputeBackend::new(Box::new(NoQueue), Box::new(SoftwareKmeans::new()), "Xilinx");
        assert_eq!(backend.enumerate(0).unwrap().len(), 1);
        let handle = raw_config(&mut backend);

        let err = backend.configure(0).unwrap_err();
        assert!(err.is_fatal());
        assert!(backend.is_failed());

        assert!(backend.configure(0).unwrap_err().is_fatal());
        assert!(backend.write(&handle, 0, &[0; 16]).unwrap_err().is_fatal());
        assert!(backend.open(0).unwrap_err().is_fatal());
    }

    #[test]
    fn invalid_params_are_rejected_at_configure() {
        let mut backend = software();
        backend.enumerate(0).unwrap();
        let handle = backend.open(0).unwrap();
        // file mode without a path
        assert!(matches!(
            backend.configure(0),
            Err(DispatchError::InvalidConfig { id: 0, .. })
        ));

        handle.update(|c| {
            c.input_path = Some("points.txt".into());
            if let crate::device::BackendParams::Compute(p) = &mut c.params {
                p.threshold = f32::NAN;
            }
        });
        assert!(backend.configure(0).is_err());
        assert!(backend.queue().is_none());
    }
}
