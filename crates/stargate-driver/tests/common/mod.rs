//! Test doubles for the kernel DMA device and the compute runtime

#![allow(dead_code)]

use parking_lot::Mutex;
use stargate_driver::{
    ClusterKernel, ClusterOutput, ClusterRequest, ComputeBackend, ComputeDeviceInfo,
    ComputePlatform, DeviceRegistry, DispatchError, EmulationMode, ExecutionQueue, KernelChannel,
    KernelDevice, PcieBackend, PlatformInfo, Result, SoftwareKmeans,
};
use stargate_wire::ioctl::{BoardEntry, BoardList, Transfer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters shared between a fake and the test that built it
#[derive(Debug, Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub lists: AtomicUsize,
    pub sends: AtomicUsize,
    pub recvs: AtomicUsize,
    pub resets: AtomicUsize,
    pub live_channels: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// How the fake driver answers
#[derive(Debug, Clone, Default)]
pub struct DmaBehaviour {
    /// Device file missing
    pub absent: bool,
    /// LIST status override
    pub list_status: Option<i32>,
    /// Raw `num_fpgas` override
    pub reported_count: Option<i32>,
    /// SEND/RECV status override, applied after `delay`
    pub transfer_status: Option<i32>,
    /// Time each transfer blocks
    pub delay: Option<Duration>,
}

/// Fake `/dev/riffa` with loopback memory per (board, channel)
#[derive(Debug, Clone)]
pub struct FakeDma {
    boards: Vec<BoardEntry>,
    behaviour: DmaBehaviour,
    pub counters: Arc<Counters>,
    memory: Arc<Mutex<Vec<((i32, i32), Vec<u8>)>>>,
    pub last_transfer: Arc<Mutex<Option<Transfer>>>,
}

impl FakeDma {
    pub fn with_boards(count: usize) -> Self {
        let boards = (0..count)
            .map(|i| BoardEntry {
                local_id: i32::try_from(i).unwrap(),
                name: format!("board{i}"),
                channel_count: 12,
                vendor_id: 0x10EE,
                device_id: 0x7038,
            })
            .collect();
        Self {
            boards,
            behaviour: DmaBehaviour::default(),
            counters: Arc::default(),
            memory: Arc::default(),
            last_transfer: Arc::default(),
        }
    }

    pub fn behaving(mut self, behaviour: DmaBehaviour) -> Self {
        self.behaviour = behaviour;
        self
    }
}

impl KernelDevice for FakeDma {
    fn path(&self) -> &Path {
        Path::new("/fake/riffa")
    }

    fn open(&self) -> Result<Box<dyn KernelChannel>> {
        if self.behaviour.absent {
            return Err(DispatchError::DeviceAbsent {
                path: PathBuf::from("/fake/riffa"),
            });
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.counters.live_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChannel { dma: self.clone() }))
    }
}

#[derive(Debug)]
struct FakeChannel {
    dma: FakeDma,
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        self.dma.counters.live_channels.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeChannel {
    fn transfer_override(&self) -> Option<i32> {
        if let Some(delay) = self.dma.behaviour.delay {
            std::thread::sleep(delay);
        }
        self.dma.behaviour.transfer_status
    }
}

impl KernelChannel for FakeChannel {
    fn send(&mut self, transfer: &Transfer, data: &[u8]) -> i32 {
        self.dma.counters.sends.fetch_add(1, Ordering::SeqCst);
        *self.dma.last_transfer.lock() = Some(*transfer);
        if let Some(status) = self.transfer_override() {
            return status;
        }
        let bytes = data[..transfer.words as usize * 4].to_vec();
        let key = (transfer.board, transfer.channel);
        let mut memory = self.dma.memory.lock();
        memory.retain(|(k, _)| *k != key);
        memory.push((key, bytes));
        i32::try_from(transfer.words).unwrap()
    }

    fn recv(&mut self, transfer: &Transfer, buffer: &mut [u8]) -> i32 {
        self.dma.counters.recvs.fetch_add(1, Ordering::SeqCst);
        *self.dma.last_transfer.lock() = Some(*transfer);
        if let Some(status) = self.transfer_override() {
            return status;
        }
        let key = (transfer.board, transfer.channel);
        let memory = self.dma.memory.lock();
        let Some((_, stored)) = memory.iter().find(|(k, _)| *k == key) else {
            return 0;
        };
        let n = stored.len().min(transfer.words as usize * 4);
        buffer[..n].copy_from_slice(&stored[..n]);
        i32::try_from(n / 4).unwrap()
    }

    fn reset(&mut self, board: i32) -> i32 {
        self.dma.counters.resets.fetch_add(1, Ordering::SeqCst);
        self.dma.memory.lock().retain(|((b, _), _)| *b != board);
        0
    }

    fn list(&mut self, list: &mut BoardList) -> i32 {
        self.dma.counters.lists.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.dma.behaviour.list_status {
            return status;
        }
        for (i, board) in self.dma.boards.iter().enumerate() {
            list.set_entry(i, board);
        }
        list.num_fpgas = self
            .dma
            .behaviour
            .reported_count
            .unwrap_or_else(|| i32::try_from(self.dma.boards.len()).unwrap());
        0
    }
}

/// Compute runtime with `count` devices that counts discovery calls
#[derive(Debug, Clone)]
pub struct CountingPlatform {
    count: usize,
    fail_platforms: bool,
    pub platform_queries: Arc<AtomicUsize>,
    pub queues: Arc<AtomicUsize>,
}

impl CountingPlatform {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            fail_platforms: false,
            platform_queries: Arc::default(),
            queues: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_platforms: true,
            ..Self::new(0)
        }
    }
}

impl ComputePlatform for CountingPlatform {
    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        self.platform_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_platforms {
            return Err(DispatchError::enumeration_failure(
                stargate_driver::BackendKind::Compute,
                "platform query returned -1001",
            ));
        }
        // a second vendor that must be filtered out
        Ok(vec![
            PlatformInfo {
                name: "Other Vendor".into(),
                version: "3.0".into(),
            },
            PlatformInfo {
                name: "Xilinx".into(),
                version: "2.1".into(),
            },
        ])
    }

    fn devices(&self, platform: &PlatformInfo) -> Result<Vec<ComputeDeviceInfo>> {
        if platform.name != "Xilinx" {
            return Ok(vec![ComputeDeviceInfo {
                name: "not-ours".into(),
                frequency_mhz: 1,
                global_memory_bytes: 1,
                vendor_id: 1,
            }]);
        }
        Ok((0..self.count)
            .map(|i| ComputeDeviceInfo {
                name: format!("xilinx_u200_{i}"),
                frequency_mhz: 300,
                global_memory_bytes: 64 << 30,
                vendor_id: 0x10EE,
            })
            .collect())
    }

    fn create_queue(&mut self, device: &ComputeDeviceInfo) -> Result<ExecutionQueue> {
        self.queues.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionQueue {
            device: device.name.clone(),
            mode: EmulationMode::Hardware,
        })
    }
}

/// Kernel returning a fixed result
#[derive(Debug, Clone)]
pub struct FixedKernel {
    pub output: ClusterOutput,
    pub calls: Arc<AtomicUsize>,
}

impl FixedKernel {
    pub fn new(membership: Vec<i32>, centres: Vec<f32>) -> Self {
        Self {
            output: ClusterOutput {
                membership,
                best_clusters: 1,
                centres,
                rmse: None,
            },
            calls: Arc::default(),
        }
    }
}

impl ClusterKernel for FixedKernel {
    fn cluster(&mut self, _request: &ClusterRequest<'_>) -> std::result::Result<ClusterOutput, i32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

pub fn compute_backend(platform: CountingPlatform) -> ComputeBackend {
    ComputeBackend::new(Box::new(platform), Box::new(SoftwareKmeans::new()), "Xilinx")
}

pub fn registry(platform: CountingPlatform, dma: FakeDma) -> DeviceRegistry {
    DeviceRegistry::new(
        Box::new(compute_backend(platform)),
        Box::new(PcieBackend::new(Box::new(dma))),
    )
}
