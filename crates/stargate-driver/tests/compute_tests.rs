//! Compute-offload path tests

mod common;

use common::{compute_backend, CountingPlatform, FakeDma, FixedKernel};
use stargate_driver::{
    BackendParams, ComputeBackend, DeviceBackend, DeviceRegistry, DispatchError, InputKind,
    PcieBackend,
};
use stargate_wire::response;
use std::io::Write;
use std::sync::atomic::Ordering;

fn points_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn file_mode_stages_matrix_without_ids() {
    let file = points_file("id1 1.0 2.0 3.0\nid2 4.0 5.0 6.0\n");
    let mut backend = compute_backend(CountingPlatform::new(1));
    backend.enumerate(0).unwrap();

    let handle = backend.open(0).unwrap();
    handle.update(|c| c.input_path = Some(file.path().to_path_buf()));
    backend.load_input(&handle, &[]).unwrap();

    let staged = backend.staged().unwrap();
    assert_eq!((staged.rows(), staged.cols()), (2, 3));
    assert_eq!(staged.features(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    backend.unload_input();
    assert!(backend.staged().is_none());
}

#[test]
fn staged_response_layout() {
    let kernel = FixedKernel::new(vec![0, 1, 0], vec![1.0, 2.0]);
    let calls = kernel.calls.clone();
    let reg = DeviceRegistry::new(
        Box::new(ComputeBackend::new(
            Box::new(CountingPlatform::new(1)),
            Box::new(kernel),
            "Xilinx",
        )),
        Box::new(PcieBackend::new(Box::new(FakeDma::with_boards(0)))),
    );

    let file = points_file("a 0.0 0.0\nb 5.0 5.0\nc 0.1 0.0\n");
    let handle = reg.open(0).unwrap();
    handle.update(|c| c.input_path = Some(file.path().to_path_buf()));
    reg.configure(0).unwrap();

    assert_eq!(reg.write(&handle, 0, &[]).unwrap(), 3 * 2 * 4);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut buf = vec![0u8; 64];
    let n = reg.read(&handle, 0, &mut buf).unwrap();
    let values: Vec<f32> = bytemuck::pod_collect_to_vec(&buf[..n]);
    assert_eq!(values, vec![3.0, 0.0, 1.0, 0.0, 2.0, 1.0, 2.0]);

    let decoded = response::decode(&values).unwrap();
    assert_eq!(decoded.membership, vec![0, 1, 0]);
    assert_eq!(decoded.centres, vec![1.0, 2.0]);
}

#[test]
fn failed_write_leaves_no_result_to_read() {
    let reg = DeviceRegistry::new(
        Box::new(ComputeBackend::new(
            Box::new(CountingPlatform::new(1)),
            Box::new(FixedKernel::new(vec![0, 1, 0], vec![1.0, 2.0])),
            "Xilinx",
        )),
        Box::new(PcieBackend::new(Box::new(FakeDma::with_boards(0)))),
    );

    let good = points_file("a 0.0 0.0\nb 5.0 5.0\nc 0.1 0.0\n");
    let handle = reg.open(0).unwrap();
    handle.update(|c| c.input_path = Some(good.path().to_path_buf()));
    reg.configure(0).unwrap();
    reg.write(&handle, 0, &[]).unwrap();
    let mut buf = vec![0u8; 64];
    assert_eq!(reg.read(&handle, 0, &mut buf).unwrap(), 28);

    let bad = points_file("a 1 x\n");
    handle.update(|c| c.input_path = Some(bad.path().to_path_buf()));
    assert!(matches!(
        reg.write(&handle, 0, &[]),
        Err(DispatchError::InputParse { line: 1, .. })
    ));
    assert!(matches!(
        reg.read(&handle, 0, &mut buf),
        Err(DispatchError::InvalidState { .. })
    ));
}

#[test]
fn later_ids_share_the_first_queue() {
    let platform = CountingPlatform::new(2);
    let queues = platform.queues.clone();
    let kernel = FixedKernel::new(vec![0, 0], vec![1.5]);
    let calls = kernel.calls.clone();
    let reg = DeviceRegistry::new(
        Box::new(ComputeBackend::new(Box::new(platform), Box::new(kernel), "Xilinx")),
        Box::new(PcieBackend::new(Box::new(FakeDma::with_boards(0)))),
    );

    let first = reg.open(0).unwrap();
    let second = reg.open(1).unwrap();
    for handle in [&first, &second] {
        handle.update(|c| {
            c.input_kind = InputKind::Float;
            if let BackendParams::Compute(p) = &mut c.params {
                p.row_count = 2;
                p.col_count = 1;
            }
        });
    }
    reg.configure(0).unwrap();
    reg.configure(1).unwrap();
    assert_eq!(queues.load(Ordering::SeqCst), 1);

    let points = [1.0f32, 2.0];
    assert_eq!(reg.write(&second, 0, bytemuck::cast_slice(&points)).unwrap(), 8);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    reg.close(&first).unwrap();
    reg.close(&second).unwrap();
}

#[test]
fn short_read_buffer_is_rejected() {
    let reg = DeviceRegistry::new(
        Box::new(ComputeBackend::new(
            Box::new(CountingPlatform::new(1)),
            Box::new(FixedKernel::new(vec![0, 0], vec![1.0])),
            "Xilinx",
        )),
        Box::new(PcieBackend::new(Box::new(FakeDma::with_boards(0)))),
    );
    let handle = reg.open(0).unwrap();
    handle.update(|c| {
        c.input_kind = InputKind::Float;
        if let BackendParams::Compute(p) = &mut c.params {
            p.row_count = 2;
            p.col_count = 1;
        }
    });
    reg.configure(0).unwrap();

    let points = [1.0f32, 2.0];
    reg.write(&handle, 0, bytemuck::cast_slice(&points)).unwrap();

    let mut small = [0u8; 8];
    assert!(matches!(
        reg.read(&handle, 0, &mut small),
        Err(DispatchError::InvalidArgument { .. })
    ));
}

#[test]
fn read_before_write_is_invalid_state() {
    let mut backend = compute_backend(CountingPlatform::new(1));
    backend.enumerate(0).unwrap();
    let handle = backend.open(0).unwrap();
    let mut buf = [0u8; 32];
    assert!(matches!(
        backend.read(&handle, 0, &mut buf),
        Err(DispatchError::InvalidState { .. })
    ));
}

#[test]
fn software_kernel_end_to_end() {
    let platform = CountingPlatform::new(1);
    let queues = platform.queues.clone();
    let mut backend = compute_backend(platform);
    backend.enumerate(0).unwrap();

    let file = points_file(
        "1 0.0 0.0\n2 0.2 0.1\n3 0.1 0.2\n4 8.0 8.0\n5 8.1 7.9\n6 7.9 8.2\n",
    );
    let out_dir = tempfile::tempdir().unwrap();
    let out_path = out_dir.path().join("membership.txt");

    let handle = backend.open(0).unwrap();
    handle.update(|c| {
        c.input_path = Some(file.path().to_path_buf());
        c.output_path = Some(out_path.clone());
        if let BackendParams::Compute(p) = &mut c.params {
            p.min_clusters = 1;
            p.max_clusters = 3;
            p.compute_rmse = true;
        }
    });
    backend.configure(0).unwrap();
    backend.configure(0).unwrap();
    assert_eq!(queues.load(Ordering::SeqCst), 1);

    backend.write(&handle, 0, &[]).unwrap();
    let result = backend.last_result().unwrap();
    assert!(result.best_clusters >= 2);
    assert_eq!(result.membership.len(), 6);
    assert_ne!(result.membership[0], result.membership[3]);
    assert!(result.rmse.is_some());

    let written = std::fs::read_to_string(&out_path).unwrap();
    assert_eq!(written.lines().count(), 6);
}

#[test]
fn missing_input_file_is_io_error() {
    let mut backend = compute_backend(CountingPlatform::new(1));
    backend.enumerate(0).unwrap();
    let handle = backend.open(0).unwrap();
    handle.update(|c| c.input_path = Some("/nonexistent/points.txt".into()));
    backend.configure(0).unwrap();

    assert!(matches!(
        backend.write(&handle, 0, &[]),
        Err(DispatchError::Io { .. })
    ));
    assert!(backend.staged().is_none());
}

#[test]
fn close_releases_staged_data() {
    let file = points_file("x 1 1\ny 2 2\n");
    let mut backend = compute_backend(CountingPlatform::new(1));
    backend.enumerate(0).unwrap();
    let handle = backend.open(0).unwrap();
    handle.update(|c| c.input_path = Some(file.path().to_path_buf()));
    backend.load_input(&handle, &[]).unwrap();

    backend.close(&handle).unwrap();
    assert!(backend.staged().is_none());
    assert!(matches!(
        backend.load_input(&handle, &[]),
        Err(DispatchError::InvalidConfig { .. })
    ));
}
