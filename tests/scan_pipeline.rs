//! End-to-end pipeline tests against the host reference backend: submit
//! sealed chunks, drive the device path, drain completions, and check the
//! fallback, backpressure, error-priority and abort behaviors the scan
//! loop depends on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gpu_scan::chunk::layout::header_from_bytes;
use gpu_scan::chunk::record::encode_record;
use gpu_scan::chunk::{ChunkStore, PageBuilder, RecordDescriptor, SharedChunk, StoragePage, TypeTag, Value};
use gpu_scan::device::protocol::STATUS_KERNEL_FAULT;
use gpu_scan::device::{DeviceRuntime, HostDevice, HostDeviceConfig, KernelCtx};
use gpu_scan::exec::{
    CompareOp, FilterKernel, FilterSpec, PipelineConfig, Projection, RecordSource, ScanKernels,
    ScanPipeline, SubmitOutcome, TableScan,
};
use gpu_scan::{RecoveryAction, ScanError};

fn desc() -> RecordDescriptor {
    RecordDescriptor::new(vec![
        ("id", TypeTag::Int64),
        ("score", TypeTag::Float64),
        ("name", TypeTag::Bytes),
    ])
}

fn row(i: i64) -> Vec<Value> {
    vec![
        Value::Int64(i),
        Value::Float64(i as f64 * 0.5),
        Value::Bytes(format!("row-{i}").into_bytes()),
    ]
}

fn source_chunk(n: i64) -> SharedChunk {
    let mut chunk = ChunkStore::create_row(&desc(), 1 << 16).unwrap();
    for i in 0..n {
        assert!(chunk.insert_values(i as u32, &row(i)).unwrap());
    }
    Arc::new(chunk)
}

fn default_pipeline(kernels: ScanKernels, config: PipelineConfig) -> (Arc<HostDevice>, ScanPipeline) {
    let device = Arc::new(HostDevice::with_default_kernels(HostDeviceConfig::default()));
    let pipeline =
        ScanPipeline::new(Arc::clone(&device) as Arc<dyn DeviceRuntime>, desc(), kernels, config)
            .unwrap();
    (device, pipeline)
}

fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ============================================================================
// Device path
// ============================================================================

#[test]
fn test_filter_scan_end_to_end() {
    let (_device, pipeline) = default_pipeline(
        ScanKernels::with_filter(FilterSpec::int(0, CompareOp::Ge, 90)),
        PipelineConfig::default(),
    );
    let src = source_chunk(100);
    let SubmitOutcome::Accepted(id) = pipeline.submit(Arc::clone(&src)).unwrap() else {
        panic!("default capacity must accept one chunk");
    };

    let out = pipeline.wait_completed().unwrap().unwrap();
    assert_eq!(out.task_id(), id);
    assert!(!out.used_fallback(), "integer predicate runs on the device");
    assert_eq!(out.row_count(), 10, "ids 90..99 pass");
    for i in 0..out.row_count() {
        let values = out.fetch(i).unwrap().values();
        assert_eq!(values[0], Value::Int64(90 + i as i64), "device keeps source order");
    }
}

#[test]
fn test_row_projection_end_to_end() {
    let (_device, pipeline) = default_pipeline(
        ScanKernels::with_filter(FilterSpec::int(0, CompareOp::Lt, 4))
            .and_projection(Projection::row(vec![2, 0])),
        PipelineConfig::default(),
    );
    pipeline.submit(source_chunk(50)).unwrap();

    let out = pipeline.wait_completed().unwrap().unwrap();
    assert_eq!(out.row_count(), 4);
    for i in 0..4i64 {
        assert_eq!(
            out.fetch(i as usize).unwrap().values(),
            vec![Value::Bytes(format!("row-{i}").into_bytes()), Value::Int64(i)],
            "projected record {i} reorders columns"
        );
    }
}

#[test]
fn test_slot_projection_end_to_end() {
    let (_device, pipeline) = default_pipeline(
        ScanKernels::passthrough().and_projection(Projection::slot(vec![0, 1])),
        PipelineConfig::default(),
    );
    pipeline.submit(source_chunk(16)).unwrap();

    let out = pipeline.wait_completed().unwrap().unwrap();
    assert_eq!(out.row_count(), 16, "no filter keeps every record");
    assert!(!out.used_fallback());
    for i in 0..16i64 {
        let values = out.fetch(i as usize).unwrap().values();
        assert_eq!(values, vec![Value::Int64(i), Value::Float64(i as f64 * 0.5)]);
    }
}

#[test]
fn test_timings_recorded_on_device_path() {
    let (_device, pipeline) =
        default_pipeline(ScanKernels::passthrough(), PipelineConfig::default());
    pipeline.submit(source_chunk(100)).unwrap();
    let out = pipeline.wait_completed().unwrap().unwrap();
    let t = out.timings();
    // Upload moves the whole chunk image; the timer pair must have closed.
    assert!(t.upload > Duration::ZERO, "upload group was timed");
}

// ============================================================================
// Fallback
// ============================================================================

#[test]
fn test_fallback_fidelity_matches_host_oracle() {
    // Float predicate: the device reports cpu-recheck, the host recomputes.
    let spec = FilterSpec::float(1, CompareOp::Ge, 10.0);
    let (_device, pipeline) = default_pipeline(
        ScanKernels::with_filter(spec.clone()),
        PipelineConfig::default(),
    );
    let src = source_chunk(60);
    pipeline.submit(Arc::clone(&src)).unwrap();

    let out = pipeline.wait_completed().unwrap().unwrap();
    assert!(out.used_fallback(), "float predicate must fall back");

    // Oracle: evaluate the same predicate purely on the host from the start.
    let mut expected = Vec::new();
    for i in 0..src.record_count() {
        let view = src.fetch_row(i).unwrap();
        if spec.matches(&view) {
            expected.push(view.values()[0].clone());
        }
    }
    assert_eq!(out.row_count(), expected.len(), "same visible-row count");
    for (i, want) in expected.iter().enumerate() {
        assert_eq!(&out.fetch(i).unwrap().values()[0], want, "same visible-row set and order");
    }
}

#[test]
fn test_slot_side_buffer_exhaustion_falls_back() {
    // Zero side-buffer reserve: the slot projection kernel runs out of room
    // for the Bytes column and reports destination-no-space.
    let config = PipelineConfig { slot_side_per_record: 0, ..Default::default() };
    let (_device, pipeline) = default_pipeline(
        ScanKernels::passthrough().and_projection(Projection::slot(vec![0, 2])),
        config,
    );
    pipeline.submit(source_chunk(10)).unwrap();

    let out = pipeline.wait_completed().unwrap().unwrap();
    assert!(out.used_fallback(), "destination exhaustion is recoverable");
    assert_eq!(out.row_count(), 10);
    for i in 0..10i64 {
        let values = out.fetch(i as usize).unwrap().values();
        assert_eq!(values[0], Value::Int64(i));
        assert_eq!(values[1], Value::Bytes(format!("row-{i}").into_bytes()));
    }
}

#[test]
fn test_fallback_disabled_surfaces_recoverable_error() {
    let config = PipelineConfig { cpu_fallback: false, ..Default::default() };
    let (_device, pipeline) = default_pipeline(
        ScanKernels::with_filter(FilterSpec::float(1, CompareOp::Gt, 1.0)),
        config,
    );
    pipeline.submit(source_chunk(10)).unwrap();

    let err = pipeline.wait_completed().unwrap().unwrap_err();
    assert!(
        matches!(err, ScanError::DeviceRecoverable { .. }),
        "with fallback disabled the device condition surfaces: {err}"
    );
    assert_eq!(err.recovery_action(), RecoveryAction::FallbackToCpu);
}

// ============================================================================
// Backpressure, errors, abort
// ============================================================================

#[test]
fn test_memory_pressure_returns_chunk_for_retry() {
    let device = Arc::new(HostDevice::with_default_kernels(HostDeviceConfig {
        memory_capacity: 16 * 1024,
        ..Default::default()
    }));
    let pipeline = ScanPipeline::new(
        Arc::clone(&device) as Arc<dyn DeviceRuntime>,
        desc(),
        ScanKernels::passthrough(),
        PipelineConfig::default(),
    )
    .unwrap();

    let src = source_chunk(100); // 64KB image, far over the 16KB arena
    match pipeline.submit(Arc::clone(&src)).unwrap() {
        SubmitOutcome::RetryLater(returned) => {
            assert!(Arc::ptr_eq(&returned, &src), "the same chunk comes back");
        }
        SubmitOutcome::Accepted(_) => panic!("reservation must fail under pressure"),
    }
    assert_eq!(device.mem_in_use(), 0, "failed reservation leaves nothing behind");
    assert_eq!(pipeline.in_flight(), 0, "nothing was enqueued");
}

#[test]
fn test_failed_task_drains_before_earlier_successes() {
    let device = Arc::new(HostDevice::with_default_kernels(HostDeviceConfig::default()));
    // Kernel that faults only on single-record chunks, so one submission
    // stream can mix successes and a failure.
    device.register_kernel(
        "flaky_filter",
        Arc::new(|ctx: &mut KernelCtx<'_>| {
            if header_from_bytes(ctx.src).nitems == 1 {
                STATUS_KERNEL_FAULT
            } else {
                gpu_scan::device::protocol::STATUS_SUCCESS
            }
        }),
    );
    let kernels = ScanKernels {
        filter: Some(FilterKernel {
            symbol: "flaky_filter".into(),
            spec: FilterSpec::int(0, CompareOp::Ge, 0),
        }),
        projection: None,
    };
    let pipeline = ScanPipeline::new(
        Arc::clone(&device) as Arc<dyn DeviceRuntime>,
        desc(),
        kernels,
        PipelineConfig::default(),
    )
    .unwrap();

    pipeline.submit(source_chunk(3)).unwrap();
    pipeline.submit(source_chunk(4)).unwrap();
    pipeline.submit(source_chunk(1)).unwrap();
    wait_until(|| pipeline.in_flight() == 0, "all tasks to complete");

    // The failure was pushed to the front of the completed list.
    let first = pipeline.drain_completed().unwrap();
    let err = first.expect_err("the failed task must drain first");
    assert!(matches!(
        err,
        ScanError::DeviceFatal { code: STATUS_KERNEL_FAULT, .. }
    ));

    // The successes follow, still in completion order.
    assert!(pipeline.drain_completed().unwrap().is_ok());
    assert!(pipeline.drain_completed().unwrap().is_ok());
    assert!(pipeline.drain_completed().is_none());
    assert_eq!(device.mem_in_use(), 0, "every exit path released its reservation");
}

#[test]
fn test_abort_releases_all_device_memory() {
    let (device, pipeline) =
        default_pipeline(ScanKernels::passthrough(), PipelineConfig::default());
    for _ in 0..4 {
        pipeline.submit(source_chunk(50)).unwrap();
    }
    pipeline.abort();
    assert!(pipeline.submit(source_chunk(1)).is_err(), "aborted pipeline refuses work");
    assert!(pipeline.drain_completed().is_none(), "no results after abort");
    assert!(pipeline.wait_completed().is_none(), "waiters observe the abort");

    // Callbacks that raced the abort free their own reservations; either
    // way the arena must drain to zero.
    wait_until(|| device.mem_in_use() == 0, "device memory release after abort");
}

#[test]
fn test_drop_without_drain_releases_device_memory() {
    let (device, pipeline) =
        default_pipeline(ScanKernels::passthrough(), PipelineConfig::default());
    for _ in 0..3 {
        pipeline.submit(source_chunk(20)).unwrap();
    }
    drop(pipeline);
    wait_until(|| device.mem_in_use() == 0, "device memory release on drop");
}

#[test]
fn test_source_references_balance_across_pipeline() {
    let (_device, pipeline) =
        default_pipeline(ScanKernels::passthrough(), PipelineConfig::default());
    let src = source_chunk(5);
    pipeline.submit(Arc::clone(&src)).unwrap();
    let out = pipeline.wait_completed().unwrap().unwrap();
    drop(out);
    assert_eq!(
        Arc::strong_count(&src),
        1,
        "after drain and drop only the scan loop's reference remains"
    );
}

// ============================================================================
// Scan loop integration
// ============================================================================

struct PagedSource {
    pages: Vec<StoragePage>,
}

impl PagedSource {
    fn new(npages: usize, per_page: usize) -> Self {
        let d = desc();
        let mut pages = Vec::with_capacity(npages);
        for p in 0..npages {
            let mut builder: PageBuilder = StoragePage::builder(p as u32);
            for i in 0..per_page {
                let id = (p * per_page + i) as i64;
                let payload = encode_record(&d, &row(id));
                assert!(builder.push(&payload, true));
            }
            pages.push(builder.finish());
        }
        pages.reverse(); // pop() restores original order
        Self { pages }
    }
}

impl RecordSource for PagedSource {
    fn next_page(&mut self) -> Option<StoragePage> {
        self.pages.pop()
    }
}

#[test]
fn test_scan_loop_through_pipeline() {
    let (_device, pipeline) = default_pipeline(
        ScanKernels::with_filter(FilterSpec::int(0, CompareOp::Ge, 100)),
        PipelineConfig::default(),
    );
    let mut scan = TableScan::new(PagedSource::new(8, 25), desc(), 7);

    let mut seen = Vec::new();
    while let Some(chunk) = scan.next_chunk(96 * 1024).unwrap() {
        let mut sealed: SharedChunk = Arc::new(chunk);
        loop {
            match pipeline.submit(sealed).unwrap() {
                SubmitOutcome::Accepted(_) => break,
                SubmitOutcome::RetryLater(back) => {
                    // Drain one completion to relieve memory pressure.
                    let out = pipeline.wait_completed().unwrap().unwrap();
                    for i in 0..out.row_count() {
                        seen.push(out.fetch(i).unwrap().values()[0].clone());
                    }
                    sealed = back;
                }
            }
        }
    }
    while let Some(done) = pipeline.wait_completed() {
        let out = done.unwrap();
        for i in 0..out.row_count() {
            seen.push(out.fetch(i).unwrap().values()[0].clone());
        }
    }

    // 200 source records, ids 100..199 pass the filter.
    assert_eq!(seen.len(), 100);
    let mut ids: Vec<i64> = seen.iter().map(|v| v.as_i64().unwrap()).collect();
    ids.sort_unstable();
    assert_eq!(ids, (100..200).collect::<Vec<i64>>(), "exactly the passing ids, once each");
}
