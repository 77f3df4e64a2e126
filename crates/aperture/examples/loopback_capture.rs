use std::sync::Arc;
use std::time::Duration;

use aperture::prelude::*;

fn main() -> Result<(), SessionError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let device = Arc::new(LoopbackDevice::with_delay(Duration::from_millis(5)));
    let (session, events) = CaptureSession::new(device);

    let endpoint = Arc::new(FifoEndpoint::new(8));
    let consumer = endpoint.consumer();
    let config = StreamConfig::output(
        Resolution::new(1280, 720).unwrap(),
        FourCc::new(*b"NV12"),
    )
    .with_max_buffers(4)
    .with_data_space(DataSpace::Bt709);
    let stream_id = session.add_stream(config, endpoint)?;
    session.configure()?;

    for shot in 0..6 {
        let sequence = session
            .submit(
                CaptureRequest::new()
                    .request_id(shot)
                    .target(stream_id),
            )
            .expect("submit");
        println!("queued shot {shot} as sequence {sequence}");
    }

    let mut completed = 0;
    while completed < 6 {
        match events.recv_timeout(Duration::from_secs(5)).expect("event") {
            SessionEvent::ResultReady { sequence, .. } => {
                completed += 1;
                println!("completed sequence {sequence}");
            }
            SessionEvent::RequestFailed {
                sequence, error, ..
            } => {
                println!("sequence {sequence} failed: {error}");
            }
            _ => {}
        }
    }

    while let ConsumerRecv::Frame(frame) = consumer.recv() {
        println!(
            "frame ts={}ns slot={}",
            frame.timestamp,
            frame.buffer.handle.slot()
        );
        consumer.release(frame);
    }

    assert!(session.wait_until_idle(Duration::from_secs(5)));
    let metrics = session.metrics();
    println!(
        "submitted={} failed={} batches={}",
        metrics.submitted_count(),
        metrics.failed_count(),
        metrics.batch_count()
    );
    Ok(())
}
