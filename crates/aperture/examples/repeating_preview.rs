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

    let device = Arc::new(LoopbackDevice::with_delay(Duration::from_millis(10)));
    let (session, events) = CaptureSession::new(device);

    // Lossy preview endpoint: the consumer only ever wants fresh frames.
    let endpoint = Arc::new(FifoEndpoint::with_limits(8, 2, usage::CPU_READ));
    let consumer = endpoint.consumer();
    let config = StreamConfig::output(
        Resolution::new(640, 480).unwrap(),
        FourCc::new(*b"YUYV"),
    )
    .with_max_buffers(4);
    let stream_id = session.add_stream(config, endpoint)?;
    session.configure()?;

    let first = session
        .submit_repeating(CaptureRequest::new().target(stream_id))
        .expect("repeating");
    println!("preview running from sequence {first}");

    // A one-shot autofocus trigger rides on exactly one preview frame.
    session.queue_triggers(&[Trigger::new(tags::AF_TRIGGER, SettingValue::Int(1))]);

    let mut previewed = 0;
    while previewed < 30 {
        match events.recv_timeout(Duration::from_secs(5)).expect("event") {
            SessionEvent::ResultReady { sequence, .. } => {
                previewed += 1;
                if let ConsumerRecv::Frame(frame) = consumer.recv() {
                    if previewed % 10 == 0 {
                        println!("sequence {sequence}: frame ts={}ns", frame.timestamp);
                    }
                    consumer.release(frame);
                }
            }
            SessionEvent::DeviceError { kind, .. } => {
                println!("device error: {kind:?}");
                break;
            }
            _ => {}
        }
    }

    let last = session.clear_repeating().expect("was repeating");
    println!("preview stopped after sequence {last}");
    assert!(session.wait_until_drained(Duration::from_secs(5)));
    assert!(session.wait_until_idle(Duration::from_secs(5)));
    Ok(())
}
