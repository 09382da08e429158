use auxide_loopback::config::TestType;
use auxide_loopback::device::{LoopbackParams, SimulatedLoopback};
use auxide_loopback::report::latency_report;
use auxide_loopback::{LoopbackSession, TestSettings};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = TestSettings {
        sampling_rate: 48000,
        player_buffer_frames: 240,
        recorder_buffer_frames: 240,
        test_type: TestType::Latency,
        ..TestSettings::default()
    };
    let session = LoopbackSession::new(settings).unwrap();
    // 35 ms of path delay at 48 kHz.
    let (sink, source) = SimulatedLoopback::pair(LoopbackParams {
        delay_samples: 1680,
        gain: 0.6,
        ..LoopbackParams::default()
    });

    let result = session.run_latency_test(source, sink).unwrap();
    match result.latency_ms() {
        Some(ms) => println!("Round trip: {ms:.2} ms"),
        None => println!("Round trip: unknown"),
    }
    println!("{}", latency_report(&result, "demo"));
}
