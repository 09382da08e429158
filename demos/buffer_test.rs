use auxide_loopback::device::{LoopbackParams, SimulatedLoopback};
use auxide_loopback::report::{buffer_test_report, glitch_list_text};
use auxide_loopback::{LoopbackSession, TestSettings};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = TestSettings {
        sampling_rate: 48000,
        player_buffer_frames: 480,
        recorder_buffer_frames: 480,
        buffer_test_duration_s: 5,
        inject_glitches: true,
        ..TestSettings::default()
    };
    let session = LoopbackSession::new(settings).unwrap();
    // Every 150th block comes back silent.
    let (sink, source) = SimulatedLoopback::pair(LoopbackParams {
        dropout_every: Some(150),
        ..LoopbackParams::default()
    });

    let result = session.run_buffer_test(source, sink).unwrap();
    println!("{}", buffer_test_report(&result, "demo"));
    println!(
        "{}",
        glitch_list_text(
            &result.glitches,
            result.settings.fft_size(),
            result.settings.fft_overlap(),
            result.settings.sampling_rate,
            result.interval_too_long,
        )
    );
}
