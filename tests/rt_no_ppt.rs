use std::fs;
use std::path::Path;

/// Modules that run on audio I/O threads.
const RT_MODULES: &[&str] = &[
    "ring.rs",
    "byte_ring.rs",
    "buffer_period.rs",
    "callback_times.rs",
    "tone.rs",
];

/// Ensure audio-thread modules do not call the non-RT `assert_invariant`, which acquires a Mutex.
#[test]
fn rt_modules_do_not_call_assert_invariant() {
    let src_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    for module in RT_MODULES {
        let path = src_dir.join(module);
        let src = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read {}: {e}", path.display()));
        assert!(
            !src.contains("assert_invariant("),
            "{module}: RT paths must not call assert_invariant (acquires Mutex). Use `signal_invariant` or avoid invariant logging in RT."
        );
    }
}

/// Audio-thread modules must not log either; the `log` backends lock and allocate.
#[test]
fn rt_modules_do_not_log() {
    let src_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    for module in RT_MODULES {
        let src = fs::read_to_string(src_dir.join(module)).unwrap();
        for mac in ["info!(", "warn!(", "debug!(", "error!(", "trace!("] {
            assert!(!src.contains(mac), "{module} calls {mac}");
        }
    }
}

/// Functions in session.rs whose closures run on player and recorder threads.
const SESSION_ROLES: &[&str] = &[
    "play_tone",
    "record_to_ring",
    "play_forwarded",
    "record_with_probe",
    "collect_and_signal",
    "inject_at",
];

/// Source of the top-level `fn name` in `src`, up to its closing brace.
fn function_source<'a>(src: &'a str, name: &str) -> &'a str {
    let start = src
        .find(&format!("\nfn {name}"))
        .unwrap_or_else(|| panic!("session.rs has no fn {name}"));
    let body = &src[start + 1..];
    let end = body.find("\n}\n").map_or(body.len(), |i| i + 2);
    &body[..end]
}

#[test]
fn session_roles_do_not_log_or_lock() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("src").join("session.rs");
    let src = fs::read_to_string(&path).unwrap();
    for role in SESSION_ROLES {
        let body = function_source(&src, role);
        for mac in [
            "info!(", "warn!(", "debug!(", "error!(", "trace!(", "println!(", "eprintln!(",
            "assert_invariant(",
        ] {
            assert!(!body.contains(mac), "{role} calls {mac} on an audio thread");
        }
    }
}
