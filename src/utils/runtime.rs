use std::process;

/// Exits with code 2 on non-POSIX platforms.
pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: tidemq brokers run on POSIX systems only");
        process::exit(2);
    }
}
