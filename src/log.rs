use std::io::Write;

use env_logger::{Builder, Env};

/// Variable holding the log filter, in `RUST_LOG` syntax. `RUST_LOG` is
/// read when it is unset, and `warn` when both are.
pub const LOG_ENV: &str = "SMALL_MVCC_LOG";

/// Install the global logger. Only the first call has an effect.
pub fn init_log() {
    let fallback = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    let _ = Builder::from_env(Env::default().filter_or(LOG_ENV, fallback))
        .format(|buf, record| {
            let ts = buf.timestamp_millis();
            writeln!(
                buf,
                "{} {:<5} {}:{} {}",
                ts,
                record.level(),
                record.module_path().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init();
}
