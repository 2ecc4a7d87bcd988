//! Kernel logging through the `log` facade.
//!
//! Records go to the console driver's polled output path, which is safe
//! to call with locks held. Hosted builds (tests) leave the facade
//! uninitialized and `log` macros become no-ops.

use log::{Level, LevelFilter, Metadata, Record};

static LOGGER: Logger = Logger {};

/// Everything up to this level reaches the console.
const MAX_LOG_LEVEL: Level = Level::Info;

struct Logger {}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= MAX_LOG_LEVEL
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            console_println(format_args!("[{}] {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Routes one formatted line to the console.
fn console_println(args: core::fmt::Arguments<'_>) {
    cfg_if::cfg_if! {
        if #[cfg(all(target_arch = "x86", target_os = "none"))] {
            extern "C" {
                // console.c: polled character output.
                fn consputc(c: i32);
            }
            use core::fmt::Write;
            struct Cons;
            impl Write for Cons {
                fn write_str(&mut self, s: &str) -> core::fmt::Result {
                    for b in s.bytes() {
                        // SAFETY: consputc is safe to call from any context.
                        unsafe { consputc(b as i32) };
                    }
                    Ok(())
                }
            }
            let _ = writeln!(Cons, "{}", args);
        } else {
            let _ = args;
        }
    }
}

/// Installs the kernel logger. Called once during boot.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}
