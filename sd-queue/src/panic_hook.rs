//! Process-wide panic logging.
//!
//! Compute panics are caught by the worker and recorded on the job, but the
//! location and backtrace only exist inside the hook, so they go to the log.

use std::backtrace::Backtrace;
use std::panic::{PanicHookInfo, take_hook};
use std::thread;

/// Install a hook that logs every panic through `tracing`, then chains to the
/// previously installed hook.
pub fn install() {
    let previous_hook = take_hook();

    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let location = info
                .location()
                .map(|loc| format!("{}:{}", loc.file(), loc.line()))
                .unwrap_or_else(|| "<unknown>".to_string());
            let thread_name = thread::current()
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| "<unnamed>".to_string());

            tracing::error!(
                target: "sd_queue::panic",
                thread = %thread_name,
                location = %location,
                payload = %payload_text(info),
                "Panic\n{}",
                Backtrace::capture()
            );
        }));

        previous_hook(info);
    }));
}

fn payload_text(info: &PanicHookInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        info.to_string()
    }
}
