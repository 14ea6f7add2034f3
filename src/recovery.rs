use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    fs::OpenOptions,
    io::{self, Write},
    panic,
    path::{Path, PathBuf},
    sync::Once,
};

use chrono::{SecondsFormat, Utc};
use log::{error, info};

thread_local! {
    static LAST_TRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static INSTALL: Once = Once::new();

/// Install a process-wide panic hook that remembers the panic message and a
/// backtrace for the panicking thread. The previous hook still runs.
pub fn install_hook() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let trace = format!("{}\n\n{}", info, Backtrace::force_capture());
            LAST_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

/// Trace recorded by the hook for the last panic on this thread, or one
/// captured here if the hook never ran.
pub fn take_trace() -> String {
    LAST_TRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string())
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Append `trace` to `<dir>/stacktrace-<RFC3339 seconds>`, readable by the
/// owner only.
pub fn write_stacktrace(dir: &Path, trace: &str) -> io::Result<PathBuf> {
    let path = dir.join(format!(
        "stacktrace-{}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    ));

    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&path)?;
    writeln!(file, "{}", trace)?;
    Ok(path)
}

/// Log a recovered worker panic and persist its trace. Failing to write the
/// trace is only logged.
pub fn report_panic(dir: &Path, context: &str, payload: &(dyn Any + Send)) {
    let message = panic_message(payload);
    let trace = take_trace();
    error!("{}: recovered from panic: {}", context, message);

    match write_stacktrace(dir, &format!("{}: {}\n{}", context, message, trace)) {
        Ok(path) => info!("{}: stack trace written to {}", context, path.display()),
        Err(e) => error!("{}: failed to write stack trace: {}", context, e),
    }
}
