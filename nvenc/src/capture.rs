//! Captures log output in tests. The logger is process-wide, so each capture only sees records
//! logged from the thread that created it.

use std::{
    sync::{Mutex, Once},
    thread::{self, ThreadId},
};

#[derive(Debug, Eq, PartialEq)]
pub struct LogEntry {
    pub level: log::Level,
    pub message: String,
}

struct CaptureLog(Mutex<Vec<(ThreadId, LogEntry)>>);

impl log::Log for CaptureLog {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut l = self.0.lock().expect("not poisoned");
        l.push((
            thread::current().id(),
            LogEntry {
                level: record.level(),
                message: record.args().to_string(),
            },
        ))
    }

    fn flush(&self) {}
}

static LOG: CaptureLog = CaptureLog(Mutex::new(Vec::new()));
static INSTALL: Once = Once::new();

pub struct Capture {
    thread: ThreadId,
}

pub fn capture() -> Capture {
    INSTALL.call_once(|| {
        log::set_logger(&LOG).expect("installing logger should succeed");
        log::set_max_level(log::LevelFilter::Trace);
    });
    let thread = thread::current().id();
    LOG.0.lock().expect("not poisoned").retain(|(t, _)| *t != thread);
    Capture { thread }
}

impl Capture {
    pub fn entries(&self) -> Vec<LogEntry> {
        let mut l = LOG.0.lock().expect("not poisoned");
        let (mine, others) = l.drain(..).partition::<Vec<_>, _>(|(t, _)| *t == self.thread);
        *l = others;
        mine.into_iter().map(|(_, entry)| entry).collect()
    }
}
