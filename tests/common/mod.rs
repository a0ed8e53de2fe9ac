#![allow(dead_code)]

pub mod logs {
    use std::io;
    use std::sync::{Mutex, Once};
    use tracing_subscriber::fmt::MakeWriter;

    static INIT: Once = Once::new();
    static BUFFER: Mutex<Vec<u8>> = Mutex::new(Vec::new());

    /// Writer appending formatted log lines to the shared buffer.
    #[derive(Clone, Default)]
    pub struct CaptureWriter;

    impl io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            BUFFER
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            CaptureWriter
        }
    }

    /// Install a process-wide subscriber that records every log line.
    ///
    /// Background work runs on `may` worker threads, so a thread-local
    /// default subscriber would miss it.
    pub fn init() {
        INIT.call_once(|| {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .with_ansi(false)
                .with_writer(CaptureWriter)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .expect("install capturing subscriber");
        });
    }

    /// Everything logged so far.
    pub fn contents() -> String {
        let buf = BUFFER
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Log lines containing every one of `needles`.
    pub fn lines_with(needles: &[&str]) -> Vec<String> {
        contents()
            .lines()
            .filter(|line| needles.iter().all(|n| line.contains(n)))
            .map(str::to_string)
            .collect()
    }
}

pub mod wait {
    use std::time::{Duration, Instant};

    /// Poll `cond` until it holds or `timeout` elapses. Returns the final result.
    pub fn until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if cond() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

pub mod temp_files {
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Write `content` to a fresh `.yaml` file removed when the handle drops.
    pub fn yaml(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .prefix("bean_async_test_")
            .suffix(".yaml")
            .tempfile()
            .expect("create temp file");
        file.write_all(content.as_bytes()).expect("write temp file");
        file.flush().expect("flush temp file");
        file
    }
}
