//! Record log of popped tuples.
//!
//! One line per popped entry: `timestamp|TABLE:key|OP|field:value|...`
//! with monotonically rising timestamps. A rotation flag (set from the
//! SIGHUP handler) makes the recorder reopen the same path before the
//! next write, so an external logrotate can move the old file aside.

use crate::consumer::KeyOpFieldValues;
use chrono::Local;
use log::error;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Recorder {
    path: PathBuf,
    file: Option<File>,
    rotate: Arc<AtomicBool>,
}

impl Recorder {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
            rotate: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The flag a signal handler sets to request rotation.
    pub fn rotate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.rotate)
    }

    /// Appends one popped tuple.
    pub fn record(&mut self, table: &str, entry: &KeyOpFieldValues) {
        if self.rotate.swap(false, Ordering::SeqCst) {
            self.reopen();
        }

        let Some(file) = self.file.as_mut() else {
            return;
        };

        let mut line = format!(
            "{}|{}:{}|{}",
            Local::now().format("%Y-%m-%d.%H:%M:%S%.6f"),
            table,
            entry.key,
            entry.op.as_str()
        );
        for (field, value) in &entry.field_values {
            line.push_str(&format!("|{}:{}", field, value));
        }
        line.push('\n');

        if let Err(e) = file.write_all(line.as_bytes()) {
            error!("failed to write record log {}: {}", self.path.display(), e);
        }
    }

    fn reopen(&mut self) {
        self.file = None;
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => self.file = Some(file),
            Err(e) => {
                error!(
                    "failed to reopen record log {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::KeyOpFieldValues;

    #[test]
    fn test_record_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyd.rec");
        let mut recorder = Recorder::open(&path).unwrap();

        recorder.record(
            "ROUTE_TABLE",
            &KeyOpFieldValues::set(
                "10.0.0.0/24",
                vec![("nexthop".to_string(), "10.0.0.2".to_string())],
            ),
        );

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("ROUTE_TABLE:10.0.0.0/24|SET|nexthop:10.0.0.2"));
    }

    #[test]
    fn test_rotation_reopens_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyd.rec");
        let mut recorder = Recorder::open(&path).unwrap();

        recorder.record("T", &KeyOpFieldValues::del("a"));

        // Simulate logrotate moving the file aside, then SIGHUP.
        std::fs::rename(&path, dir.path().join("switchyd.rec.1")).unwrap();
        recorder.rotate_flag().store(true, Ordering::SeqCst);

        recorder.record("T", &KeyOpFieldValues::del("b"));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("T:b|DEL"));
        assert!(!content.contains("T:a|DEL"));
    }
}
