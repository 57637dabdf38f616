// Transaction log for stable transactions. Prepare serializes the redo set
// to one file per transaction and forces it to disk; commit applies the
// buffered writes and then truncates (removes) the record, abort just
// removes it. Replay after a crash is not performed; the record exists so an
// interrupted prepared transaction is diagnosable from the log directory.

use crate::sfile::{map_io, OpResult};
use crate::trans::WriteRec;
use pious_base::{StatusCode, TransId};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

pub(crate) struct WriteLog {
    dir: PathBuf,
}

impl WriteLog {
    pub(crate) fn new(dir: PathBuf) -> OpResult<WriteLog> {
        fs::create_dir_all(&dir).map_err(|e| map_io(&e))?;
        Ok(WriteLog { dir })
    }

    fn path(&self, transid: &TransId) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{}.{}.redo",
            transid.sec, transid.usec, transid.host, transid.pid
        ))
    }

    /// Synchronously record the redo set for `transid`.
    pub(crate) fn record(&self, transid: &TransId, redo: &[WriteRec]) -> OpResult<()> {
        let bytes = rmp_serde::to_vec(redo).map_err(|_| StatusCode::Insuf)?;
        let path = self.path(transid);
        let mut f = File::create(&path).map_err(|e| map_io(&e))?;
        f.write_all(&bytes).map_err(|e| map_io(&e))?;
        f.sync_all().map_err(|e| map_io(&e))?;
        Ok(())
    }

    /// Remove the record after the transaction result is applied. A missing
    /// record reports `NotLog`: the outcome stands but was not logged.
    pub(crate) fn truncate(&self, transid: &TransId) -> OpResult<()> {
        match fs::remove_file(self.path(transid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StatusCode::NotLog),
            Err(e) => Err(map_io(&e)),
        }
    }
}
