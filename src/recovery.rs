//! Crash recovery.
//!
//! Runs on open when the clean-shutdown witness on page 1 is broken. One
//! scan of the log collects every record and the highest page it touches;
//! pages past that are garbage from interrupted extensions and are
//! truncated away. Records of settled transactions (and of the super xid)
//! are redone in log order; records of transactions still active at the
//! crash are undone in reverse, after which those transactions are marked
//! aborted.

pub mod log_record;

use crate::data::item::unpack_uid;
use crate::storage::page::DataPage;
use crate::storage::{Pager, Wal};
use crate::transaction::{Xid, XidManager};
use anyhow::Result;
use log_record::LogRecord;
use std::collections::HashMap;

pub fn recover(tm: &XidManager, wal: &Wal, pager: &Pager) -> Result<()> {
    tracing::info!("replaying write-ahead log");

    wal.rewind();
    let mut records = Vec::new();
    let mut max_pgno = 1u32;
    while let Some(data) = wal.next()? {
        let record = LogRecord::decode(&data)?;
        let pgno = match &record {
            LogRecord::Insert { pgno, .. } => *pgno,
            LogRecord::Update { uid, .. } => unpack_uid(*uid).0,
        };
        max_pgno = max_pgno.max(pgno);
        records.push(record);
    }
    pager.truncate_by_pgno(max_pgno)?;

    // Aborted transactions are neither redone nor undone: their effects
    // were already reverted, and redoing them would resurrect tombstones.
    let mut redone = 0usize;
    for record in &records {
        if tm.is_committed(record.xid())? {
            redo(pager, record)?;
            redone += 1;
        }
    }

    let mut active: HashMap<Xid, Vec<&LogRecord>> = HashMap::new();
    for record in &records {
        if tm.is_active(record.xid())? {
            active.entry(record.xid()).or_default().push(record);
        }
    }
    for (xid, records) in &active {
        for record in records.iter().rev() {
            undo(pager, record)?;
        }
        tm.abort(*xid)?;
    }

    tracing::info!(
        redone,
        undone_xids = active.len(),
        "write-ahead log replayed"
    );
    Ok(())
}

fn redo(pager: &Pager, record: &LogRecord) -> Result<()> {
    match record {
        LogRecord::Insert {
            pgno, offset, raw, ..
        } => {
            let page = pager.get_page(*pgno)?;
            let mut buf = page.data_mut();
            DataPage::from_buf(&mut buf).recover_insert(raw, *offset);
        }
        LogRecord::Update { uid, new_raw, .. } => {
            let (pgno, offset) = unpack_uid(*uid);
            let page = pager.get_page(pgno)?;
            let mut buf = page.data_mut();
            DataPage::from_buf(&mut buf).recover_update(new_raw, offset);
        }
    }
    Ok(())
}

fn undo(pager: &Pager, record: &LogRecord) -> Result<()> {
    match record {
        LogRecord::Insert {
            pgno, offset, raw, ..
        } => {
            // The insert becomes a tombstone: same bytes, valid flag off.
            let mut raw = raw.clone();
            raw[0] = 0;
            let page = pager.get_page(*pgno)?;
            let mut buf = page.data_mut();
            DataPage::from_buf(&mut buf).recover_insert(&raw, *offset);
        }
        LogRecord::Update { uid, old_raw, .. } => {
            let (pgno, offset) = unpack_uid(*uid);
            let page = pager.get_page(pgno)?;
            let mut buf = page.data_mut();
            DataPage::from_buf(&mut buf).recover_update(old_raw, offset);
        }
    }
    Ok(())
}
