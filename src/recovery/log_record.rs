//! Log record payloads carried as the data of WAL records.
//!
//! Insert: `[kind=0][xid:8][pgno:4][offset:2][item raw]`
//! Update: `[kind=1][xid:8][uid:8][old_len:4][old raw][new raw]`
//!
//! The raws are whole item images including the `[valid][size]` header, so
//! redo and undo are plain byte copies. The new raw's length is whatever
//! remains of the record.

use crate::transaction::Xid;
use anyhow::{Result, bail};
use bytes::{Buf, BufMut};

const KIND_INSERT: u8 = 0;
const KIND_UPDATE: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Insert {
        xid: Xid,
        pgno: u32,
        offset: u16,
        raw: Vec<u8>,
    },
    Update {
        xid: Xid,
        uid: u64,
        old_raw: Vec<u8>,
        new_raw: Vec<u8>,
    },
}

impl LogRecord {
    pub fn xid(&self) -> Xid {
        match self {
            LogRecord::Insert { xid, .. } => *xid,
            LogRecord::Update { xid, .. } => *xid,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            LogRecord::Insert {
                xid,
                pgno,
                offset,
                raw,
            } => {
                buf.put_u8(KIND_INSERT);
                buf.put_u64_le(xid.0);
                buf.put_u32_le(*pgno);
                buf.put_u16_le(*offset);
                buf.put_slice(raw);
            }
            LogRecord::Update {
                xid,
                uid,
                old_raw,
                new_raw,
            } => {
                buf.put_u8(KIND_UPDATE);
                buf.put_u64_le(xid.0);
                buf.put_u64_le(*uid);
                buf.put_u32_le(old_raw.len() as u32);
                buf.put_slice(old_raw);
                buf.put_slice(new_raw);
            }
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 1 + 8 {
            bail!("Truncated log record");
        }
        let kind = data.get_u8();
        let xid = Xid(data.get_u64_le());

        match kind {
            KIND_INSERT => {
                if data.remaining() < 4 + 2 {
                    bail!("Truncated insert log record");
                }
                let pgno = data.get_u32_le();
                let offset = data.get_u16_le();
                Ok(LogRecord::Insert {
                    xid,
                    pgno,
                    offset,
                    raw: data.to_vec(),
                })
            }
            KIND_UPDATE => {
                if data.remaining() < 8 + 4 {
                    bail!("Truncated update log record");
                }
                let uid = data.get_u64_le();
                let old_len = data.get_u32_le() as usize;
                if data.remaining() < old_len {
                    bail!("Truncated update log record");
                }
                let old_raw = data[..old_len].to_vec();
                data.advance(old_len);
                Ok(LogRecord::Update {
                    xid,
                    uid,
                    old_raw,
                    new_raw: data.to_vec(),
                })
            }
            other => bail!("Unknown log record kind: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_roundtrip() -> Result<()> {
        let rec = LogRecord::Insert {
            xid: Xid(7),
            pgno: 3,
            offset: 2,
            raw: vec![1, 5, 0, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE],
        };
        assert_eq!(LogRecord::decode(&rec.encode())?, rec);
        Ok(())
    }

    #[test]
    fn test_update_roundtrip() -> Result<()> {
        let rec = LogRecord::Update {
            xid: Xid(9),
            uid: (4u64 << 32) | 2,
            old_raw: vec![1, 2, 0, 0x01, 0x02],
            new_raw: vec![1, 2, 0, 0x03, 0x04],
        };
        assert_eq!(LogRecord::decode(&rec.encode())?, rec);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(LogRecord::decode(&[]).is_err());
        assert!(LogRecord::decode(&[KIND_INSERT, 1, 2]).is_err());
        assert!(LogRecord::decode(&[0x42; 32]).is_err());
    }
}
