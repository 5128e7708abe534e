use std::fmt;

/// Transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Xid(pub u64);

/// The privileged always-committed transaction, used for index node and
/// boot writes. Its mutations are never undone.
pub const SUPER_XID: Xid = Xid(0);

impl Xid {
    pub fn is_super(self) -> bool {
        self == SUPER_XID
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({})", self.0)
    }
}

/// Durable per-transaction state, one byte in the xid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidStatus {
    Active,
    Committed,
    Aborted,
}

impl XidStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            XidStatus::Active => 0,
            XidStatus::Committed => 1,
            XidStatus::Aborted => 2,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(XidStatus::Active),
            1 => Some(XidStatus::Committed),
            2 => Some(XidStatus::Aborted),
            _ => None,
        }
    }
}
