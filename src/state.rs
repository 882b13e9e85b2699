//! Durable state for crash recovery. Paxos requires the promise and the
//! acceptance to reach stable storage before the corresponding replies are
//! sent; the chain position and the last decided value are kept in the same
//! record so everything lives in one place.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::paxos::ProposalId;
use crate::Result;

/// The five-field record persisted by every peer. A fresh peer starts at
/// instance 0 with every other field empty.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PersistentRecord {
    /// Index of the current, still undecided link in the chain.
    pub instance_number: u64,
    /// Highest proposal id promised for the current instance.
    pub promised_id: Option<ProposalId>,
    /// Proposal id of the highest proposal accepted for the current instance.
    pub accepted_id: Option<ProposalId>,
    /// Value accompanying `accepted_id`.
    pub accepted_value: Option<String>,
    /// Most recently decided value, i.e. the value of the previous instance.
    pub current_value: Option<String>,
}

/// Owner of one peer's state file. Saves replace the record atomically:
/// a crash mid-save leaves either the old record intact or the new record
/// complete, never a partial one.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Writes the record to a sibling temporary file, forces it to stable
    /// storage, then renames it over the canonical path. The rename is the
    /// commit point.
    pub fn save(&self, record: &PersistentRecord) -> Result<()> {
        let tmp = self.temp_path();
        let bytes = bincode::serialize(record)?;

        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Returns the most recently saved record. A missing file initializes
    /// the peer: the zero record is written out so the first promise has a
    /// file to replace.
    pub fn load(&self) -> Result<PersistentRecord> {
        if !self.path.exists() {
            let record = PersistentRecord::default();
            self.save(&record)?;
            return Ok(record);
        }
        let bytes = fs::read(&self.path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    fn temp_path(&self) -> PathBuf {
        let mut os = self.path.clone().into_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }
}
