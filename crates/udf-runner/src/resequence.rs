use bytes::Bytes;
use std::collections::BTreeMap;

/// Resequencer restores submission order of results which a worker
/// returned out of order, using their echoed sequence numbers.
#[derive(Debug, Default)]
pub struct Resequencer {
    next: u64,
    parked: BTreeMap<u64, Bytes>,
}

impl Resequencer {
    /// Add the result of call `seq`.
    pub fn insert(&mut self, seq: u64, body: Bytes) -> anyhow::Result<()> {
        use std::collections::btree_map::Entry;

        anyhow::ensure!(
            seq >= self.next,
            "function worker returned result #{seq}, which was already delivered"
        );
        match self.parked.entry(seq) {
            Entry::Occupied(_) => anyhow::bail!("function worker returned result #{seq} twice"),
            Entry::Vacant(entry) => {
                entry.insert(body);
            }
        }
        Ok(())
    }

    /// Pop the result of the next call in sequence, if it has arrived.
    pub fn pop(&mut self) -> Option<Bytes> {
        let body = self.parked.remove(&self.next)?;
        self.next += 1;
        Some(body)
    }

    /// Number of results waiting on an earlier one.
    pub fn parked(&self) -> usize {
        self.parked.len()
    }
}
