use crate::error::{BtrfsError, Result};
use crate::fs::FsInfo;

/// Exclusive write context. At most one per pool; the generation it stamps
/// into blocks is the pool generation plus one until commit publishes it.
pub struct Transaction {
    pub transid: u64,
}

pub fn start_transaction(fs: &mut FsInfo) -> Result<Transaction> {
    if !fs.writable {
        return Err(BtrfsError::InvalidArgument(
            "pool is open read-only".into(),
        ));
    }
    if fs.trans_running {
        return Err(BtrfsError::TransactionInProgress);
    }
    fs.trans_running = true;
    fs.generation += 1;
    Ok(Transaction {
        transid: fs.generation,
    })
}

/// Settle delayed refs, write every dirty tree in dependency order, then
/// publish the new generation through the superblocks. See the commit path
/// in `fs.rs` for the write-out itself.
pub fn commit_transaction(fs: &mut FsInfo, trans: Transaction) -> Result<()> {
    crate::fs::commit(fs, &trans)?;
    fs.trans_running = false;
    Ok(())
}

/// back out of a transaction that wrote nothing
pub fn abort_transaction(fs: &mut FsInfo, trans: Transaction) {
    let _ = trans;
    fs.trans_running = false;
}

#[cfg(test)]
mod tests {
    // exclusivity is covered by tests/tree.rs where a pool exists to open
}
