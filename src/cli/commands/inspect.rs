//! The `inspect-wal` command: offline record dump with CRC verification.

use crate::cli::InspectWalArgs;
use crate::storage::wal::{self, WalOp};
use anyhow::Result;

/// Scan a WAL file without taking the writer lock and print a summary.
pub fn run_inspect_wal(args: InspectWalArgs) -> Result<()> {
    let mut index = 0u64;
    let summary = wal::scan_file(&args.path, |op, key, payload, crc_ok| {
        if args.verbose {
            let op_name = WalOp::from_u8(op)
                .map(|op| format!("{op:?}"))
                .unwrap_or_else(|| format!("unknown({op})"));
            println!(
                "#{index} {op_name} key={:?} payload={}B crc={}",
                String::from_utf8_lossy(key),
                payload.len(),
                if crc_ok { "ok" } else { "MISMATCH" }
            );
        }
        index += 1;
    })?;

    println!(
        "{}: {} records ({} batches), {} bytes{}",
        args.path,
        summary.records,
        summary.batches,
        summary.bytes,
        if summary.stopped_early {
            ", stopped at a truncated or corrupt record"
        } else {
            ""
        }
    );
    Ok(())
}
