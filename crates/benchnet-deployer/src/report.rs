//! Block timing collection and CSV export.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::rpc::{NodeRpc, RpcError};

/// Timing of one committed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTiming {
    pub height: u64,
    pub time_unix_nanos: i128,
    pub size_bytes: u64,
    pub commit_round: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum ReportError {
    #[error("no nodes to read blocks from")]
    NoNodes,
    #[error("no node could serve {what}")]
    Unavailable {
        what: String,
        #[source]
        last_error: RpcError,
    },
    #[error("failed to write {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path:?}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Read the timing of every block retained by the network, from the earliest to the latest
/// height.
///
/// Each height is requested from the node that served the previous one; on error the next node
/// is tried, wrapping around, until every node has failed for that height.
pub async fn collect_block_timings<C: NodeRpc>(clients: &[C]) -> Result<Vec<BlockTiming>, ReportError> {
    if clients.is_empty() {
        return Err(ReportError::NoNodes);
    }

    let mut current = 0;
    let status = with_failover(clients, &mut current, "status".to_string(), |client| {
        client.status()
    })
    .await?;
    let (earliest, latest) = (
        status.earliest_block_height.max(1),
        status.latest_block_height,
    );
    info!(earliest, latest, node = %clients[current].address(), "reading blocks");

    let mut timings = Vec::new();
    for height in earliest..=latest {
        let block = with_failover(clients, &mut current, format!("block {height}"), |client| {
            client.block(height)
        })
        .await?;
        timings.push(BlockTiming {
            height: block.height,
            time_unix_nanos: block.time_unix_nanos,
            size_bytes: block.size_bytes,
            commit_round: block.last_commit_round,
        });
    }
    debug!(blocks = timings.len(), "read blocks");
    Ok(timings)
}

async fn with_failover<'a, C, T, F, Fut>(
    clients: &'a [C],
    current: &mut usize,
    what: String,
    mut request: F,
) -> Result<T, ReportError>
where
    C: NodeRpc,
    F: FnMut(&'a C) -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut last_error = None;
    for offset in 0..clients.len() {
        let index = (*current + offset) % clients.len();
        match request(&clients[index]).await {
            Ok(value) => {
                *current = index;
                return Ok(value);
            }
            Err(e) => {
                warn!(node = %clients[index].address(), "failed to read {what}: {e}");
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(last_error) => Err(ReportError::Unavailable { what, last_error }),
        None => Err(ReportError::NoNodes),
    }
}

/// Write `rows` to `path` as CSV, creating parent directories as needed.
pub fn write_block_timings_csv(path: &Path, rows: &[BlockTiming]) -> Result<(), ReportError> {
    let io_err = |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let csv_err = |source| ReportError::Csv {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut writer = csv::Writer::from_writer(File::create(path).map_err(io_err)?);
    writer
        .write_record(["height", "block time", "block size", "last commit round"])
        .map_err(csv_err)?;
    for row in rows {
        writer
            .write_record([
                row.height.to_string(),
                row.time_unix_nanos.to_string(),
                row.size_bytes.to_string(),
                row.commit_round.to_string(),
            ])
            .map_err(csv_err)?;
    }
    writer.flush().map_err(io_err)?;
    info!(path = %path.display(), rows = rows.len(), "wrote block timings");
    Ok(())
}

/// Write the events `node` recorded for a trace table to `<dir>/<node>/<table>.jsonl`.
pub fn write_traces(
    dir: &Path,
    node: &str,
    table: &str,
    traces: &[u8],
) -> Result<PathBuf, ReportError> {
    let path = dir.join(node).join(format!("{table}.jsonl"));
    let io_err = |source| ReportError::Io {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(dir.join(node)).map_err(io_err)?;
    fs::write(&path, traces).map_err(io_err)?;
    info!(path = %path.display(), bytes = traces.len(), "wrote traces");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{BlockSummary, RpcConnector};
    use crate::testing::MockRpcConnector;

    fn block(height: u64) -> BlockSummary {
        BlockSummary {
            height,
            tx_count: 2,
            size_bytes: 1_000 * height,
            time_unix_nanos: 1_700_000_000_000_000_000 + height as i128 * 1_000_000_000,
            last_commit_round: 0,
        }
    }

    fn chain(rpc: &MockRpcConnector, address: &str, heights: std::ops::RangeInclusive<u64>) {
        rpc.script(address, |chain| {
            chain.earliest_height = *heights.start();
            chain.blocks = heights.map(|h| (h, block(h))).collect();
        });
    }

    #[tokio::test]
    async fn test_collect_reads_every_height() {
        let rpc = MockRpcConnector::default();
        chain(&rpc, "a:26657", 1..=5);
        let clients = vec![rpc.connect("a:26657").unwrap()];

        let timings = collect_block_timings(&clients).await.unwrap();

        assert_eq!(
            timings.iter().map(|t| t.height).collect::<Vec<_>>(),
            [1, 2, 3, 4, 5]
        );
        assert_eq!(timings[2].size_bytes, 3_000);
    }

    #[tokio::test]
    async fn test_collect_fails_over_to_next_node() {
        let rpc = MockRpcConnector::default();
        chain(&rpc, "a:26657", 1..=4);
        rpc.script("a:26657", |chain| chain.fail_blocks = true);
        chain(&rpc, "b:26657", 1..=4);
        let clients = vec![
            rpc.connect("a:26657").unwrap(),
            rpc.connect("b:26657").unwrap(),
        ];

        let timings = collect_block_timings(&clients).await.unwrap();
        assert_eq!(timings.len(), 4);
    }

    #[tokio::test]
    async fn test_collect_fails_when_no_node_serves_a_height() {
        let rpc = MockRpcConnector::default();
        chain(&rpc, "a:26657", 1..=3);
        rpc.script("a:26657", |chain| {
            chain.blocks.remove(&2);
        });
        let clients = vec![rpc.connect("a:26657").unwrap()];

        let err = collect_block_timings(&clients).await.unwrap_err();
        assert!(matches!(err, ReportError::Unavailable { ref what, .. } if what == "block 2"));

        let none: Vec<crate::testing::MockRpc> = Vec::new();
        assert!(matches!(
            collect_block_timings(&none).await,
            Err(ReportError::NoNodes)
        ));
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results").join("blocks.csv");
        let rows = [
            BlockTiming {
                height: 1,
                time_unix_nanos: 10,
                size_bytes: 100,
                commit_round: 0,
            },
            BlockTiming {
                height: 2,
                time_unix_nanos: 20,
                size_bytes: 0,
                commit_round: 1,
            },
        ];

        write_block_timings_csv(&path, &rows).unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "height,block time,block size,last commit round\n1,10,100,0\n2,20,0,1\n"
        );
    }

    #[test]
    fn test_write_traces_per_node_and_table() {
        let dir = tempfile::tempdir().unwrap();
        let traces = dir.path().join("traces");

        let path = write_traces(&traces, "val0", "consensus_round_state", b"{}\n").unwrap();

        assert_eq!(path, traces.join("val0/consensus_round_state.jsonl"));
        assert_eq!(fs::read(&path).unwrap(), b"{}\n");
    }
}
