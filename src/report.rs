#![forbid(unsafe_code)]

// Distributed reporting: at run end each worker sends one JSON snapshot of
// its counters to the coordinator, which merges them field-wise into the
// run-wide total. Workers report in arbitrary order; each snapshot is
// merged exactly once.

use crate::stats::AggregateStats;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;
use tracing::{info, warn};

/// Status payload a worker sends to the coordinator at run end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    pub worker_index: u32,
    pub identities_allocated: u64,
    pub stats: AggregateStats,
}

/// Run-wide totals assembled by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    pub workers_reported: usize,
    pub identities_allocated: u64,
    pub stats: AggregateStats,
}

/// Send this worker's snapshot. One connection, one line, then EOF.
pub fn send_report(addr: &str, report: &WorkerReport) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_write_timeout(Some(Duration::from_secs(10)))?;
    let mut line = serde_json::to_vec(report).map_err(io::Error::other)?;
    line.push(b'\n');
    stream.write_all(&line)?;
    info!(addr, worker = report.worker_index, "report sent");
    Ok(())
}

/// Coordinator side of the reporting protocol.
pub struct Coordinator {
    listener: TcpListener,
}

impl Coordinator {
    pub fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept worker reports until `expected` snapshots have been merged.
    ///
    /// The merge is field-wise addition, so arrival order does not matter;
    /// a connection that fails to parse is logged and does not count
    /// toward the total.
    pub fn collect(&self, expected: usize) -> io::Result<RunTotals> {
        info!(expected, "coordinator waiting for worker reports");

        let mut totals = RunTotals {
            workers_reported: 0,
            identities_allocated: 0,
            stats: AggregateStats::default(),
        };

        while totals.workers_reported < expected {
            let (stream, peer) = self.listener.accept()?;
            match read_report(stream) {
                Ok(report) => {
                    totals.stats.merge(&report.stats);
                    totals.identities_allocated += report.identities_allocated;
                    totals.workers_reported += 1;
                    info!(
                        %peer,
                        worker = report.worker_index,
                        received = totals.workers_reported,
                        expected,
                        "worker report merged"
                    );
                }
                Err(err) => {
                    warn!(%peer, %err, "discarding unreadable report");
                }
            }
        }

        Ok(totals)
    }
}

fn read_report(stream: TcpStream) -> io::Result<WorkerReport> {
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    serde_json::from_str(&line).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(worker_index: u32, attempts: u64, successes: u64) -> WorkerReport {
        WorkerReport {
            worker_index,
            identities_allocated: attempts,
            stats: AggregateStats {
                attempts,
                successes,
                failures: attempts - successes,
                ..Default::default()
            },
        }
    }

    #[test]
    fn report_round_trips_as_camel_case_json() {
        let json = serde_json::to_string(&report(3, 10, 8)).unwrap();
        assert!(json.contains("\"workerIndex\":3"));
        assert!(json.contains("\"authFailures\":0"));
        let parsed: WorkerReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.stats.attempts, 10);
    }

    #[test]
    fn coordinator_merges_each_snapshot_exactly_once() {
        let coordinator = Coordinator::bind("127.0.0.1:0").unwrap();
        let addr = coordinator.local_addr().unwrap().to_string();

        // Workers report asynchronously and in arbitrary order.
        let mut senders = Vec::new();
        for (index, attempts) in [(2u32, 40u64), (0, 25), (1, 10)] {
            let addr = addr.clone();
            senders.push(std::thread::spawn(move || {
                send_report(&addr, &report(index, attempts, attempts - 1)).unwrap();
            }));
        }

        let totals = coordinator.collect(3).unwrap();
        for sender in senders {
            sender.join().unwrap();
        }

        assert_eq!(totals.workers_reported, 3);
        assert_eq!(totals.stats.attempts, 75);
        assert_eq!(totals.stats.successes, 72);
        assert_eq!(totals.stats.failures, 3);
        assert_eq!(totals.identities_allocated, 75);
    }

    #[test]
    fn malformed_reports_are_discarded_not_counted() {
        let coordinator = Coordinator::bind("127.0.0.1:0").unwrap();
        let addr = coordinator.local_addr().unwrap();

        let sender = std::thread::spawn(move || {
            let mut garbage = TcpStream::connect(addr).unwrap();
            garbage.write_all(b"not json\n").unwrap();
            drop(garbage);
            send_report(&addr.to_string(), &report(0, 5, 5)).unwrap();
        });

        let totals = coordinator.collect(1).unwrap();
        sender.join().unwrap();
        assert_eq!(totals.workers_reported, 1);
        assert_eq!(totals.stats.attempts, 5);
    }
}
