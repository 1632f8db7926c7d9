//! Workload and solution file parsing, and GET-result validation.
//!
//! A workload file holds one request per line: `put <key> <value>` or
//! `get <key>`, with unsigned 32-bit decimal keys and values. Unparsable
//! lines are skipped with a warning. A solution file holds one number per
//! line: the expected result of the nth GET in the workload.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::protocol::{Completion, OpKind};

/// Error type for workload file handling
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One parsed request from the workload file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub op: OpKind,
    pub key: u32,
    /// Meaningful only for PUT
    pub value: u32,
}

/// Parse a single workload line. Returns `None` for anything that is not a
/// well-formed request.
fn parse_request_line(line: &str) -> Option<Request> {
    let mut parts = line.split_whitespace();
    let op = parts.next()?;
    let key: u32 = parts.next()?.parse().ok()?;

    match op {
        "put" => {
            let value: u32 = parts.next()?.parse().ok()?;
            Some(Request {
                op: OpKind::Put,
                key,
                value,
            })
        }
        "get" => Some(Request {
            op: OpKind::Get,
            key,
            value: 0,
        }),
        _ => None,
    }
}

/// Read a workload file into a request log. Invalid lines are skipped.
pub fn load_workload(path: &Path) -> Result<Vec<Request>, WorkloadError> {
    let content = std::fs::read_to_string(path).map_err(|source| WorkloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut requests = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        match parse_request_line(line) {
            Some(req) => requests.push(req),
            None => {
                if !line.trim().is_empty() {
                    warn!(line = idx + 1, "skipping unparsable workload line");
                }
            }
        }
    }
    Ok(requests)
}

/// Read a solution file: line n is the expected value of the nth GET.
pub fn load_expected(path: &Path) -> Result<Vec<u32>, WorkloadError> {
    let content = std::fs::read_to_string(path).map_err(|source| WorkloadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut expected = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        match line.trim().parse::<u32>() {
            Ok(v) => expected.push(v),
            Err(_) => {
                if !line.trim().is_empty() {
                    warn!(line = idx + 1, "skipping unparsable solution line");
                }
            }
        }
    }
    Ok(expected)
}

/// The first observed divergence between a GET result and the solution file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// Index into the request log
    pub request_index: usize,
    pub key: u32,
    pub expected: u32,
    pub actual: u32,
}

/// Compare GET completions against the expected sequence.
///
/// Returns the first mismatch, if any. Validation runs after the workload
/// has fully completed, so a mismatch never aborts the run itself.
pub fn check_results(
    requests: &[Request],
    completions: &[Completion],
    expected: &[u32],
) -> Option<Mismatch> {
    let mut expected_idx = 0;

    for (i, req) in requests.iter().enumerate() {
        if req.op != OpKind::Get {
            continue;
        }
        let Some(&exp) = expected.get(expected_idx) else {
            break;
        };
        let actual = completions[i].value;
        if actual != exp {
            return Some(Mismatch {
                request_index: i,
                key: req.key,
                expected: exp,
                actual,
            });
        }
        expected_idx += 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn write_temp(test: &str, content: &str) -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "shmkv_wl_{}_{}_{}.txt",
            std::process::id(),
            test,
            id
        ));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_request_lines() {
        assert_eq!(
            parse_request_line("put 3 30"),
            Some(Request {
                op: OpKind::Put,
                key: 3,
                value: 30
            })
        );
        assert_eq!(
            parse_request_line("get 3"),
            Some(Request {
                op: OpKind::Get,
                key: 3,
                value: 0
            })
        );
        assert_eq!(parse_request_line("del 3"), None);
        assert_eq!(parse_request_line("put 3"), None);
        assert_eq!(parse_request_line("put x 1"), None);
        assert_eq!(parse_request_line(""), None);
    }

    #[test]
    fn test_load_workload_skips_bad_lines() {
        let path = write_temp(
            "load",
            "put 1 10\nbogus line\nget 1\nput 2\n\nget 2\n",
        );
        let requests = load_workload(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].op, OpKind::Put);
        assert_eq!(requests[1].key, 1);
        assert_eq!(requests[2].key, 2);
    }

    #[test]
    fn test_load_expected() {
        let path = write_temp("expected", "10\n0\n30\n");
        let expected = load_expected(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(expected, vec![10, 0, 30]);
    }

    #[test]
    fn test_check_results() {
        let requests = vec![
            Request {
                op: OpKind::Put,
                key: 1,
                value: 10,
            },
            Request {
                op: OpKind::Get,
                key: 1,
                value: 0,
            },
            Request {
                op: OpKind::Get,
                key: 2,
                value: 0,
            },
        ];
        let mut completions = vec![Completion::default(); 3];
        completions[1].value = 10;
        completions[2].value = 0;

        // Matching run
        assert_eq!(check_results(&requests, &completions, &[10, 0]), None);

        // Second GET diverges
        let m = check_results(&requests, &completions, &[10, 99]).unwrap();
        assert_eq!(m.request_index, 2);
        assert_eq!(m.key, 2);
        assert_eq!(m.expected, 99);
        assert_eq!(m.actual, 0);
    }
}
