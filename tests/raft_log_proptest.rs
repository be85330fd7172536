use proptest::prelude::*;
use raftkv::raft::{Log, LogEntry};
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum LogOp {
    Append { count: usize, term_step: u64 },
    Truncate { index: u64 },
    Reopen,
}

fn log_op_strategy() -> impl Strategy<Value = LogOp> {
    prop_oneof![
        3 => (1usize..4, 0u64..3).prop_map(|(count, term_step)| LogOp::Append { count, term_step }),
        1 => (0u64..40).prop_map(|index| LogOp::Truncate { index }),
        1 => Just(LogOp::Reopen),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn raft_log_preserves_prefix_and_indices(ops in proptest::collection::vec(log_op_strategy(), 1..40)) {
        let tmp = TempDir::new().expect("tempdir");

        let mut log = Log::open(tmp.path()).expect("open");
        // shadow[i] is the term of the entry at index i + 1
        let mut shadow: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                LogOp::Append { count, term_step } => {
                    let mut term = shadow.last().copied().unwrap_or(1);
                    let entries: Vec<LogEntry> = (0..count)
                        .map(|i| {
                            term += if i == 0 { term_step } else { 0 };
                            let index = (shadow.len() + i + 1) as u64;
                            LogEntry::new(index, term, index.to_be_bytes().to_vec())
                        })
                        .collect();
                    shadow.extend(entries.iter().map(|e| e.term));
                    log.append(entries).expect("contiguous append");
                }
                LogOp::Truncate { index } => {
                    log.truncate(index).expect("truncate");
                    shadow.truncate((index as usize).min(shadow.len()));
                }
                LogOp::Reopen => {
                    drop(log);
                    log = Log::open(tmp.path()).expect("reopen");
                }
            }

            prop_assert_eq!(log.last_index(), shadow.len() as u64);
            prop_assert_eq!(log.last_term(), shadow.last().copied().unwrap_or(0));
        }

        // Durable state matches what was kept in memory.
        let log = Log::open(tmp.path()).expect("final reopen");
        prop_assert_eq!(log.last_index(), shadow.len() as u64);
        prop_assert_eq!(log.term_at(0), Some(0));

        for (offset, term) in shadow.iter().enumerate() {
            let index = offset as u64 + 1;
            let entry = log.get(index).expect("entry must exist");
            prop_assert_eq!(entry.index, index);
            prop_assert_eq!(entry.term, *term, "term mismatch at index {}", index);
            prop_assert_eq!(&entry.command, &index.to_be_bytes().to_vec());
        }

        // Terms never decrease along the log.
        prop_assert!(shadow.windows(2).all(|w| w[0] <= w[1]));

        for index in (log.last_index() + 1)..=(log.last_index() + 5) {
            prop_assert!(log.get(index).is_err());
            prop_assert_eq!(log.term_at(index), None);
        }

        let next = log.last_index() + 1;
        let gap = LogEntry::new(next + 1, 1, Vec::new());
        let mut log = log;
        prop_assert!(log.append(vec![gap]).is_err());
    }
}
