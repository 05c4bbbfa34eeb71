#[cfg(test)]
mod journal_tests {
    use crate::journal::{Journal, JOURNAL_HEADER_SIZE};
    use orrery_common::config::JournalSyncMode;
    use orrery_common::error::StorageError;
    use orrery_common::types::TxnNumber;

    fn open(dir: &tempfile::TempDir) -> Journal {
        Journal::open(&dir.path().join("orrery.journal"), JournalSyncMode::None).unwrap()
    }

    #[test]
    fn test_new_journal_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        assert!(journal.is_clean());
        assert_eq!(journal.transactions_in_journal(), 0);
        assert_eq!(journal.last_transaction_number(), TxnNumber(0));
        let len = std::fs::metadata(journal.path()).unwrap().len();
        assert_eq!(len, JOURNAL_HEADER_SIZE as u64);
    }

    #[test]
    fn test_write_finalize_numbers_are_gap_free() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        for _ in 0..20 {
            let entry = journal.write_transaction("admin", &vec![1u8, 2, 3]).unwrap();
            journal.finalize(&entry).unwrap();
        }
        let numbers: Vec<u64> = journal
            .entries()
            .unwrap()
            .iter()
            .map(|e| e.transaction_number.0)
            .collect();
        assert_eq!(numbers, (1..=20).collect::<Vec<_>>());
        assert_eq!(journal.transactions_in_journal(), 20);
        assert!(!journal.is_clean());
    }

    #[test]
    fn test_append_rejects_non_increasing_number() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        journal.append(TxnNumber(5), 1000).unwrap();
        let err = journal.append(TxnNumber(5), 1001).unwrap_err();
        assert!(matches!(
            err,
            StorageError::JournalOutOfOrder {
                last: TxnNumber(5),
                attempted: TxnNumber(5)
            }
        ));
        assert!(journal.append(TxnNumber(4), 1002).is_err());
        journal.append(TxnNumber(6), 1003).unwrap();
        assert_eq!(journal.transactions_in_journal(), 2);
    }

    #[test]
    fn test_undo_truncates_and_reuses_number() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        let first = journal.write_transaction("admin", &"a").unwrap();
        journal.finalize(&first).unwrap();
        let len_after_first = std::fs::metadata(journal.path()).unwrap().len();

        let second = journal.write_transaction("admin", &"b").unwrap();
        assert_eq!(second.transaction_number, TxnNumber(2));
        journal.undo(&second).unwrap();
        assert_eq!(
            std::fs::metadata(journal.path()).unwrap().len(),
            len_after_first
        );

        let retry = journal.write_transaction("admin", &"c").unwrap();
        assert_eq!(retry.transaction_number, TxnNumber(2));
        journal.finalize(&retry).unwrap();
        assert_eq!(journal.transactions_in_journal(), 2);
    }

    #[test]
    fn test_only_one_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        let entry = journal.write_transaction("admin", &0u32).unwrap();
        assert!(matches!(
            journal.write_transaction("admin", &0u32),
            Err(StorageError::JournalTransactionPending(TxnNumber(1)))
        ));
        journal.finalize(&entry).unwrap();
        // finalizing twice is a caller bug
        assert!(matches!(
            journal.finalize(&entry),
            Err(StorageError::UnknownJournalEntry(_))
        ));
    }

    #[test]
    fn test_reopen_restores_counters() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = open(&dir);
            for _ in 0..3 {
                let e = journal.write_transaction("admin", &()).unwrap();
                journal.finalize(&e).unwrap();
            }
        }
        let journal = open(&dir);
        assert_eq!(journal.transactions_in_journal(), 3);
        assert_eq!(journal.last_transaction_number(), TxnNumber(3));
        assert!(journal.incomplete_transaction().is_none());
    }

    #[test]
    fn test_reopen_detects_incomplete_transaction() {
        let dir = tempfile::tempdir().unwrap();
        {
            let journal = open(&dir);
            let e = journal.write_transaction("admin", &()).unwrap();
            journal.finalize(&e).unwrap();
            // crash between open record and finalize
            let _dangling = journal.write_transaction("admin", &()).unwrap();
        }
        let journal = open(&dir);
        let incomplete = journal.incomplete_transaction().unwrap();
        assert_eq!(incomplete.transaction_number, TxnNumber(2));
        assert_eq!(journal.last_transaction_number(), TxnNumber(1));
        assert!(journal.write_transaction("admin", &()).is_err());

        journal.clear_incomplete_transaction().unwrap();
        assert!(journal.incomplete_transaction().is_none());
        let e = journal.write_transaction("admin", &()).unwrap();
        assert_eq!(e.transaction_number, TxnNumber(2));
        journal.finalize(&e).unwrap();

        drop(journal);
        let journal = open(&dir);
        assert!(journal.incomplete_transaction().is_none());
        assert_eq!(journal.transactions_in_journal(), 2);
    }

    #[test]
    fn test_undo_discards_buffered_record() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        let first = journal.write_transaction("admin", &vec![7u8; 64]).unwrap();
        journal.finalize(&first).unwrap();
        let committed_len = std::fs::metadata(journal.path()).unwrap().len();

        // large enough to spill part of the record past the write buffer
        let big = journal.write_transaction("admin", &vec![9u8; 20_000]).unwrap();
        journal.undo(&big).unwrap();
        assert_eq!(std::fs::metadata(journal.path()).unwrap().len(), committed_len);

        let small = journal.write_transaction("admin", &vec![1u8]).unwrap();
        journal.undo(&small).unwrap();
        assert_eq!(std::fs::metadata(journal.path()).unwrap().len(), committed_len);

        for _ in 0..2 {
            let e = journal.write_transaction("admin", &vec![2u8]).unwrap();
            journal.finalize(&e).unwrap();
        }
        drop(journal);

        let journal = open(&dir);
        assert!(journal.incomplete_transaction().is_none());
        assert_eq!(journal.transactions_in_journal(), 3);
        assert_eq!(journal.last_transaction_number(), TxnNumber(3));
        let numbers: Vec<u64> = journal
            .entries()
            .unwrap()
            .iter()
            .map(|e| e.transaction_number.0)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_torn_tail_is_dropped_on_open() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orrery.journal");
        {
            let journal = open(&dir);
            journal.append(TxnNumber(1), 10).unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xff, 0x00, 0x00, 0x00, 1, 2]).unwrap();
        }
        let journal = open(&dir);
        assert_eq!(journal.transactions_in_journal(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);
        journal.append(TxnNumber(2), 11).unwrap();
        assert_eq!(journal.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orrery.journal");
        std::fs::write(&path, b"not a journal at all").unwrap();
        assert!(matches!(
            Journal::open(&path, JournalSyncMode::None),
            Err(StorageError::JournalCorrupt(_))
        ));
    }

    #[test]
    fn test_reset_keeps_old_file_and_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        journal.append(TxnNumber(1), 1).unwrap();
        journal.append(TxnNumber(2), 2).unwrap();
        journal.reset().unwrap();

        assert!(journal.is_clean());
        assert!(dir.path().join("orrery.journal.old").exists());
        let e = journal.write_transaction("admin", &()).unwrap();
        assert_eq!(e.transaction_number, TxnNumber(3));
        journal.finalize(&e).unwrap();

        drop(journal);
        let journal = open(&dir);
        assert_eq!(journal.transactions_in_journal(), 1);
        assert_eq!(journal.last_transaction_number(), TxnNumber(3));
    }

    #[test]
    fn test_reset_refused_while_transaction_open() {
        let dir = tempfile::tempdir().unwrap();
        let journal = open(&dir);
        let _e = journal.write_transaction("admin", &()).unwrap();
        assert!(journal.reset().is_err());
    }
}

#[cfg(test)]
mod event_log_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use orrery_common::error::StorageError;
    use orrery_common::types::{now_millis, Invid, TxnNumber};
    use parking_lot::Mutex;

    use crate::audit::{AuditLog, Mailer};
    use crate::event::LogEvent;
    use crate::event_log::{EventLog, FileEventLog, HistoryQuery, TeeEventLog};

    /// Records everything written to it.
    #[derive(Default)]
    struct MemorySink {
        events: Mutex<Vec<LogEvent>>,
        history_calls: AtomicUsize,
        closed: AtomicUsize,
    }

    impl EventLog for MemorySink {
        fn name(&self) -> String {
            "memory".into()
        }
        fn write(&self, event: &LogEvent) -> Result<(), StorageError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
        fn retrieve_history(&self, _query: &HistoryQuery) -> Result<String, StorageError> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            Ok("memory history".into())
        }
        fn flush_and_sync(&self) -> Result<(), StorageError> {
            Ok(())
        }
        fn close(&self) -> Result<(), StorageError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails every write.
    #[derive(Default)]
    struct BrokenSink {
        attempts: AtomicUsize,
        history_calls: AtomicUsize,
    }

    impl EventLog for BrokenSink {
        fn name(&self) -> String {
            "broken".into()
        }
        fn write(&self, _event: &LogEvent) -> Result<(), StorageError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StorageError::SinkClosed("broken".into()))
        }
        fn retrieve_history(&self, _query: &HistoryQuery) -> Result<String, StorageError> {
            self.history_calls.fetch_add(1, Ordering::SeqCst);
            Ok("broken history".into())
        }
        fn flush_and_sync(&self) -> Result<(), StorageError> {
            Ok(())
        }
        fn close(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Mailer for RecordingMailer {
        fn send(&self, recipients: &str, subject: &str, _body: &str) -> Result<(), String> {
            self.sent.lock().push((recipients.to_string(), subject.to_string()));
            Ok(())
        }
    }

    const USER: Invid = Invid::new(3, 10);
    const OTHER: Invid = Invid::new(3, 11);
    const ADMIN: Invid = Invid::new(1, 1);

    fn event(class: &str, time_ms: i64, objects: Vec<Invid>) -> LogEvent {
        LogEvent::new(class, format!("{} at {}", class, time_ms))
            .at(time_ms)
            .by(Some(ADMIN), "supergash")
            .with_objects(objects)
    }

    // ── tee sink ──

    #[test]
    fn test_tee_write_isolates_failing_member() {
        let broken = Arc::new(BrokenSink::default());
        let healthy = Arc::new(MemorySink::default());
        let tee = TeeEventLog::new(vec![
            broken.clone() as Arc<dyn EventLog>,
            healthy.clone() as Arc<dyn EventLog>,
        ]);

        tee.write(&event("objectchanged", 1, vec![USER])).unwrap();

        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.events.lock().len(), 1);
    }

    #[test]
    fn test_tee_write_fails_when_every_member_fails() {
        let a = Arc::new(BrokenSink::default());
        let b = Arc::new(BrokenSink::default());
        let tee = TeeEventLog::new(vec![
            a.clone() as Arc<dyn EventLog>,
            b.clone() as Arc<dyn EventLog>,
        ]);

        assert!(tee.write(&event("objectchanged", 1, vec![USER])).is_err());
        assert_eq!(a.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(b.attempts.load(Ordering::SeqCst), 1);

        let empty = TeeEventLog::new(Vec::new());
        assert!(matches!(
            empty.write(&event("objectchanged", 2, vec![USER])),
            Err(StorageError::SinkClosed(_))
        ));
    }

    #[test]
    fn test_audit_counts_failure_through_dead_tee() {
        let tee = TeeEventLog::new(vec![Arc::new(BrokenSink::default()) as Arc<dyn EventLog>]);
        let audit = AuditLog::new(Arc::new(tee));
        audit.record_login(USER, "jdoe");
        assert_eq!(audit.failed_writes(), 1);

        let healthy = TeeEventLog::new(vec![
            Arc::new(BrokenSink::default()) as Arc<dyn EventLog>,
            Arc::new(MemorySink::default()) as Arc<dyn EventLog>,
        ]);
        let audit = AuditLog::new(Arc::new(healthy));
        audit.record_login(USER, "jdoe");
        assert_eq!(audit.failed_writes(), 0);
    }

    #[test]
    fn test_tee_history_consults_first_member_only() {
        let first = Arc::new(BrokenSink::default());
        let second = Arc::new(MemorySink::default());
        let tee = TeeEventLog::new(vec![
            first.clone() as Arc<dyn EventLog>,
            second.clone() as Arc<dyn EventLog>,
        ]);

        let text = tee.retrieve_history(&HistoryQuery::default()).unwrap();
        assert_eq!(text, "broken history");
        assert_eq!(first.history_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.history_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tee_close_empties_member_list() {
        let a = Arc::new(MemorySink::default());
        let b = Arc::new(MemorySink::default());
        let tee = TeeEventLog::new(vec![
            a.clone() as Arc<dyn EventLog>,
            b.clone() as Arc<dyn EventLog>,
        ]);
        tee.close().unwrap();
        assert!(tee.is_empty());
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
        assert_eq!(b.closed.load(Ordering::SeqCst), 1);

        // a second close has nobody left to close
        tee.close().unwrap();
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tee_add_remove_sink() {
        let tee = TeeEventLog::new(Vec::new());
        let sink: Arc<dyn EventLog> = Arc::new(MemorySink::default());
        tee.add_sink(sink.clone());
        assert_eq!(tee.len(), 1);
        assert!(tee.remove_sink(&sink));
        assert!(!tee.remove_sink(&sink));
        assert_eq!(tee.retrieve_history(&HistoryQuery::default()).unwrap(), "");
    }

    // ── file sink ──

    #[test]
    fn test_file_sink_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::open(&dir.path().join("orrery.log")).unwrap();
        log.write(&event("objectchanged", 1, vec![USER])).unwrap();
        log.close().unwrap();
        assert!(matches!(
            log.write(&event("objectchanged", 2, vec![USER])),
            Err(StorageError::SinkClosed(_))
        ));
    }

    #[test]
    fn test_history_time_window_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::open(&dir.path().join("orrery.log")).unwrap();
        for t in [100, 200, 300, 400] {
            log.write(&event("objectchanged", t, vec![USER])).unwrap();
        }
        let query = HistoryQuery::for_object(USER).between(Some(200), Some(300));
        let text = log.retrieve_history(&query).unwrap();
        assert!(!text.contains("at 100"));
        assert!(text.contains("at 200"));
        assert!(text.contains("at 300"));
        assert!(!text.contains("at 400"));
    }

    #[test]
    fn test_history_filters_by_object_and_admin() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::open(&dir.path().join("orrery.log")).unwrap();
        log.write(&event("objectchanged", 1, vec![USER])).unwrap();
        log.write(&event("objectcreated", 2, vec![OTHER])).unwrap();

        let text = log.retrieve_history(&HistoryQuery::for_object(USER)).unwrap();
        assert!(text.contains("objectchanged"));
        assert!(!text.contains("objectcreated"));

        let text = log.retrieve_history(&HistoryQuery::for_admin(ADMIN)).unwrap();
        assert!(text.contains("objectchanged"));
        assert!(text.contains("objectcreated"));

        let text = log.retrieve_history(&HistoryQuery::for_admin(USER)).unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn test_history_login_toggle_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::open(&dir.path().join("orrery.log")).unwrap();
        log.write(&event("normallogin", 1, vec![USER])).unwrap();
        log.write(&event("objectchanged", 2, vec![USER])).unwrap();
        log.write(&event("normallogout", 3, vec![USER])).unwrap();

        let logins = log
            .retrieve_history(&HistoryQuery::for_object(USER).login_events_only(true))
            .unwrap();
        assert!(logins.contains("normallogin"));
        assert!(logins.contains("normallogout"));
        assert!(!logins.contains("objectchanged"));

        let others = log.retrieve_history(&HistoryQuery::for_object(USER)).unwrap();
        assert!(others.contains("objectchanged"));
        assert!(!others.contains("normallogin"));
    }

    #[test]
    fn test_history_full_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileEventLog::open(&dir.path().join("orrery.log")).unwrap());
        let audit = AuditLog::new(sink.clone());
        let events = vec![
            Arc::new(event("objectchanged", 10, vec![USER])),
            Arc::new(event("objectcreated", 11, vec![OTHER])),
        ];
        audit.log_transaction(TxnNumber(7), Some(ADMIN), "supergash", &events);

        let partial = sink.retrieve_history(&HistoryQuery::for_object(USER)).unwrap();
        assert!(partial.contains("---------- Transaction"));
        assert!(partial.contains("objectchanged\n\t"));
        assert!(!partial.contains("objectcreated"));
        assert!(partial.contains("---------- End Transaction"));

        let full = sink
            .retrieve_history(&HistoryQuery::for_object(USER).full_transactions(true))
            .unwrap();
        assert!(full.contains("objectchanged"));
        assert!(full.contains("objectcreated"));
    }

    #[test]
    fn test_history_standalone_and_comment_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileEventLog::open(&dir.path().join("orrery.log")).unwrap();
        log.write(&event("objectchanged", 1, vec![USER])).unwrap();
        let mut comment = event("comment", 2, vec![USER]);
        comment.description = "disabled pending review".into();
        log.write(&comment).unwrap();

        let text = log.retrieve_history(&HistoryQuery::for_object(USER)).unwrap();
        assert!(text.contains(": supergash objectchanged\n\tobjectchanged at 1\n"));
        assert!(text.ends_with("\n\ndisabled pending review\n"));
    }

    // ── audit front-end ──

    #[test]
    fn test_audit_stamps_transaction_and_brackets() {
        let sink = Arc::new(MemorySink::default());
        let audit = AuditLog::new(sink.clone());
        let events = vec![Arc::new(event("objectchanged", 10, vec![USER]))];
        audit.log_transaction(TxnNumber(3), Some(ADMIN), "supergash", &events);

        let written = sink.events.lock();
        let classes: Vec<&str> = written.iter().map(|e| e.class_token.as_str()).collect();
        assert_eq!(
            classes,
            vec!["starttransaction", "objectchanged", "finishtransaction"]
        );
        assert!(written.iter().all(|e| e.transaction_id == Some(TxnNumber(3))));
        assert_eq!(written[0].objects, vec![USER]);
        // the caller's copy is untouched
        assert_eq!(events[0].transaction_id, None);
    }

    #[test]
    fn test_audit_transaction_events_carry_commit_time() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FileEventLog::open(&dir.path().join("orrery.log")).unwrap());
        let audit = AuditLog::new(sink.clone());

        // queued a minute before the commit
        let queued = now_millis() - 60_000;
        let events = vec![Arc::new(event("objectchanged", queued, vec![USER]))];
        let commit_start = now_millis();
        audit.log_transaction(TxnNumber(9), Some(ADMIN), "supergash", &events);

        let content = std::fs::read_to_string(dir.path().join("orrery.log")).unwrap();
        let times: Vec<i64> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| LogEvent::parse(line).unwrap().time_ms)
            .collect();
        assert_eq!(times.len(), 3);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(times.iter().all(|&t| t >= commit_start));

        let text = sink
            .retrieve_history(&HistoryQuery::for_object(USER).between(Some(queued + 1000), None))
            .unwrap();
        assert!(text.contains("objectchanged"));
        assert!(text.contains("---------- End Transaction"));
    }

    #[test]
    fn test_audit_mails_events_with_recipients() {
        let sink = Arc::new(MemorySink::default());
        let mailer = Arc::new(RecordingMailer::default());
        let audit = AuditLog::new(sink).with_mailer(mailer.clone());

        audit.log_event(
            event("objectchanged", 1, vec![USER])
                .with_mail("User changed", vec!["a@x".into(), "b@x".into()]),
        );
        audit.log_event(event("objectchanged", 2, vec![USER]));

        let sent = mailer.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], ("a@x,b@x".to_string(), "User changed".to_string()));
        assert_eq!(audit.mails_sent(), 1);
    }

    #[test]
    fn test_audit_survives_broken_sink() {
        let audit = AuditLog::new(Arc::new(BrokenSink::default()));
        audit.record_login(USER, "jdoe");
        audit.record_logout(USER, "jdoe", false);
        assert_eq!(audit.total_events(), 2);
        assert_eq!(audit.failed_writes(), 2);
    }
}
