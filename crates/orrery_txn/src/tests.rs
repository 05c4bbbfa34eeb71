#[cfg(test)]
mod delta_tests {
    use crate::delta::{DeltaBook, DeltaChange, FieldDelta, ObjectDelta};
    use orrery_common::error::TxnError;
    use orrery_common::types::{FieldId, FieldImage, FieldValue, Invid, VectorValue};
    use proptest::prelude::*;

    fn s(v: &str) -> VectorValue {
        VectorValue::Str(v.to_string())
    }

    const F: FieldId = FieldId(7);

    #[test]
    fn test_add_then_delete_cancels() {
        let mut record = FieldDelta::vector(F);
        record.add_value(s("A")).unwrap();
        record.add_value(s("B")).unwrap();
        record.del_value(s("A")).unwrap();
        assert_eq!(record.added(), &[s("B")]);
        assert!(record.removed().is_empty());
    }

    #[test]
    fn test_delete_then_add_cancels() {
        let mut record = FieldDelta::vector(F);
        record.del_value(s("A")).unwrap();
        record.add_value(s("A")).unwrap();
        assert!(record.is_empty());
    }

    #[test]
    fn test_repeated_add_is_idempotent() {
        let mut record = FieldDelta::vector(F);
        record.add_value(s("A")).unwrap();
        record.add_value(s("A")).unwrap();
        assert_eq!(record.added(), &[s("A")]);
        // a single delete undoes it
        record.del_value(s("A")).unwrap();
        assert!(record.is_empty());
    }

    #[test]
    fn test_scalar_last_write_wins() {
        let mut record = FieldDelta::scalar(F, Some(FieldValue::Int(1)));
        record.record_scalar(Some(FieldValue::Int(2))).unwrap();
        record.record_scalar(None).unwrap();
        assert_eq!(record.change(), &DeltaChange::Scalar(None));
        assert!(!record.is_empty());
    }

    #[test]
    fn test_mode_mismatch() {
        let mut scalar = FieldDelta::scalar(F, None);
        assert!(matches!(
            scalar.add_value(s("A")),
            Err(TxnError::DeltaModeMismatch { actual: "scalar", attempted: "vector", .. })
        ));
        let mut vector = FieldDelta::vector(F);
        assert!(matches!(
            vector.record_scalar(None),
            Err(TxnError::DeltaModeMismatch { actual: "vector", attempted: "scalar", .. })
        ));
    }

    #[test]
    fn test_merge_vector_onto_full_value() {
        let mut record = FieldDelta::scalar(F, Some(FieldValue::Vector(vec![s("A"), s("B")])));
        let mut later = FieldDelta::vector(F);
        later.add_value(s("C")).unwrap();
        later.del_value(s("A")).unwrap();
        record.merge(later).unwrap();
        assert_eq!(
            record.change(),
            &DeltaChange::Scalar(Some(FieldValue::Vector(vec![s("B"), s("C")])))
        );
    }

    #[test]
    fn test_diff_and_apply() {
        let invid = Invid::new(3, 9);
        let old: FieldImage = [
            (FieldId(1), FieldValue::Str("alpha".into())),
            (FieldId(2), FieldValue::Vector(vec![s("x"), s("y")])),
            (FieldId(3), FieldValue::Bool(true)),
        ]
        .into_iter()
        .collect();
        let new: FieldImage = [
            (FieldId(1), FieldValue::Str("beta".into())),
            (FieldId(2), FieldValue::Vector(vec![s("y"), s("z")])),
            (FieldId(4), FieldValue::Int(12)),
        ]
        .into_iter()
        .collect();

        let delta = ObjectDelta::diff(invid, &old, &new);
        let vector = delta.field(FieldId(2)).unwrap();
        assert_eq!(vector.added(), &[s("z")]);
        assert_eq!(vector.removed(), &[s("x")]);
        assert_eq!(
            delta.field(FieldId(3)).unwrap().change(),
            &DeltaChange::Scalar(None)
        );
        assert_eq!(delta.apply(invid, &old).unwrap(), new);
    }

    #[test]
    fn test_apply_rejects_foreign_object() {
        let delta = ObjectDelta::new(Invid::new(1, 1));
        assert!(matches!(
            delta.apply(Invid::new(1, 2), &FieldImage::new()),
            Err(TxnError::DeltaIdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_book_keeps_first_touched_order_and_prunes() {
        let a = Invid::new(1, 5);
        let b = Invid::new(1, 2);
        let mut book = DeltaBook::new();
        book.record_add(a, F, s("x")).unwrap();
        book.record_scalar(b, FieldId(1), Some(FieldValue::Int(3))).unwrap();
        book.record_remove(a, F, s("x")).unwrap();
        let c = Invid::new(1, 1);
        book.record_add(c, F, s("q")).unwrap();

        let out = book.finalize();
        let order: Vec<Invid> = out.iter().map(|d| d.invid).collect();
        assert_eq!(order, vec![b, c]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        Del(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..4).prop_map(Op::Add), (0u8..4).prop_map(Op::Del)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_vector_record_matches_net_counter(ops in proptest::collection::vec(op(), 0..40)) {
            let mut record = FieldDelta::vector(F);
            let mut state = [0i8; 4];
            for op in &ops {
                match op {
                    Op::Add(v) => {
                        record.add_value(s(&v.to_string())).unwrap();
                        state[*v as usize] = (state[*v as usize] + 1).min(1);
                    }
                    Op::Del(v) => {
                        record.del_value(s(&v.to_string())).unwrap();
                        state[*v as usize] = (state[*v as usize] - 1).max(-1);
                    }
                }
            }
            for (v, net) in state.iter().enumerate() {
                let value = s(&v.to_string());
                prop_assert_eq!(record.added().contains(&value), *net == 1);
                prop_assert_eq!(record.removed().contains(&value), *net == -1);
            }
            for value in record.added() {
                prop_assert!(!record.removed().contains(value));
            }
        }
    }
}

#[cfg(test)]
mod checkpoint_tests {
    use std::sync::Arc;

    use crate::edit_set::EditSet;
    use crate::store::{MemoryObjectStore, ObjectStatus, ObjectStore, SessionDeleteLocks};
    use orrery_common::error::TxnError;
    use orrery_common::types::{FieldId, FieldValue, Invid, SessionId, TxnId, VectorValue};
    use orrery_storage::event::LogEvent;

    const NAME: FieldId = FieldId(1);
    const MEMBERS: FieldId = FieldId(2);
    const A: Invid = Invid::new(4, 1);
    const B: Invid = Invid::new(4, 2);

    struct Fixture {
        store: Arc<MemoryObjectStore>,
        locks: Arc<SessionDeleteLocks>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryObjectStore::new());
            store.insert(A, [(NAME, FieldValue::Str("a".into()))].into_iter().collect());
            store.insert(B, [(NAME, FieldValue::Str("b".into()))].into_iter().collect());
            Self {
                store,
                locks: Arc::new(SessionDeleteLocks::new()),
            }
        }

        fn begin(&self, txn: u64) -> EditSet {
            EditSet::new(
                TxnId(txn),
                SessionId(1),
                Some(Invid::new(1, 1)),
                "admin",
                self.store.clone(),
                self.locks.clone(),
            )
        }
    }

    fn name_of(set: &EditSet, invid: Invid) -> Option<FieldValue> {
        set.field_values(invid).and_then(|img| img.get(NAME).cloned())
    }

    #[test]
    fn test_rollback_restores_fields_and_events() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.set_field(A, NAME, FieldValue::Str("a1".into())).unwrap();
        set.log(LogEvent::new("objectchanged", "a1"));
        set.checkpoint("cp");
        set.set_field(A, NAME, FieldValue::Str("a2".into())).unwrap();
        set.set_field(B, NAME, FieldValue::Str("b2".into())).unwrap();
        set.log(LogEvent::new("objectchanged", "a2"));

        assert!(set.rollback("cp").unwrap());
        assert_eq!(name_of(&set, A), Some(FieldValue::Str("a1".into())));
        // B was checked out after the checkpoint
        assert!(set.field_values(B).is_none());
        assert_eq!(fx.store.holder(B), None);
        assert_eq!(fx.store.holder(A), Some(TxnId(1)));
        assert_eq!(set.events().len(), 1);
        assert!(set.checkpoint_names().is_empty());
        set.abort();
    }

    #[test]
    fn test_rollback_unknown_name() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        assert!(!set.rollback("nope").unwrap());
        set.abort();
    }

    #[test]
    fn test_restore_is_repeatable() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.set_field(A, NAME, FieldValue::Str("a1".into())).unwrap();
        set.checkpoint("cp");
        let cp = set.pop_checkpoint("cp").unwrap();

        set.set_field(A, NAME, FieldValue::Str("x".into())).unwrap();
        set.restore(&cp).unwrap();
        let first = set.objects().to_vec();

        set.set_field(A, NAME, FieldValue::Str("y".into())).unwrap();
        set.set_field(B, NAME, FieldValue::Str("y".into())).unwrap();
        set.restore(&cp).unwrap();
        assert_eq!(set.objects(), first.as_slice());
        set.abort();
    }

    fn apply_edits(set: &mut EditSet) {
        set.set_field(A, NAME, FieldValue::Str("a2".into())).unwrap();
        set.add_value(A, MEMBERS, VectorValue::Str("x".into())).unwrap();
        set.add_value(A, MEMBERS, VectorValue::Str("y".into())).unwrap();
        set.checkpoint("inner");
        set.del_value(A, MEMBERS, &VectorValue::Str("x".into())).unwrap();
        set.delete_object(B).unwrap();
        set.log(LogEvent::new("objectchanged", "a2 members"));
        set.log(LogEvent::new("objectdeleted", "b"));
    }

    fn event_summary(set: &EditSet) -> Vec<(String, String)> {
        set.events()
            .iter()
            .map(|e| (e.class_token.clone(), e.description.clone()))
            .collect()
    }

    #[test]
    fn test_replay_after_rollback_reproduces_state() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.set_field(A, NAME, FieldValue::Str("a1".into())).unwrap();
        set.log(LogEvent::new("objectchanged", "a1"));
        set.checkpoint("cp");

        apply_edits(&mut set);
        let objects = set.objects().to_vec();
        let events = event_summary(&set);
        let deltas = set.deltas().unwrap();
        assert_eq!(set.checkpoint_names(), vec!["cp", "inner"]);

        assert!(set.rollback("cp").unwrap());
        assert_eq!(name_of(&set, A), Some(FieldValue::Str("a1".into())));
        assert_eq!(fx.store.holder(B), None);

        set.checkpoint("cp");
        apply_edits(&mut set);
        assert_eq!(set.objects(), objects.as_slice());
        assert_eq!(event_summary(&set), events);
        assert_eq!(set.deltas().unwrap(), deltas);
        assert_eq!(set.checkpoint_names(), vec!["cp", "inner"]);
        assert_eq!(fx.store.holder(B), Some(TxnId(1)));
        set.abort();
    }

    #[test]
    fn test_pop_checkpoint_drops_later_ones() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.checkpoint("a");
        set.checkpoint("b");
        set.checkpoint("c");
        assert_eq!(set.pop_checkpoint("b").unwrap().name(), "b");
        assert_eq!(set.checkpoint_names(), vec!["a"]);
        assert!(set.pop_checkpoint("c").is_none());
        set.abort();
    }

    #[test]
    fn test_nested_rollback_collapses_to_outer() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.edit_object(A).unwrap();
        set.checkpoint("outer");
        let at_outer = set.objects().to_vec();

        set.set_field(A, NAME, FieldValue::Str("1".into())).unwrap();
        set.checkpoint("inner");
        set.set_field(B, NAME, FieldValue::Str("2".into())).unwrap();
        assert!(set.rollback("inner").unwrap());
        set.set_field(A, NAME, FieldValue::Str("3".into())).unwrap();
        assert!(set.rollback("outer").unwrap());

        assert_eq!(set.objects(), at_outer.as_slice());
        set.abort();
    }

    #[test]
    fn test_rollback_discards_later_checkpoints() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.checkpoint("one");
        set.checkpoint("two");
        set.checkpoint("three");
        assert!(set.rollback("two").unwrap());
        assert_eq!(set.checkpoint_names(), vec!["one"]);
        set.abort();
    }

    #[test]
    fn test_checkpoint_before_any_edit_resets_everything() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.checkpoint("start");
        set.set_field(A, NAME, FieldValue::Str("changed".into())).unwrap();
        let created = set.create_object(4);
        set.delete_object(B).unwrap();
        set.log(LogEvent::new("objectcreated", "new"));

        assert!(set.rollback("start").unwrap());
        assert!(set.objects().is_empty());
        assert!(set.events().is_empty());
        assert_eq!(fx.store.holder(A), None);
        assert_eq!(fx.store.holder(B), None);
        // the reserved identity was discarded
        assert_eq!(fx.store.holder(created), None);
        assert!(fx.store.get(created).is_none());
        set.abort();
    }

    #[test]
    fn test_rollback_undeletes() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.edit_object(A).unwrap();
        set.checkpoint("cp");
        set.delete_object(A).unwrap();
        assert_eq!(set.status(A), Some(ObjectStatus::Deleting));
        assert!(matches!(set.edit_object(A), Err(TxnError::ObjectDeleted(_))));
        set.rollback("cp").unwrap();
        assert_eq!(set.status(A), Some(ObjectStatus::Editing));
        set.abort();
    }

    #[test]
    fn test_rollback_reverts_deletion_locks() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        fx.locks.acquire(SessionId(1), A);
        set.checkpoint("cp");
        fx.locks.acquire(SessionId(1), B);
        fx.locks.release(SessionId(1), A);
        set.rollback("cp").unwrap();
        assert!(fx.locks.is_locked(A));
        assert!(!fx.locks.is_locked(B));
        set.abort();
    }

    #[test]
    fn test_external_release_forces_abort() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.edit_object(A).unwrap();
        set.checkpoint("cp");
        fx.store.release(A, TxnId(1));
        fx.store.check_out(A, TxnId(2)).unwrap();

        let err = set.rollback("cp").unwrap_err();
        assert!(matches!(err, TxnError::ExternalModification { invid, .. } if invid == A));
        assert!(set.must_abort());
        set.abort();
    }

    #[test]
    fn test_foreign_checkpoint_is_rejected() {
        let fx = Fixture::new();
        let mut first = fx.begin(1);
        first.checkpoint("cp");
        let cp = first.pop_checkpoint("cp").unwrap();
        let mut second = fx.begin(2);
        assert!(matches!(
            second.restore(&cp),
            Err(TxnError::CheckpointMismatch {
                checkpoint: TxnId(1),
                txn: TxnId(2)
            })
        ));
        assert!(!second.must_abort());
        first.abort();
        second.abort();
    }

    #[test]
    fn test_deltas_and_install() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.set_field(A, NAME, FieldValue::Str("renamed".into())).unwrap();
        set.delete_object(B).unwrap();
        let created = set.create_object(4);
        set.set_field(created, NAME, FieldValue::Str("new".into())).unwrap();
        let dropped = set.create_object(4);
        set.delete_object(dropped).unwrap();

        let deltas = set.deltas().unwrap();
        let invids: Vec<Invid> = deltas.iter().map(|d| d.invid).collect();
        assert_eq!(invids, vec![A, B, created]);

        set.install();
        assert_eq!(
            fx.store.get(A).and_then(|img| img.get(NAME).cloned()),
            Some(FieldValue::Str("renamed".into()))
        );
        assert!(fx.store.get(B).is_none());
        assert!(fx.store.get(created).is_some());
        assert!(fx.store.get(dropped).is_none());
        assert_eq!(fx.store.holder(A), None);
    }

    #[test]
    fn test_abort_releases_and_restores_locks() {
        let fx = Fixture::new();
        let mut set = fx.begin(1);
        set.set_field(A, NAME, FieldValue::Str("x".into())).unwrap();
        fx.locks.acquire(SessionId(1), B);
        set.abort();
        assert_eq!(fx.store.holder(A), None);
        assert_eq!(fx.store.get(A).unwrap().get(NAME), Some(&FieldValue::Str("a".into())));
        assert!(!fx.locks.is_locked(B));
    }

    #[test]
    fn test_object_busy_in_other_transaction() {
        let fx = Fixture::new();
        let mut first = fx.begin(1);
        let mut second = fx.begin(2);
        first.edit_object(A).unwrap();
        assert!(matches!(
            second.edit_object(A),
            Err(TxnError::ObjectBusy { holder: TxnId(1), .. })
        ));
        first.abort();
        second.abort();
    }
}
