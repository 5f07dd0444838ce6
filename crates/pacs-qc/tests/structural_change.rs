//! 结构变更引擎集成测试

use pacs_core::{
    keywords, Attributes, Code, IdWithIssuer, Instance, Issuer, Location, PacsError, Patient, SeriesUid,
    SopInstanceUid, StudyUid,
};
use pacs_qc::{
    ArchiveStore, AuditTrigger, MergePathResolver, MergeRequest, PatientCommand, PatientOperationRequest, QcCommand,
    QcConfig, QcRequest, RecordingDeleteDispatcher, RejectionLedger, SegmentRequest, SplitRequest,
    StructuralChangeEngine, UpdateScope,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

struct Archive {
    store: ArchiveStore,
    engine: StructuralChangeEngine,
    config: QcConfig,
}

impl Archive {
    fn new() -> Self {
        Self {
            store: ArchiveStore::default(),
            engine: StructuralChangeEngine::new(Arc::new(RecordingDeleteDispatcher::new())),
            config: QcConfig::default(),
        }
    }

    fn req(&self) -> QcRequest<'_> {
        QcRequest::new(AuditTrigger::Interactive, &self.config)
    }

    fn patient(&self, pid: &str) {
        let mut tx = self.store.begin();
        tx.graph_mut()
            .add_patient(Patient::new(
                pid_of(pid),
                Attributes::from([(keywords::PATIENT_ID, pid), (keywords::ISSUER_OF_PATIENT_ID, "HOSP")]),
            ))
            .unwrap();
        tx.commit().unwrap();
    }

    /// 在已有患者下建立检查，每个系列 `count` 个实例
    fn study(&self, pid: &str, study: &str, series: &[(&str, usize)]) {
        let mut tx = self.store.begin();
        let graph = tx.graph_mut();
        let patient = graph.find_patients(&pid_of(pid))[0].id;
        let study_id = graph
            .create_study(patient, StudyUid::new(study), Attributes::from([(keywords::STUDY_DESCRIPTION, study)]))
            .unwrap();
        for (series_uid, count) in series {
            let series_id = graph
                .create_series(study_id, SeriesUid::new(*series_uid), Attributes::from([(keywords::MODALITY, "MR")]))
                .unwrap();
            for n in 1..=*count {
                let uid = format!("{}.{}", series_uid, n);
                let location = graph
                    .add_location(Location::new("fs1", format!("{}/{}.dcm", study, uid), "1.2.840.10008.1.2", 1024))
                    .unwrap();
                let mut instance = Instance::new(
                    SopInstanceUid::new(uid.as_str()),
                    "1.2.840.10008.5.1.4.1.1.4",
                    series_id,
                    Attributes::from([
                        (keywords::SOP_INSTANCE_UID, uid.as_str()),
                        (keywords::SERIES_INSTANCE_UID, *series_uid),
                        (keywords::STUDY_INSTANCE_UID, study),
                    ]),
                );
                instance.locations.push(location);
                graph.add_instance(instance).unwrap();
            }
        }
        tx.commit().unwrap();
    }

    fn series_uids(&self, study: &str) -> BTreeSet<String> {
        self.store.read(|state| {
            let study = state.graph.study_by_uid(&StudyUid::new(study)).unwrap();
            state
                .graph
                .series_of_study(study.id)
                .into_iter()
                .map(|id| state.graph.series(id).unwrap().series_uid.to_string())
                .collect()
        })
    }

    fn exists(&self, study: &str) -> bool {
        self.store.read(|state| state.graph.find_study(&StudyUid::new(study)).is_some())
    }
}

fn pid_of(id: &str) -> IdWithIssuer {
    IdWithIssuer::new(id, Some(Issuer::local("HOSP")))
}

fn sop(uid: &str) -> SopInstanceUid {
    SopInstanceUid::new(uid)
}

fn patient_attrs(id: &str) -> Attributes {
    Attributes::from([(keywords::PATIENT_ID, id), (keywords::ISSUER_OF_PATIENT_ID, "HOSP")])
}

#[test]
fn merge_unions_series_and_reaps_sources() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 2), ("1.1.2", 1)]);
    archive.study("P1", "1.2", &[("1.2.1", 3)]);
    archive.study("P1", "1.3", &[("1.3.1", 1)]);

    let mut expected = archive.series_uids("1.1");
    expected.extend(archive.series_uids("1.2"));
    expected.extend(archive.series_uids("1.3"));

    let mut tx = archive.store.begin();
    let request = MergeRequest {
        sources: vec![StudyUid::new("1.1"), StudyUid::new("1.2")],
        target: StudyUid::new("1.3"),
        study_attrs: Attributes::new(),
        series_attrs: Attributes::new(),
        reason: None,
    };
    let context = archive.engine.merge_studies(&mut tx, &archive.req(), &request).unwrap();
    assert_eq!(context.moved.len(), 6);
    assert_eq!(context.reaped.studies, vec![StudyUid::new("1.1"), StudyUid::new("1.2")]);
    archive.engine.commit(tx).unwrap();

    assert_eq!(archive.series_uids("1.3"), expected);
    assert!(!archive.exists("1.1"));
    assert!(!archive.exists("1.2"));
    archive.store.read(|state| {
        let moved = state.graph.instance_by_uid(&sop("1.1.1.1")).unwrap();
        assert_eq!(moved.attributes.get(keywords::STUDY_INSTANCE_UID), Some("1.3"));
        assert_eq!(state.history.len(), 1);
    });
}

#[test]
fn merge_leaves_rejected_instances_behind() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 2)]);
    archive.study("P1", "1.2", &[("1.2.1", 1)]);

    let mut tx = archive.store.begin();
    archive.engine.reject(&mut tx, &archive.req(), &[sop("1.1.1.1")], None).unwrap();
    let context = archive
        .engine
        .merge(&mut tx, &archive.req(), &StudyUid::new("1.1"), &StudyUid::new("1.2"), None)
        .unwrap();
    assert_eq!(context.moved, vec![sop("1.1.1.2")]);
    assert_eq!(context.created_series.len(), 1);
    assert!(context.reaped.is_empty());
    archive.engine.commit(tx).unwrap();

    assert!(archive.exists("1.1"));
    assert_eq!(archive.series_uids("1.1"), BTreeSet::from(["1.1.1".to_string()]));
}

#[test]
fn merge_across_patients_is_refused() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.patient("P2");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);
    archive.study("P2", "2.1", &[("2.1.1", 1)]);
    let before = archive.store.snapshot();

    let mut tx = archive.store.begin();
    let err = archive
        .engine
        .merge(&mut tx, &archive.req(), &StudyUid::new("1.1"), &StudyUid::new("2.1"), None)
        .unwrap_err();
    assert!(matches!(err, PacsError::OperationNotPermitted(_)));
    archive.engine.commit(tx).unwrap();

    assert_eq!(archive.series_uids("1.1"), BTreeSet::from(["1.1.1".to_string()]));
    assert_eq!(archive.series_uids("2.1"), BTreeSet::from(["2.1.1".to_string()]));
    let after = archive.store.snapshot();
    assert_eq!(serde_json::to_value(&before).unwrap(), serde_json::to_value(&after).unwrap());
}

#[test]
fn merge_of_merged_patients_resolves_to_same_patient() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.patient("P2");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);
    archive.study("P2", "2.1", &[("2.1.1", 1)]);

    let mut tx = archive.store.begin();
    let link = PatientOperationRequest {
        source: patient_attrs("P1"),
        target: patient_attrs("P2"),
        command: PatientCommand::Merge,
    };
    let context = archive.engine.patient_operation(&mut tx, &archive.req(), &link).unwrap();
    assert_eq!(context.moved_studies, vec![StudyUid::new("1.1")]);

    archive
        .engine
        .merge(&mut tx, &archive.req(), &StudyUid::new("1.1"), &StudyUid::new("2.1"), None)
        .unwrap();
    archive.engine.commit(tx).unwrap();
    assert!(!archive.exists("1.1"));
}

#[test]
fn reject_then_restore_round_trips_instance() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 2)]);
    let before = archive.store.read(|state| state.graph.instance_by_uid(&sop("1.1.1.1")).unwrap().clone());

    let code = Code::new("113037", "DCM", "Rejected for Patient Safety Reasons");
    let mut tx = archive.store.begin();
    let rejected = archive
        .engine
        .reject(&mut tx, &archive.req(), &[sop("1.1.1.1")], Some(&code))
        .unwrap();
    assert_eq!(rejected.rejected, vec![sop("1.1.1.1")]);
    assert!(!RejectionLedger::visible(tx.graph().instance_by_uid(&sop("1.1.1.1")).unwrap()));

    let restored = archive.engine.restore(&mut tx, &archive.req(), &[sop("1.1.1.1")]).unwrap();
    assert_eq!(restored.restored, vec![sop("1.1.1.1")]);
    archive.engine.commit(tx).unwrap();

    archive.store.read(|state| {
        let after = state.graph.instance_by_uid(&sop("1.1.1.1")).unwrap();
        assert!(RejectionLedger::visible(after));
        assert_eq!(after.attributes, before.attributes);
        assert_eq!(after.locations, before.locations);
        assert_eq!(after.series_id, before.series_id);
        for id in &after.locations {
            assert!(state.graph.location(*id).is_ok());
        }
    });
}

#[test]
fn second_reject_with_same_code_is_a_no_op() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);

    let mut tx = archive.store.begin();
    let first = archive.engine.reject(&mut tx, &archive.req(), &[sop("1.1.1.1")], None).unwrap();
    assert!(!first.is_empty());
    let second = archive.engine.reject(&mut tx, &archive.req(), &[sop("1.1.1.1")], None).unwrap();
    assert!(second.is_empty());
    assert_eq!(second.affected_instances(), 0);
    assert!(second.history_id.is_none());
    archive.engine.commit(tx).unwrap();

    assert_eq!(archive.store.read(|state| state.history.len()), 1);
}

#[test]
fn circular_patient_merge_is_detected() {
    let archive = Archive::new();
    archive.patient("A");
    archive.patient("B");

    let mut tx = archive.store.begin();
    let a_into_b = PatientOperationRequest {
        source: patient_attrs("A"),
        target: patient_attrs("B"),
        command: PatientCommand::Merge,
    };
    archive.engine.patient_operation(&mut tx, &archive.req(), &a_into_b).unwrap();
    archive.engine.commit(tx).unwrap();

    let mut tx = archive.store.begin();
    let b_into_a = PatientOperationRequest {
        source: patient_attrs("B"),
        target: patient_attrs("A"),
        command: PatientCommand::Merge,
    };
    let err = archive.engine.patient_operation(&mut tx, &archive.req(), &b_into_a).unwrap_err();
    assert!(matches!(err, PacsError::CircularMerge(_)));
    archive.engine.commit(tx).unwrap();

    archive.store.read(|state| {
        let a = state.graph.find_patients(&pid_of("A"))[0];
        let b = state.graph.find_patients(&pid_of("B"))[0];
        assert_eq!(a.merged_into, Some(b.id));
        assert_eq!(b.merged_into, None);
    });
}

#[test]
fn split_across_studies_moves_nothing() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);
    archive.study("P1", "1.2", &[("1.2.1", 1)]);
    let before = archive.store.snapshot();

    let mut tx = archive.store.begin();
    let request = SplitRequest {
        instances: vec![sop("1.1.1.1"), sop("1.2.1.1")],
        patient: pid_of("P1"),
        target: StudyUid::new("1.9"),
        created_study_attrs: Attributes::new(),
        series_attrs: Attributes::new(),
        reason: None,
    };
    let err = archive.engine.split(&mut tx, &archive.req(), &request).unwrap_err();
    assert!(matches!(err, PacsError::OperationNotPermitted(_)));
    archive.engine.commit(tx).unwrap();

    assert!(!archive.exists("1.9"));
    let after = archive.store.snapshot();
    assert_eq!(serde_json::to_value(&before).unwrap(), serde_json::to_value(&after).unwrap());
}

#[test]
fn split_creates_target_study_and_reaps_source() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 2)]);

    let mut tx = archive.store.begin();
    let request = SplitRequest {
        instances: vec![sop("1.1.1.1"), sop("1.1.1.2")],
        patient: pid_of("P1"),
        target: StudyUid::new("1.9"),
        created_study_attrs: Attributes::from([(keywords::STUDY_DESCRIPTION, "split")]),
        series_attrs: Attributes::new(),
        reason: None,
    };
    let context = archive.engine.split(&mut tx, &archive.req(), &request).unwrap();
    assert_eq!(context.created_studies, vec![StudyUid::new("1.9")]);
    assert_eq!(context.reaped.series, vec![SeriesUid::new("1.1.1")]);
    assert_eq!(context.reaped.studies, vec![StudyUid::new("1.1")]);
    archive.engine.commit(tx).unwrap();

    assert!(!archive.exists("1.1"));
    archive.store.read(|state| {
        let study = state.graph.study_by_uid(&StudyUid::new("1.9")).unwrap();
        assert_eq!(study.description(), Some("split"));
        assert_eq!(state.graph.instances_of_study(study.id).len(), 2);
        // 患者不随空检查级联删除
        assert_eq!(state.graph.counts().patients, 1);
    });
}

#[test]
fn replaced_is_idempotent_under_redelivery() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.2", &[("1.2.3", 0)]);
    {
        let mut tx = archive.store.begin();
        let graph = tx.graph_mut();
        let series = graph.series_by_uid(&SeriesUid::new("1.2.3")).unwrap().id;
        graph
            .add_instance(Instance::new(sop("1.2.3"), "1.2.840.10008.5.1.4.1.1.4", series, Attributes::new()))
            .unwrap();
        tx.commit().unwrap();
    }

    let mapping = BTreeMap::from([(sop("1.2.3"), sop("1.2.4"))]);
    let code = Code::new("113001", "DCM", "Rejected for Quality Reasons");

    let mut tx = archive.store.begin();
    let first = archive
        .engine
        .replaced(&mut tx, &archive.req(), &mapping, Some(&code))
        .unwrap()
        .expect("first delivery reports a context");
    assert_eq!(first.rejected, vec![sop("1.2.3")]);
    assert_eq!(first.replaced.len(), 1);
    archive.engine.commit(tx).unwrap();

    let mut tx = archive.store.begin();
    let second = archive.engine.replaced(&mut tx, &archive.req(), &mapping, Some(&code)).unwrap();
    assert!(second.is_none());
    archive.engine.commit(tx).unwrap();

    archive.store.read(|state| {
        let rejections = state
            .history
            .for_instance(&sop("1.2.3"))
            .filter(|record| record.rejection_code.is_some())
            .count();
        assert_eq!(rejections, 1);
    });
}

#[test]
fn delete_series_if_empty_only_removes_empty_series() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 1), ("1.1.2", 0)]);
    archive.study("P1", "1.2", &[("1.2.1", 0)]);

    let mut tx = archive.store.begin();
    let req = archive.req();
    assert!(!archive.engine.delete_series_if_empty(&mut tx, &req, &SeriesUid::new("1.1.1")).unwrap());
    assert!(tx.graph().find_series(&SeriesUid::new("1.1.1")).is_some());

    // 检查中仍有其他系列，不级联
    assert!(archive.engine.delete_series_if_empty(&mut tx, &req, &SeriesUid::new("1.1.2")).unwrap());
    assert!(tx.graph().find_study(&StudyUid::new("1.1")).is_some());

    assert!(archive.engine.delete_series_if_empty(&mut tx, &req, &SeriesUid::new("1.2.1")).unwrap());
    assert!(tx.graph().find_study(&StudyUid::new("1.2")).is_none());

    let err = archive
        .engine
        .delete_series_if_empty(&mut tx, &req, &SeriesUid::new("4.0.4"))
        .unwrap_err();
    assert!(matches!(err, PacsError::NotFound(_)));
    archive.engine.commit(tx).unwrap();
}

#[test]
fn delete_patient_if_empty_requires_no_studies() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.patient("P2");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);

    let mut tx = archive.store.begin();
    let req = archive.req();
    assert!(!archive.engine.delete_patient_if_empty(&mut tx, &req, &pid_of("P1")).unwrap());
    assert!(archive.engine.delete_patient_if_empty(&mut tx, &req, &pid_of("P2")).unwrap());
    archive.engine.commit(tx).unwrap();
    assert_eq!(archive.store.read(|state| state.graph.counts().patients), 1);
}

#[test]
fn concurrent_transactions_conflict_on_same_study() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);
    archive.study("P1", "1.2", &[("1.2.1", 1)]);
    archive.study("P1", "1.3", &[("1.3.1", 1)]);

    let mut first = archive.store.begin();
    let mut second = archive.store.begin();
    archive
        .engine
        .merge(&mut first, &archive.req(), &StudyUid::new("1.1"), &StudyUid::new("1.2"), None)
        .unwrap();
    archive
        .engine
        .merge(&mut second, &archive.req(), &StudyUid::new("1.1"), &StudyUid::new("1.3"), None)
        .unwrap();

    archive.engine.commit(first).unwrap();
    let err = archive.engine.commit(second).unwrap_err();
    assert!(matches!(err, PacsError::Conflict(_)));
    assert!(err.is_retryable());
    assert_eq!(archive.series_uids("1.2").len(), 2);
    assert_eq!(archive.series_uids("1.3").len(), 1);
}

#[test]
fn commands_replay_from_json() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 2)]);

    let commands: Vec<QcCommand> = serde_json::from_str(
        r#"[
            {"op": "reject", "instances": ["1.1.1.1"]},
            {"op": "update", "scope": {"level": "study", "id": "1.1"},
             "attributes": {"StudyDescription": "corrected"}},
            {"op": "delete_series_if_empty", "uid": "1.1.1"}
        ]"#,
    )
    .unwrap();

    let mut tx = archive.store.begin();
    let results: Vec<_> = commands
        .iter()
        .map(|command| command.execute(&archive.engine, &mut tx, &archive.req()).unwrap())
        .collect();
    archive.engine.commit(tx).unwrap();

    assert!(results[0].is_some());
    assert_eq!(
        results[1].as_ref().unwrap().updated_attributes,
        vec![keywords::STUDY_DESCRIPTION.to_string()]
    );
    assert!(results[2].is_none());
    archive.store.read(|state| {
        let study = state.graph.study_by_uid(&StudyUid::new("1.1")).unwrap();
        assert_eq!(study.description(), Some("corrected"));
    });
}

fn split_into(instance: &str, target: &str, series: &str) -> SplitRequest {
    SplitRequest {
        instances: vec![sop(instance)],
        patient: pid_of("P1"),
        target: StudyUid::new(target),
        created_study_attrs: Attributes::new(),
        series_attrs: Attributes::from([(keywords::SERIES_INSTANCE_UID, series)]),
        reason: None,
    }
}

fn merge_patient(source: &str, target: &str) -> PatientOperationRequest {
    PatientOperationRequest {
        source: patient_attrs(source),
        target: patient_attrs(target),
        command: PatientCommand::Merge,
    }
}

#[test]
fn concurrent_splits_into_same_new_study_conflict() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);
    archive.study("P1", "1.2", &[("1.2.1", 1)]);

    let mut first = archive.store.begin();
    let mut second = archive.store.begin();
    archive
        .engine
        .split(&mut first, &archive.req(), &split_into("1.1.1.1", "1.9", "1.9.1"))
        .unwrap();
    archive
        .engine
        .split(&mut second, &archive.req(), &split_into("1.2.1.1", "1.9", "1.9.1"))
        .unwrap();

    archive.engine.commit(first).unwrap();
    let err = archive.engine.commit(second).unwrap_err();
    assert!(matches!(err, PacsError::Conflict(_)));
    assert!(err.is_retryable());

    assert!(archive.exists("1.2"));
    assert_eq!(archive.series_uids("1.9"), BTreeSet::from(["1.9.1".to_string()]));
    let restored = ArchiveStore::from_snapshot(archive.store.snapshot()).unwrap();
    assert_eq!(restored.read(|state| state.graph.counts().studies), 2);

    // 重试时目标检查已存在，实例并入同一系列
    let mut retry = archive.store.begin();
    archive
        .engine
        .split(&mut retry, &archive.req(), &split_into("1.2.1.1", "1.9", "1.9.1"))
        .unwrap();
    archive.engine.commit(retry).unwrap();
    archive.store.read(|state| {
        let series = state.graph.series_by_uid(&SeriesUid::new("1.9.1")).unwrap();
        assert_eq!(state.graph.instances_of_series(series.id).len(), 2);
    });
}

#[test]
fn concurrent_opposite_patient_merges_conflict() {
    let archive = Archive::new();
    archive.patient("A");
    archive.patient("B");

    let mut first = archive.store.begin();
    let mut second = archive.store.begin();
    archive
        .engine
        .patient_operation(&mut first, &archive.req(), &merge_patient("A", "B"))
        .unwrap();
    archive
        .engine
        .patient_operation(&mut second, &archive.req(), &merge_patient("B", "A"))
        .unwrap();

    archive.engine.commit(first).unwrap();
    let err = archive.engine.commit(second).unwrap_err();
    assert!(matches!(err, PacsError::Conflict(_)));

    archive.store.read(|state| {
        let a = state.graph.find_patients(&pid_of("A"))[0].id;
        let b = state.graph.find_patients(&pid_of("B"))[0];
        assert_eq!(MergePathResolver::resolve(&state.graph, a).unwrap().id, b.id);
        assert_eq!(b.merged_into, None);
    });
}

#[test]
fn merged_away_patient_resolves_for_update_and_delete() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.patient("P2");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);
    archive.study("P2", "2.1", &[("2.1.1", 2)]);

    let mut tx = archive.store.begin();
    archive
        .engine
        .patient_operation(&mut tx, &archive.req(), &merge_patient("P1", "P2"))
        .unwrap();
    archive.engine.commit(tx).unwrap();

    let mut tx = archive.store.begin();
    let scope = UpdateScope::Patient(pid_of("P1"));
    let context = archive
        .engine
        .update_dicom_object(&mut tx, &archive.req(), &scope, &Attributes::from([(keywords::PATIENT_NAME, "Li^Si")]))
        .unwrap();
    assert_eq!(context.updated_attributes, vec![keywords::PATIENT_NAME.to_string()]);

    let context = archive.engine.delete_patient(&mut tx, &archive.req(), &pid_of("P1"), None).unwrap();
    assert_eq!(context.marked_for_delete.len(), 3);
    assert_eq!(context.patients, vec![pid_of("P2")]);
    archive.engine.commit(tx).unwrap();

    archive.store.read(|state| {
        let p1 = state.graph.find_patients(&pid_of("P1"))[0];
        let p2 = state.graph.find_patients(&pid_of("P2"))[0];
        assert_eq!(p2.attributes.get(keywords::PATIENT_NAME), Some("Li^Si"));
        assert_eq!(p1.attributes.get(keywords::PATIENT_NAME), None);
    });
}

#[test]
fn segment_clones_must_come_from_one_study() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);
    archive.study("P1", "1.2", &[("1.2.1", 1)]);
    let before = archive.store.snapshot();

    let mut tx = archive.store.begin();
    let request = SegmentRequest {
        to_move: Vec::new(),
        to_clone: vec![sop("1.1.1.1"), sop("1.2.1.1")],
        patient: pid_of("P1"),
        target: StudyUid::new("1.9"),
        study_attrs: Attributes::new(),
        series_attrs: Attributes::new(),
        reason: None,
    };
    let err = archive.engine.segment(&mut tx, &archive.req(), &request).unwrap_err();
    assert!(matches!(err, PacsError::OperationNotPermitted(_)));
    archive.engine.commit(tx).unwrap();

    assert!(!archive.exists("1.9"));
    let after = archive.store.snapshot();
    assert_eq!(serde_json::to_value(&before).unwrap(), serde_json::to_value(&after).unwrap());
}

#[test]
fn restore_of_delete_pending_instance_is_refused() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);

    let mut tx = archive.store.begin();
    archive
        .engine
        .delete_instance(&mut tx, &archive.req(), &sop("1.1.1.1"), None)
        .unwrap();
    let err = archive.engine.restore(&mut tx, &archive.req(), &[sop("1.1.1.1")]).unwrap_err();
    assert!(matches!(err, PacsError::OperationNotPermitted(_)));
    assert!(!RejectionLedger::visible(tx.graph().instance_by_uid(&sop("1.1.1.1")).unwrap()));
}

#[test]
fn locate_instances_and_find_patient() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 2)]);

    let tx = archive.store.begin();
    let found = archive
        .engine
        .locate_instances(&tx, &[sop("1.1.1.2"), sop("1.1.1.1")])
        .unwrap();
    let uids: Vec<&str> = found.iter().map(|i| i.sop_instance_uid.as_str()).collect();
    assert_eq!(uids, vec!["1.1.1.2", "1.1.1.1"]);

    let err = archive
        .engine
        .locate_instances(&tx, &[sop("1.1.1.1"), sop("4.0.4")])
        .unwrap_err();
    assert!(matches!(err, PacsError::NotFound(_)));

    let patient = archive.engine.find_patient(&tx, &patient_attrs("P1")).unwrap();
    assert_eq!(patient.pid, pid_of("P1"));
    let err = archive.engine.find_patient(&tx, &patient_attrs("P9")).unwrap_err();
    assert!(matches!(err, PacsError::NotFound(_)));
}

#[test]
fn find_patient_reports_ambiguous_identity() {
    let archive = Archive::new();
    archive.patient("P1");
    {
        let mut tx = archive.store.begin();
        tx.graph_mut()
            .add_patient(Patient::new(IdWithIssuer::new("P1", None), Attributes::new()))
            .unwrap();
        tx.commit().unwrap();
    }

    let tx = archive.store.begin();
    let err = archive
        .engine
        .find_patient(&tx, &Attributes::from([(keywords::PATIENT_ID, "P1")]))
        .unwrap_err();
    assert!(matches!(err, PacsError::NonUniquePatient(_)));
}

#[test]
fn pending_deletes_are_redispatched_after_reload() {
    let archive = Archive::new();
    archive.patient("P1");
    archive.study("P1", "1.1", &[("1.1.1", 1)]);
    let mut tx = archive.store.begin();
    let context = archive
        .engine
        .delete_study(&mut tx, &archive.req(), &StudyUid::new("1.1"), None)
        .unwrap();
    archive.engine.commit(tx).unwrap();
    let request = context.delete_request.unwrap();

    let store = ArchiveStore::from_snapshot(archive.store.snapshot()).unwrap();
    let dispatcher = Arc::new(RecordingDeleteDispatcher::new());
    let engine = StructuralChangeEngine::new(dispatcher.clone());
    assert_eq!(engine.redispatch_pending(&store).unwrap(), 1);
    assert_eq!(dispatcher.requests()[0].id, request);

    let mut tx = store.begin();
    engine.complete_delete(&mut tx, &archive.req(), request).unwrap();
    engine.commit(tx).unwrap();
    assert_eq!(engine.redispatch_pending(&store).unwrap(), 0);
    assert_eq!(dispatcher.requests().len(), 1);
}
