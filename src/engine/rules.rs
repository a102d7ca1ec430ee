//! Matching Rules — the pure decision half of the engine.
//!
//! `decide` never writes; it reads the canonical store through the `CsView`
//! trait and returns what the mutator should do. Locked canonicals are
//! invisible to every lookup, which is what makes the lock protection layer
//! work without special-casing each rule.

use rusqlite::Connection;
use uuid::Uuid;

use super::{EngineError, ReconcileEvent};
use crate::db::repository;
use crate::db::DatabaseError;
use crate::models::{CanonicalPatient, MatchType, MobilePrereg, RawPatient, Source};

/// What the mutator should do with a raw-record event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    UseExisting {
        canonical_id: Uuid,
        match_type: MatchType,
    },
    Create {
        match_type: MatchType,
    },
    Merge {
        winner: Uuid,
        loser: Uuid,
    },
    LockedSkip {
        canonical_id: Uuid,
    },
}

/// Read-only canonical-store lookups the rules run against.
///
/// Implementations must hide canonicals with `matching_locked = true` from
/// the source-HIS and document lookups; `canonical_by_id` is exempt (the
/// rules need it to detect the locked state itself).
pub trait CsView {
    fn canonical_by_id(&self, id: &Uuid) -> Result<Option<CanonicalPatient>, DatabaseError>;

    fn canonical_by_source_his(
        &self,
        source: Source,
        his_number: &str,
    ) -> Result<Option<CanonicalPatient>, DatabaseError>;

    fn canonical_by_document(
        &self,
        doc_type: i32,
        doc_number: i64,
        exclude: Option<&Uuid>,
    ) -> Result<Option<CanonicalPatient>, DatabaseError>;

    fn prereg_by_source_his(
        &self,
        source: Source,
        his_number: &str,
    ) -> Result<Option<MobilePrereg>, DatabaseError>;
}

/// Live view over the registry database.
pub struct SqliteView<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteView<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl CsView for SqliteView<'_> {
    fn canonical_by_id(&self, id: &Uuid) -> Result<Option<CanonicalPatient>, DatabaseError> {
        repository::get_canonical(self.conn, id)
    }

    fn canonical_by_source_his(
        &self,
        source: Source,
        his_number: &str,
    ) -> Result<Option<CanonicalPatient>, DatabaseError> {
        repository::find_canonical_by_source_his(self.conn, source, his_number)
    }

    fn canonical_by_document(
        &self,
        doc_type: i32,
        doc_number: i64,
        exclude: Option<&Uuid>,
    ) -> Result<Option<CanonicalPatient>, DatabaseError> {
        repository::find_canonical_by_document(self.conn, doc_type, doc_number, exclude)
    }

    fn prereg_by_source_his(
        &self,
        source: Source,
        his_number: &str,
    ) -> Result<Option<MobilePrereg>, DatabaseError> {
        repository::find_prereg_by_source_his(self.conn, source, his_number)
    }
}

/// Compute the decision for an event against the current store state.
pub fn decide(event: &ReconcileEvent, view: &dyn CsView) -> Result<Decision, EngineError> {
    let raw = event.raw();
    match raw.canonical_id {
        Some(canonical_id) => decide_update(event, canonical_id, view),
        None => decide_insert(raw, view),
    }
}

/// Insertion path: fixed priority, first match wins.
fn decide_insert(raw: &RawPatient, view: &dyn CsView) -> Result<Decision, EngineError> {
    // 1. Mobile pre-registration reservation
    if let Some(prereg) = view.prereg_by_source_his(raw.source, &raw.his_number)? {
        match view.canonical_by_id(&prereg.canonical_id)? {
            // A locked canonical is invisible even to its own reservation
            Some(c) if c.matching_locked => {}
            Some(_) => {
                return Ok(Decision::UseExisting {
                    canonical_id: prereg.canonical_id,
                    match_type: MatchType::MobileAppUpdate,
                })
            }
            None => {
                return Ok(Decision::UseExisting {
                    canonical_id: prereg.canonical_id,
                    match_type: MatchType::MobileAppNew,
                })
            }
        }
    }

    // 2. Same-source HIS identifier
    if let Some(c) = view.canonical_by_source_his(raw.source, &raw.his_number)? {
        return Ok(Decision::UseExisting {
            canonical_id: c.canonical_id,
            match_type: MatchType::UpdatedExisting,
        });
    }

    // 3. Cross-source document match
    if let Some((doc_type, doc_number)) = raw.document() {
        if let Some(c) = view.canonical_by_document(doc_type, doc_number, None)? {
            return Ok(Decision::UseExisting {
                canonical_id: c.canonical_id,
                match_type: MatchType::MatchedDocument,
            });
        }
    }

    // 4. Fresh insertion
    Ok(Decision::Create {
        match_type: if raw.document().is_some() {
            MatchType::NewWithDoc
        } else {
            MatchType::NewNoDoc
        },
    })
}

/// Update path: a known raw record was re-emitted with changed fields.
fn decide_update(
    event: &ReconcileEvent,
    canonical_id: Uuid,
    view: &dyn CsView,
) -> Result<Decision, EngineError> {
    let raw = event.raw();
    let canonical = match view.canonical_by_id(&canonical_id)? {
        Some(c) => c,
        // Stale assignment; merges rewrite raw references before deleting,
        // so this only happens under external interference.
        None => return decide_insert(raw, view),
    };

    if canonical.matching_locked {
        // A locked canonical still accepts its own source's field updates;
        // an identity-affecting document change is frozen out entirely, so
        // the merge check below can never run against it.
        if event.doc_changed() {
            return Ok(Decision::LockedSkip { canonical_id });
        }
        return Ok(Decision::UseExisting {
            canonical_id,
            match_type: MatchType::RegularUpdate,
        });
    }

    if event.doc_changed() {
        if let Some((doc_type, doc_number)) = raw.document() {
            if let Some(other) = view.canonical_by_document(doc_type, doc_number, Some(&canonical_id))? {
                let (winner, loser) = pick_winner(&canonical, &other);
                return Ok(Decision::Merge { winner, loser });
            }
        }
    }

    Ok(Decision::UseExisting {
        canonical_id,
        match_type: MatchType::RegularUpdate,
    })
}

/// Merge tie-break: the mobile-registered side wins; otherwise the
/// lexicographically smaller canonical id. Changing this requires migrating
/// historical merges in the audit log.
fn pick_winner(a: &CanonicalPatient, b: &CanonicalPatient) -> (Uuid, Uuid) {
    match (a.registered_via_mobile, b.registered_via_mobile) {
        (true, false) => (a.canonical_id, b.canonical_id),
        (false, true) => (b.canonical_id, a.canonical_id),
        _ => {
            if a.canonical_id <= b.canonical_id {
                (a.canonical_id, b.canonical_id)
            } else {
                (b.canonical_id, a.canonical_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    /// Pure in-memory view so rule ordering is testable without a database.
    #[derive(Default)]
    struct StubView {
        canonicals: Vec<CanonicalPatient>,
        preregs: Vec<MobilePrereg>,
    }

    impl CsView for StubView {
        fn canonical_by_id(&self, id: &Uuid) -> Result<Option<CanonicalPatient>, DatabaseError> {
            Ok(self.canonicals.iter().find(|c| c.canonical_id == *id).cloned())
        }

        fn canonical_by_source_his(
            &self,
            source: Source,
            his_number: &str,
        ) -> Result<Option<CanonicalPatient>, DatabaseError> {
            Ok(self
                .canonicals
                .iter()
                .find(|c| {
                    !c.matching_locked && c.slot(source).his_number.as_deref() == Some(his_number)
                })
                .cloned())
        }

        fn canonical_by_document(
            &self,
            doc_type: i32,
            doc_number: i64,
            exclude: Option<&Uuid>,
        ) -> Result<Option<CanonicalPatient>, DatabaseError> {
            Ok(self
                .canonicals
                .iter()
                .find(|c| {
                    !c.matching_locked
                        && c.document() == Some((doc_type, doc_number))
                        && exclude != Some(&c.canonical_id)
                })
                .cloned())
        }

        fn prereg_by_source_his(
            &self,
            source: Source,
            his_number: &str,
        ) -> Result<Option<MobilePrereg>, DatabaseError> {
            Ok(self
                .preregs
                .iter()
                .find(|p| p.his_number(source) == Some(his_number))
                .cloned())
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2026-03-01 12:00:00", "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn raw(source: Source, his: &str) -> RawPatient {
        RawPatient {
            raw_id: 1,
            his_number: his.into(),
            source,
            business_unit: None,
            last_name: None,
            first_name: None,
            middle_name: None,
            birth_date: None,
            doc_type: None,
            doc_number: None,
            email: None,
            phone: None,
            his_password: None,
            login_email: None,
            canonical_id: None,
            processed_at: None,
        }
    }

    fn canonical_with(source: Source, his: &str) -> CanonicalPatient {
        let mut c = CanonicalPatient::new(Uuid::new_v4(), source, now());
        c.slot_mut(source).his_number = Some(his.into());
        c
    }

    fn prereg_for(canonical_id: Uuid, qms: Option<&str>) -> MobilePrereg {
        MobilePrereg {
            prereg_id: 1,
            canonical_id,
            his_number_qms: qms.map(Into::into),
            his_number_infoclinica: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn fresh_raw_without_document_creates() {
        let view = StubView::default();
        let event = ReconcileEvent::Insert { raw: raw(Source::Qms, "Q1") };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::Create { match_type: MatchType::NewNoDoc }
        );
    }

    #[test]
    fn fresh_raw_with_document_creates_with_doc() {
        let view = StubView::default();
        let mut r = raw(Source::Qms, "Q1");
        r.doc_type = Some(1);
        r.doc_number = Some(1000);
        let event = ReconcileEvent::Insert { raw: r };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::Create { match_type: MatchType::NewWithDoc }
        );
    }

    #[test]
    fn prereg_wins_over_source_and_document_rules() {
        let reserved = Uuid::new_v4();
        let mut view = StubView::default();
        view.preregs.push(prereg_for(reserved, Some("Q1")));
        // A canonical that would match by source-HIS if rule 2 ran first
        view.canonicals.push(canonical_with(Source::Qms, "Q1"));

        let event = ReconcileEvent::Insert { raw: raw(Source::Qms, "Q1") };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::UseExisting {
                canonical_id: reserved,
                match_type: MatchType::MobileAppNew,
            }
        );
    }

    #[test]
    fn prereg_with_materialized_canonical_is_update() {
        let mut view = StubView::default();
        let c = canonical_with(Source::Qms, "Q1");
        view.preregs.push(prereg_for(c.canonical_id, Some("Q1")));
        view.canonicals.push(c.clone());

        let event = ReconcileEvent::Insert { raw: raw(Source::Qms, "Q1") };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::UseExisting {
                canonical_id: c.canonical_id,
                match_type: MatchType::MobileAppUpdate,
            }
        );
    }

    #[test]
    fn prereg_of_locked_canonical_falls_through() {
        let mut view = StubView::default();
        let mut c = canonical_with(Source::Qms, "Q1");
        c.matching_locked = true;
        view.preregs.push(prereg_for(c.canonical_id, Some("Q1")));
        view.canonicals.push(c);

        let event = ReconcileEvent::Insert { raw: raw(Source::Qms, "Q1") };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::Create { match_type: MatchType::NewNoDoc }
        );
    }

    #[test]
    fn same_source_his_matches_existing() {
        let mut view = StubView::default();
        let c = canonical_with(Source::Infoclinica, "I1");
        view.canonicals.push(c.clone());

        let event = ReconcileEvent::Insert { raw: raw(Source::Infoclinica, "I1") };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::UseExisting {
                canonical_id: c.canonical_id,
                match_type: MatchType::UpdatedExisting,
            }
        );
    }

    #[test]
    fn document_matches_across_sources() {
        let mut view = StubView::default();
        let mut c = canonical_with(Source::Qms, "Q1");
        c.doc_type = Some(1);
        c.doc_number = Some(1000);
        view.canonicals.push(c.clone());

        let mut r = raw(Source::Infoclinica, "I1");
        r.doc_type = Some(1);
        r.doc_number = Some(1000);
        let event = ReconcileEvent::Insert { raw: r };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::UseExisting {
                canonical_id: c.canonical_id,
                match_type: MatchType::MatchedDocument,
            }
        );
    }

    #[test]
    fn locked_canonical_invisible_creates_new() {
        let mut view = StubView::default();
        let mut c = canonical_with(Source::Qms, "Q1");
        c.doc_type = Some(1);
        c.doc_number = Some(1000);
        c.matching_locked = true;
        view.canonicals.push(c);

        let mut r = raw(Source::Qms, "QNEW");
        r.doc_type = Some(1);
        r.doc_number = Some(1000);
        let event = ReconcileEvent::Insert { raw: r };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::Create { match_type: MatchType::NewWithDoc }
        );
    }

    #[test]
    fn update_without_doc_change_is_regular() {
        let mut view = StubView::default();
        let c = canonical_with(Source::Qms, "Q1");
        view.canonicals.push(c.clone());

        let mut old = raw(Source::Qms, "Q1");
        old.canonical_id = Some(c.canonical_id);
        let mut new = old.clone();
        new.first_name = Some("Anna".into());
        let event = ReconcileEvent::Update { old, new };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::UseExisting {
                canonical_id: c.canonical_id,
                match_type: MatchType::RegularUpdate,
            }
        );
    }

    #[test]
    fn doc_change_matching_other_canonical_merges() {
        let mut view = StubView::default();
        let own = canonical_with(Source::Qms, "Q2");
        let mut other = canonical_with(Source::Infoclinica, "I2");
        other.doc_type = Some(1);
        other.doc_number = Some(2000);
        view.canonicals.push(own.clone());
        view.canonicals.push(other.clone());

        let mut old = raw(Source::Qms, "Q2");
        old.canonical_id = Some(own.canonical_id);
        let mut new = old.clone();
        new.doc_type = Some(1);
        new.doc_number = Some(2000);
        let event = ReconcileEvent::Update { old, new };

        let expected = if own.canonical_id <= other.canonical_id {
            Decision::Merge { winner: own.canonical_id, loser: other.canonical_id }
        } else {
            Decision::Merge { winner: other.canonical_id, loser: own.canonical_id }
        };
        assert_eq!(decide(&event, &view).unwrap(), expected);
    }

    #[test]
    fn mobile_side_wins_merge_regardless_of_id_order() {
        let mut view = StubView::default();
        let mut own = canonical_with(Source::Qms, "Q2");
        own.registered_via_mobile = true;
        let mut other = canonical_with(Source::Infoclinica, "I2");
        other.doc_type = Some(1);
        other.doc_number = Some(2000);
        view.canonicals.push(own.clone());
        view.canonicals.push(other.clone());

        let mut old = raw(Source::Qms, "Q2");
        old.canonical_id = Some(own.canonical_id);
        let mut new = old.clone();
        new.doc_type = Some(1);
        new.doc_number = Some(2000);
        let event = ReconcileEvent::Update { old, new };

        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::Merge { winner: own.canonical_id, loser: other.canonical_id }
        );
    }

    #[test]
    fn locked_canonical_accepts_own_source_field_update() {
        let mut view = StubView::default();
        let mut c = canonical_with(Source::Qms, "Q1");
        c.matching_locked = true;
        view.canonicals.push(c.clone());

        let mut old = raw(Source::Qms, "Q1");
        old.canonical_id = Some(c.canonical_id);
        let mut new = old.clone();
        new.first_name = Some("Anna".into());
        let event = ReconcileEvent::Update { old, new };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::UseExisting {
                canonical_id: c.canonical_id,
                match_type: MatchType::RegularUpdate,
            }
        );
    }

    #[test]
    fn update_of_locked_canonical_is_skipped() {
        let mut view = StubView::default();
        let mut c = canonical_with(Source::Qms, "Q1");
        c.matching_locked = true;
        view.canonicals.push(c.clone());

        let mut old = raw(Source::Qms, "Q1");
        old.canonical_id = Some(c.canonical_id);
        let mut new = old.clone();
        new.doc_type = Some(1);
        new.doc_number = Some(9000);
        let event = ReconcileEvent::Update { old, new };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::LockedSkip { canonical_id: c.canonical_id }
        );
    }

    #[test]
    fn doc_change_with_no_other_match_is_regular_update() {
        let mut view = StubView::default();
        let c = canonical_with(Source::Qms, "Q1");
        view.canonicals.push(c.clone());

        let mut old = raw(Source::Qms, "Q1");
        old.canonical_id = Some(c.canonical_id);
        let mut new = old.clone();
        new.doc_type = Some(1);
        new.doc_number = Some(7000);
        let event = ReconcileEvent::Update { old, new };
        assert_eq!(
            decide(&event, &view).unwrap(),
            Decision::UseExisting {
                canonical_id: c.canonical_id,
                match_type: MatchType::RegularUpdate,
            }
        );
    }
}
