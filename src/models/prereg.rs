use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::Source;

/// A canonical-id reservation created by the mobile onboarding service
/// before either HIS has produced a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MobilePrereg {
    pub prereg_id: i64,
    pub canonical_id: Uuid,
    pub his_number_qms: Option<String>,
    pub his_number_infoclinica: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl MobilePrereg {
    pub fn his_number(&self, source: Source) -> Option<&str> {
        match source {
            Source::Qms => self.his_number_qms.as_deref(),
            Source::Infoclinica => self.his_number_infoclinica.as_deref(),
        }
    }
}

/// Ingest-side pre-registration from the mobile onboarding service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMobilePrereg {
    pub canonical_id: Uuid,
    pub his_number_qms: Option<String>,
    pub his_number_infoclinica: Option<String>,
}

impl NewMobilePrereg {
    pub fn validate(&self) -> Result<(), String> {
        if self.his_number_qms.is_none() && self.his_number_infoclinica.is_none() {
            return Err("a pre-registration needs at least one HIS number".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_a_his_number() {
        let prereg = NewMobilePrereg {
            canonical_id: Uuid::new_v4(),
            his_number_qms: None,
            his_number_infoclinica: None,
        };
        assert!(prereg.validate().is_err());
    }

    #[test]
    fn his_number_selects_by_source() {
        let prereg = MobilePrereg {
            prereg_id: 1,
            canonical_id: Uuid::new_v4(),
            his_number_qms: Some("Q3".into()),
            his_number_infoclinica: None,
            created_at: Default::default(),
            updated_at: Default::default(),
        };
        assert_eq!(prereg.his_number(Source::Qms), Some("Q3"));
        assert_eq!(prereg.his_number(Source::Infoclinica), None);
    }
}
