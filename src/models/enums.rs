use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(Source {
    Qms => "qms",
    Infoclinica => "infoclinica",
});

impl Source {
    /// All configured HIS systems, in canonical column order.
    pub const ALL: [Source; 2] = [Source::Qms, Source::Infoclinica];
}

str_enum!(BusinessUnit {
    Hadassah => "hadassah",
    Medscan => "medscan",
    Yauza => "yauza",
});

str_enum!(MatchType {
    NewNoDoc => "new_no_doc",
    NewWithDoc => "new_with_doc",
    UpdatedExisting => "updated_existing",
    MatchedDocument => "matched_document",
    MobileAppNew => "mobile_app_new",
    MobileAppUpdate => "mobile_app_update",
    MergedOnUpdate => "merged_on_update",
    RegularUpdate => "regular_update",
    LockedSkip => "locked_skip",
    ManualMerge => "manual_merge",
});

impl MatchType {
    /// True for the decision kinds that insert a brand-new canonical row.
    pub fn creates_canonical(&self) -> bool {
        matches!(self, Self::NewNoDoc | Self::NewWithDoc | Self::MobileAppNew)
    }
}
