use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
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

str_enum!(PeerStatus {
    Paired => "paired",
    Unpaired => "unpaired",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn peer_status_round_trips_through_str() {
        for status in [PeerStatus::Paired, PeerStatus::Unpaired] {
            assert_eq!(PeerStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_peer_status_is_rejected() {
        let err = PeerStatus::from_str("blocked").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidEnum { .. }));
    }
}
